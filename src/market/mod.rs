//! Market data module
//!
//! Reference data (instruments) and last-known market snapshots, kept in sync
//! with the venue's full snapshots and sparse real-time updates.

mod cache;
pub mod parser;

pub use cache::SnapshotCache;
pub use parser::{
    normalize_time, parse_dictionary, parse_snapshot, parse_update, MarketUpdate, SnapshotField,
};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Width of the venue-assigned global instrument id
pub const GLID_LEN: usize = 12;
/// Minor-unit scale applied to integer prices unless the venue says otherwise
pub const DEFAULT_PRICE_DECIMALS: u32 = 2;

/// Build the `GLID + symbol` key that identifies an instrument
pub fn instrument_key(glid: &str, symbol: &str) -> String {
    format!("{}{}", glid, symbol)
}

/// Split a key into GLID and symbol
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    if key.len() <= GLID_LEN || !key.is_char_boundary(GLID_LEN) {
        return None;
    }
    Some(key.split_at(GLID_LEN))
}

/// Tradeable instrument from the reference-data dictionary
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    pub glid: String,
    pub symbol: String,
    pub name: String,
    pub local_code: String,
    pub isin: String,
}

impl Instrument {
    pub fn key(&self) -> String {
        instrument_key(&self.glid, &self.symbol)
    }
}

/// Last-known market data for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub key: String,
    pub bid_price: Option<Decimal>,
    pub bid_quantity: Option<u64>,
    pub ask_price: Option<Decimal>,
    pub ask_quantity: Option<u64>,
    pub last_price: Option<Decimal>,
    pub last_quantity: Option<u64>,
    /// `HH:MM:SS[.fraction]`
    pub last_time: Option<String>,
    pub volume: Option<u64>,
    pub variation: Option<Decimal>,
    /// `+` or `-`
    pub variation_sign: Option<String>,
    pub open: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub close: Option<Decimal>,
    pub suspended: bool,
    pub trading_phase: Option<String>,
    pub price_decimals: u32,
    pub local_code: Option<String>,
    pub isin: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MarketSnapshot {
    /// Empty record for `key`
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            bid_price: None,
            bid_quantity: None,
            ask_price: None,
            ask_quantity: None,
            last_price: None,
            last_quantity: None,
            last_time: None,
            volume: None,
            variation: None,
            variation_sign: None,
            open: None,
            high: None,
            low: None,
            close: None,
            suspended: false,
            trading_phase: None,
            price_decimals: DEFAULT_PRICE_DECIMALS,
            local_code: None,
            isin: None,
            updated_at: None,
        }
    }

    pub fn glid(&self) -> Option<&str> {
        split_key(&self.key).map(|(glid, _)| glid)
    }

    pub fn symbol(&self) -> Option<&str> {
        split_key(&self.key).map(|(_, symbol)| symbol)
    }

    /// Percentage variation with its sign applied
    pub fn signed_variation(&self) -> Option<Decimal> {
        let variation = self.variation?;
        match self.variation_sign.as_deref() {
            Some("-") => Some(-variation.abs()),
            _ => Some(variation),
        }
    }

    /// Mid price when both sides are quoted
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.bid_price, self.ask_price) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
            _ => None,
        }
    }
}
