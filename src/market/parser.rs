//! Parsers for market-data payloads
//!
//! Dictionary and snapshot payloads are positional: a field's meaning is its
//! index. Real-time updates carry an explicit field number before each value.
//! Both paths share the `SnapshotField` table below. The indices are specific
//! to the protocol version the venue runs.

use std::str::FromStr;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::{split_key, Instrument, MarketSnapshot};
use crate::metrics;
use crate::protocol::field::{FieldReader, LENGTH_OFFSET};

/// Upper bound on positional fields read from one snapshot
pub const MAX_SNAPSHOT_FIELDS: usize = 128;
/// Fields per dictionary record: key, name, local code, ISIN, separator
const DICTIONARY_RECORD_FIELDS: usize = 5;

/// Named market-data attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotField {
    BidPrice,
    BidQuantity,
    AskPrice,
    AskQuantity,
    LastPrice,
    LastQuantity,
    LastTime,
    Volume,
    Variation,
    VariationSign,
    Open,
    High,
    Low,
    Close,
    Suspended,
    TradingPhase,
    PriceDecimals,
    LocalCode,
    Isin,
}

impl SnapshotField {
    /// Positional index in a full snapshot
    pub fn from_position(index: usize) -> Option<Self> {
        use SnapshotField::*;
        let field = match index {
            1 => BidPrice,
            2 => BidQuantity,
            3 => AskPrice,
            4 => AskQuantity,
            5 => LastPrice,
            6 => LastQuantity,
            7 => LastTime,
            8 => Volume,
            9 => Variation,
            10 => VariationSign,
            11 => Open,
            12 => High,
            13 => Low,
            14 => Close,
            15 => Suspended,
            16 => TradingPhase,
            17 => PriceDecimals,
            42 => LocalCode,
            88 => Isin,
            _ => return None,
        };
        Some(field)
    }

    /// Field number carried by a real-time update; numbers mirror positions
    pub fn from_update_number(number: u8) -> Option<Self> {
        Self::from_position(number as usize)
    }

    pub fn position(self) -> usize {
        use SnapshotField::*;
        match self {
            BidPrice => 1,
            BidQuantity => 2,
            AskPrice => 3,
            AskQuantity => 4,
            LastPrice => 5,
            LastQuantity => 6,
            LastTime => 7,
            Volume => 8,
            Variation => 9,
            VariationSign => 10,
            Open => 11,
            High => 12,
            Low => 13,
            Close => 14,
            Suspended => 15,
            TradingPhase => 16,
            PriceDecimals => 17,
            LocalCode => 42,
            Isin => 88,
        }
    }

    pub fn update_number(self) -> u8 {
        self.position() as u8
    }
}

/// Sparse set of field changes for one instrument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketUpdate {
    pub key: String,
    pub fields: Vec<(SnapshotField, String)>,
}

impl MarketUpdate {
    /// Apply every field, in arrival order, to `snapshot`
    pub fn apply_to(&self, snapshot: &mut MarketSnapshot) {
        apply_fields(snapshot, &self.fields);
        snapshot.updated_at = Some(Utc::now());
    }
}

/// Parse a dictionary response: repeated `[key, name, local code, ISIN, separator]`
pub fn parse_dictionary(payload: &[u8]) -> Vec<Instrument> {
    let mut reader = FieldReader::new(payload);
    let mut instruments = Vec::new();

    loop {
        let mut record = Vec::with_capacity(DICTIONARY_RECORD_FIELDS);
        while record.len() < DICTIONARY_RECORD_FIELDS {
            match reader.next_field() {
                Some(field) => record.push(field),
                None => break,
            }
        }
        if record.len() < DICTIONARY_RECORD_FIELDS {
            if !record.is_empty() {
                debug!(fields = record.len(), "Ignoring trailing partial dictionary record");
            }
            break;
        }

        let Some((glid, symbol)) = split_key(&record[0]) else {
            warn!(key = %record[0], "Dictionary record with malformed key");
            metrics::record_decode_error("dictionary_key");
            continue;
        };

        instruments.push(Instrument {
            glid: glid.to_string(),
            symbol: symbol.to_string(),
            name: record[1].clone(),
            local_code: record[2].clone(),
            isin: record[3].clone(),
        });
    }

    instruments
}

/// Parse a full snapshot into a fresh record
pub fn parse_snapshot(payload: &[u8]) -> Option<MarketSnapshot> {
    let mut reader = FieldReader::new(payload);
    let key = reader.next_field()?;
    if split_key(&key).is_none() {
        warn!(key = %key, "Snapshot with malformed instrument key");
        metrics::record_decode_error("snapshot_key");
        return None;
    }

    let mut fields = Vec::new();
    let mut index = 1;
    while index < MAX_SNAPSHOT_FIELDS {
        let Some(value) = reader.next_field() else {
            break;
        };
        if let Some(field) = SnapshotField::from_position(index) {
            fields.push((field, value));
        }
        index += 1;
    }

    let mut snapshot = MarketSnapshot::new(&key);
    apply_fields(&mut snapshot, &fields);
    snapshot.updated_at = Some(Utc::now());
    Some(snapshot)
}

/// Parse a real-time update: key, then `(field number + 32, value)` entries
pub fn parse_update(payload: &[u8]) -> Option<MarketUpdate> {
    let mut reader = FieldReader::new(payload);
    let key = reader.next_field()?;
    if split_key(&key).is_none() {
        warn!(key = %key, "Update with malformed instrument key");
        metrics::record_decode_error("update_key");
        return None;
    }

    let mut fields = Vec::new();
    while let Some(marker) = reader.next_byte() {
        if marker < LENGTH_OFFSET {
            warn!(key = %key, marker, "Malformed field number, dropping rest of update");
            metrics::record_decode_error("update_field_number");
            break;
        }
        let number = marker - LENGTH_OFFSET;
        let Some(value) = reader.next_field() else {
            warn!(key = %key, number, "Truncated update field");
            metrics::record_decode_error("update_field");
            break;
        };

        match SnapshotField::from_update_number(number) {
            Some(field) => fields.push((field, value)),
            None => debug!(key = %key, number, "Skipping unknown update field"),
        }
    }

    Some(MarketUpdate { key, fields })
}

/// Apply decoded fields. The price scale is read first so prices in the same
/// batch use it.
fn apply_fields(snapshot: &mut MarketSnapshot, fields: &[(SnapshotField, String)]) {
    for (_, raw) in fields.iter().filter(|(f, _)| *f == SnapshotField::PriceDecimals) {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        match raw.parse::<u32>() {
            Ok(decimals) if decimals <= 10 => snapshot.price_decimals = decimals,
            _ => warn!(key = %snapshot.key, raw = %raw, "Invalid price decimals"),
        }
    }

    for (field, raw) in fields.iter().filter(|(f, _)| *f != SnapshotField::PriceDecimals) {
        apply_field(snapshot, *field, raw);
    }
}

fn apply_field(snapshot: &mut MarketSnapshot, field: SnapshotField, raw: &str) {
    let value = raw.trim();
    if value.is_empty() {
        return;
    }

    let decimals = snapshot.price_decimals;
    match field {
        SnapshotField::BidPrice => set_price(&mut snapshot.bid_price, value, decimals, field),
        SnapshotField::AskPrice => set_price(&mut snapshot.ask_price, value, decimals, field),
        SnapshotField::LastPrice => set_price(&mut snapshot.last_price, value, decimals, field),
        SnapshotField::Open => set_price(&mut snapshot.open, value, decimals, field),
        SnapshotField::High => set_price(&mut snapshot.high, value, decimals, field),
        SnapshotField::Low => set_price(&mut snapshot.low, value, decimals, field),
        SnapshotField::Close => set_price(&mut snapshot.close, value, decimals, field),
        SnapshotField::Variation => set_price(&mut snapshot.variation, value, 2, field),
        SnapshotField::BidQuantity => set_quantity(&mut snapshot.bid_quantity, value, field),
        SnapshotField::AskQuantity => set_quantity(&mut snapshot.ask_quantity, value, field),
        SnapshotField::LastQuantity => set_quantity(&mut snapshot.last_quantity, value, field),
        SnapshotField::Volume => set_quantity(&mut snapshot.volume, value, field),
        SnapshotField::LastTime => snapshot.last_time = Some(normalize_time(value)),
        SnapshotField::VariationSign => snapshot.variation_sign = Some(value.to_string()),
        SnapshotField::Suspended => snapshot.suspended = matches!(value, "1" | "S" | "Y"),
        SnapshotField::TradingPhase => snapshot.trading_phase = Some(value.to_string()),
        SnapshotField::LocalCode => snapshot.local_code = Some(value.to_string()),
        SnapshotField::Isin => snapshot.isin = Some(value.to_string()),
        SnapshotField::PriceDecimals => {}
    }
}

fn set_price(slot: &mut Option<Decimal>, raw: &str, decimals: u32, field: SnapshotField) {
    match parse_price(raw, decimals) {
        Some(price) => *slot = Some(price),
        None => {
            warn!(?field, raw = %raw, "Unparseable price");
            metrics::record_decode_error("price");
        }
    }
}

fn set_quantity(slot: &mut Option<u64>, raw: &str, field: SnapshotField) {
    match raw.parse::<u64>() {
        Ok(quantity) => *slot = Some(quantity),
        Err(_) => {
            warn!(?field, raw = %raw, "Unparseable quantity");
            metrics::record_decode_error("quantity");
        }
    }
}

/// A value with a decimal point is taken as-is; otherwise it is an integer
/// number of minor units.
pub fn parse_price(raw: &str, decimals: u32) -> Option<Decimal> {
    let raw = raw.trim();
    if raw.contains('.') {
        return Decimal::from_str(raw).ok();
    }
    let minor: i64 = raw.parse().ok()?;
    Some(Decimal::new(minor, decimals))
}

/// Turn `HHMMSS[.fraction]` into `HH:MM:SS[.fraction]`, left-padding short
/// values. Anything else comes back unchanged.
pub fn normalize_time(raw: &str) -> String {
    let (whole, fraction) = match raw.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (raw, None),
    };

    if whole.is_empty() || whole.len() > 6 || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return raw.to_string();
    }
    if let Some(fraction) = fraction {
        if !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return raw.to_string();
        }
    }

    let padded = format!("{:0>6}", whole);
    let mut out = format!("{}:{}:{}", &padded[0..2], &padded[2..4], &padded[4..6]);
    if let Some(fraction) = fraction {
        out.push('.');
        out.push_str(fraction);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::field::PayloadBuilder;
    use rust_decimal_macros::dec;

    const KEY: &str = "400000001000ABC";

    fn snapshot_payload(values: &[(usize, &str)]) -> Vec<u8> {
        let mut builder = PayloadBuilder::new();
        builder.field(KEY).unwrap();
        for index in 1..=88 {
            let value = values
                .iter()
                .find(|(i, _)| *i == index)
                .map(|(_, v)| *v)
                .unwrap_or("");
            builder.field(value).unwrap();
        }
        builder.finish().to_vec()
    }

    fn update_payload(entries: &[(u8, &str)]) -> Vec<u8> {
        let mut builder = PayloadBuilder::new();
        builder.field(KEY).unwrap();
        for (number, value) in entries {
            builder.raw(&[number + LENGTH_OFFSET]);
            builder.field(value).unwrap();
        }
        builder.finish().to_vec()
    }

    #[test]
    fn test_parse_dictionary_single_instrument() {
        let mut builder = PayloadBuilder::new();
        for value in ["400000001000ABC", "Example SA", "ABC", "PL0000012345", ""] {
            builder.field(value).unwrap();
        }
        let instruments = parse_dictionary(&builder.finish());

        assert_eq!(
            instruments,
            vec![Instrument {
                glid: "400000001000".to_string(),
                symbol: "ABC".to_string(),
                name: "Example SA".to_string(),
                local_code: "ABC".to_string(),
                isin: "PL0000012345".to_string(),
            }]
        );
    }

    #[test]
    fn test_parse_dictionary_skips_bad_keys_and_partial_tail() {
        let mut builder = PayloadBuilder::new();
        for value in [
            "BAD", "Nope", "N", "X", "",
            "400000002000XYZ", "Other SA", "XYZ", "PL0000099999", "",
            "400000003000", "Partial",
        ] {
            builder.field(value).unwrap();
        }
        let instruments = parse_dictionary(&builder.finish());
        assert_eq!(instruments.len(), 1);
        assert_eq!(instruments[0].symbol, "XYZ");
    }

    #[test]
    fn test_parse_dictionary_empty() {
        assert!(parse_dictionary(&[]).is_empty());
    }

    #[test]
    fn test_parse_snapshot_positions() {
        let payload = snapshot_payload(&[
            (1, "12345"),
            (2, "500"),
            (3, "12350"),
            (4, "700"),
            (5, "12348"),
            (7, "93005"),
            (8, "120000"),
            (9, "1.25"),
            (10, "-"),
            (15, "0"),
            (16, "CONT"),
            (42, "ABC"),
            (88, "PL0000012345"),
        ]);

        let snapshot = parse_snapshot(&payload).unwrap();
        assert_eq!(snapshot.key, KEY);
        assert_eq!(snapshot.bid_quantity, Some(500));
        assert_eq!(snapshot.bid_price, Some(dec!(123.45)));
        assert_eq!(snapshot.ask_price, Some(dec!(123.50)));
        assert_eq!(snapshot.ask_quantity, Some(700));
        assert_eq!(snapshot.last_price, Some(dec!(123.48)));
        assert_eq!(snapshot.last_quantity, None);
        assert_eq!(snapshot.last_time.as_deref(), Some("09:30:05"));
        assert_eq!(snapshot.volume, Some(120000));
        assert_eq!(snapshot.signed_variation(), Some(dec!(-1.25)));
        assert!(!snapshot.suspended);
        assert_eq!(snapshot.trading_phase.as_deref(), Some("CONT"));
        assert_eq!(snapshot.local_code.as_deref(), Some("ABC"));
        assert_eq!(snapshot.isin.as_deref(), Some("PL0000012345"));
    }

    #[test]
    fn test_snapshot_price_decimals_apply_to_earlier_prices() {
        let payload = snapshot_payload(&[(1, "12345"), (17, "3")]);
        let snapshot = parse_snapshot(&payload).unwrap();
        assert_eq!(snapshot.price_decimals, 3);
        assert_eq!(snapshot.bid_price, Some(dec!(12.345)));
    }

    #[test]
    fn test_snapshot_with_truncated_tail() {
        let mut payload = snapshot_payload(&[(1, "100")]);
        payload.truncate(20);
        payload.push(60);
        let snapshot = parse_snapshot(&payload).unwrap();
        assert_eq!(snapshot.bid_price, Some(dec!(1.00)));
        assert_eq!(snapshot.isin, None);
    }

    #[test]
    fn test_snapshot_bad_number_keeps_other_fields() {
        let payload = snapshot_payload(&[(1, "abc"), (3, "200")]);
        let snapshot = parse_snapshot(&payload).unwrap();
        assert_eq!(snapshot.bid_price, None);
        assert_eq!(snapshot.ask_price, Some(dec!(2.00)));
    }

    #[test]
    fn test_parse_update_bid_price_minor_units() {
        let update = parse_update(&update_payload(&[(1, "12345")])).unwrap();
        assert_eq!(update.key, KEY);
        assert_eq!(update.fields, vec![(SnapshotField::BidPrice, "12345".to_string())]);

        let mut snapshot = MarketSnapshot::new(KEY);
        update.apply_to(&mut snapshot);
        assert_eq!(snapshot.bid_price, Some(dec!(123.45)));
    }

    #[test]
    fn test_parse_update_skips_unknown_numbers() {
        let update = parse_update(&update_payload(&[(60, "x"), (5, "999"), (200, "y")])).unwrap();
        assert_eq!(update.fields, vec![(SnapshotField::LastPrice, "999".to_string())]);
    }

    #[test]
    fn test_parse_update_stops_on_bad_marker() {
        let mut payload = update_payload(&[(3, "100")]);
        payload.push(5);
        payload.extend_from_slice(&update_payload(&[(4, "7")])[16..]);
        let update = parse_update(&payload).unwrap();
        assert_eq!(update.fields.len(), 1);
    }

    #[test]
    fn test_update_is_idempotent() {
        let update = parse_update(&update_payload(&[(1, "12345"), (8, "42"), (7, "101500")]))
            .unwrap();
        let mut once = MarketSnapshot::new(KEY);
        update.apply_to(&mut once);
        let mut twice = once.clone();
        update.apply_to(&mut twice);
        twice.updated_at = once.updated_at;
        assert_eq!(once, twice);
        assert_eq!(once.volume, Some(42));
        assert_eq!(once.last_time.as_deref(), Some("10:15:00"));
    }

    #[test]
    fn test_normalize_time() {
        assert_eq!(normalize_time("93005"), "09:30:05");
        assert_eq!(normalize_time("093005"), "09:30:05");
        assert_eq!(normalize_time("5"), "00:00:05");
        assert_eq!(normalize_time("101500.123"), "10:15:00.123");
        assert_eq!(normalize_time("1234567"), "1234567");
        assert_eq!(normalize_time("12:30"), "12:30");
        assert_eq!(normalize_time(""), "");
        assert_eq!(normalize_time("1015.ab"), "1015.ab");
    }

    #[test]
    fn test_parse_price() {
        assert_eq!(parse_price("16000", 2), Some(dec!(160.00)));
        assert_eq!(parse_price("160.5", 2), Some(dec!(160.5)));
        assert_eq!(parse_price("-250", 2), Some(dec!(-2.50)));
        assert_eq!(parse_price("x", 2), None);
    }

    #[test]
    fn test_field_tables_agree() {
        for index in 0..MAX_SNAPSHOT_FIELDS {
            if let Some(field) = SnapshotField::from_position(index) {
                assert_eq!(field.position(), index);
                assert_eq!(SnapshotField::from_update_number(field.update_number()), Some(field));
            }
        }
    }
}
