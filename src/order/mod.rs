//! Order entry module
//!
//! Client-side order records, the status state machine, and the payload
//! builder / reply parser used by the order-entry session.

pub mod builder;
pub mod reply;
mod tracker;

pub use builder::{build_cancel_order, build_modify_order, build_new_order, price_to_minor_units};
pub use reply::{parse_reply, OrderReply, ReplyKind};
pub use tracker::{OrderTracker, ReplyOutcome};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::market::Instrument;

/// Side of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn code(self) -> &'static str {
        match self {
            Side::Buy => "0",
            Side::Sell => "1",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "0" => Some(Side::Buy),
            "1" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Order type ("modality" on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
    Stop,
    StopLimit,
}

impl OrderType {
    pub fn code(self) -> &'static str {
        match self {
            OrderType::Limit => "L",
            OrderType::Market => "M",
            OrderType::Stop => "S",
            OrderType::StopLimit => "T",
        }
    }

    /// Whether a limit price travels with the order
    pub fn requires_price(self) -> bool {
        matches!(self, OrderType::Limit | OrderType::StopLimit)
    }
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Validity {
    Day,
    FillAndKill,
    FillOrKill,
    GoodTillCancel,
    GoodTillDate(NaiveDate),
}

impl Validity {
    pub fn code(self) -> &'static str {
        match self {
            Validity::Day => "J",
            Validity::FillAndKill => "F",
            Validity::FillOrKill => "E",
            Validity::GoodTillCancel => "R",
            Validity::GoodTillDate(_) => "D",
        }
    }
}

/// Order lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Working,
    Accepted,
    Rejected,
    PartiallyExecuted,
    Executed,
    Cancelled,
    Modified,
}

impl OrderStatus {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "A" => Some(OrderStatus::Accepted),
            "R" => Some(OrderStatus::Rejected),
            "P" => Some(OrderStatus::PartiallyExecuted),
            "E" => Some(OrderStatus::Executed),
            "C" => Some(OrderStatus::Cancelled),
            "M" => Some(OrderStatus::Modified),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Executed | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }

    /// Allowed moves of the status state machine
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match self {
            Working => matches!(next, Accepted | Rejected),
            Accepted | Modified => {
                matches!(next, PartiallyExecuted | Executed | Cancelled | Modified)
            }
            PartiallyExecuted => matches!(next, PartiallyExecuted | Executed | Cancelled),
            Executed | Rejected | Cancelled => false,
        }
    }
}

/// Parameters for a new order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub glid: String,
    pub symbol: String,
    pub local_code: String,
    pub side: Side,
    pub quantity: u64,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub validity: Validity,
    pub client_code_type: String,
    pub application_flag: String,
    pub allocation_code: Option<String>,
    pub memo: Option<String>,
    pub clearing_account: Option<String>,
    pub floor_trader: Option<String>,
    pub currency: Option<String>,
    pub reference: Option<String>,
}

impl OrderRequest {
    pub fn limit(instrument: &Instrument, side: Side, quantity: u64, price: Decimal) -> Self {
        Self::new(instrument, side, quantity, OrderType::Limit, Some(price))
    }

    pub fn market(instrument: &Instrument, side: Side, quantity: u64) -> Self {
        Self::new(instrument, side, quantity, OrderType::Market, None)
    }

    fn new(
        instrument: &Instrument,
        side: Side,
        quantity: u64,
        order_type: OrderType,
        price: Option<Decimal>,
    ) -> Self {
        Self {
            glid: instrument.glid.clone(),
            symbol: instrument.symbol.clone(),
            local_code: instrument.local_code.clone(),
            side,
            quantity,
            order_type,
            price,
            validity: Validity::Day,
            client_code_type: "1".to_string(),
            application_flag: "0".to_string(),
            allocation_code: None,
            memo: None,
            clearing_account: None,
            floor_trader: None,
            currency: None,
            reference: None,
        }
    }

    pub fn with_validity(mut self, validity: Validity) -> Self {
        self.validity = validity;
        self
    }

    pub fn with_memo(mut self, memo: &str) -> Self {
        self.memo = Some(memo.to_string());
        self
    }

    pub fn with_clearing_account(mut self, account: &str) -> Self {
        self.clearing_account = Some(account.to_string());
        self
    }

    pub fn with_reference(mut self, reference: &str) -> Self {
        self.reference = Some(reference.to_string());
        self
    }
}

/// Changes requested by a modification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderModification {
    pub quantity: Option<u64>,
    pub price: Option<Decimal>,
    pub validity: Option<Validity>,
}

/// Order tracked by the order-entry session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub local_ref: String,
    pub exchange_number: Option<String>,
    pub request: OrderRequest,
    pub executed_quantity: u64,
    pub average_price: Option<Decimal>,
    pub status: OrderStatus,
    pub reject_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(local_ref: &str, request: OrderRequest) -> Self {
        let now = Utc::now();
        Self {
            local_ref: local_ref.to_string(),
            exchange_number: None,
            request,
            executed_quantity: 0,
            average_price: None,
            status: OrderStatus::Working,
            reject_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn side(&self) -> Side {
        self.request.side
    }

    pub fn quantity(&self) -> u64 {
        self.request.quantity
    }

    pub fn price(&self) -> Option<Decimal> {
        self.request.price
    }

    pub fn remaining_quantity(&self) -> u64 {
        self.request.quantity.saturating_sub(self.executed_quantity)
    }

    /// Move to `next` if the state machine allows it
    pub fn transition(&mut self, next: OrderStatus) -> bool {
        if self.status == next && !matches!(next, OrderStatus::PartiallyExecuted | OrderStatus::Modified) {
            return false;
        }
        if !self.status.can_transition_to(next) {
            warn!(
                order = %self.local_ref,
                from = ?self.status,
                to = ?next,
                "Ignoring invalid order status transition"
            );
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }

    /// Record an execution of `quantity` at `price`
    pub fn fill(&mut self, quantity: u64, price: Option<Decimal>) -> bool {
        if quantity == 0 || self.status.is_terminal() {
            return false;
        }
        if self.status == OrderStatus::Working {
            // Fill reported before the acknowledgement
            self.transition(OrderStatus::Accepted);
        }

        let previous = self.executed_quantity;
        let total = previous + quantity;
        if let Some(price) = price {
            let weighted = self.average_price.unwrap_or(price) * Decimal::from(previous)
                + price * Decimal::from(quantity);
            self.average_price = Some(weighted / Decimal::from(total));
        }
        self.executed_quantity = total;

        let next = if total >= self.request.quantity {
            OrderStatus::Executed
        } else {
            OrderStatus::PartiallyExecuted
        };
        self.transition(next)
    }

    /// Raise the executed quantity to `cumulative`; reports at or below the
    /// current total change nothing
    pub fn fill_to(&mut self, cumulative: u64, price: Option<Decimal>) -> bool {
        if cumulative <= self.executed_quantity {
            return false;
        }
        self.fill(cumulative - self.executed_quantity, price)
    }
}
