//! Order reply parser
//!
//! Fixed header: chaining flag (1), user number (8), request category (1),
//! reply type (1), index (5), reply count (5), venue code (field-encoded).
//! The rest is a bitmap of `(field id, value)` pairs. Which ids appear depends
//! on the reply type, so every lookup is optional.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::builder::USER_NUMBER_WIDTH;
use super::OrderStatus;
use crate::market::parser::parse_price;
use crate::metrics;
use crate::protocol::field::FieldReader;

/// Reply bitmap field ids
pub mod field_id {
    pub const QUANTITY: u8 = 1;
    pub const PRICE: u8 = 3;
    pub const LOCAL_REFERENCE: u8 = 17;
    pub const STATUS: u8 = 20;
    pub const EXCHANGE_NUMBER: u8 = 21;
    pub const ORDER_ID: u8 = 22;
    pub const REJECT_CODE: u8 = 23;
    pub const EXECUTED_QUANTITY: u8 = 24;
    pub const EXECUTION_PRICE: u8 = 25;
    pub const MESSAGE: u8 = 26;
}

/// Semantic event carried by a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyKind {
    Acknowledgement,
    ExchangeRejection,
    GatewayRejection,
    Execution,
    ExchangeMessage,
    Inflected,
    Unknown(char),
}

impl ReplyKind {
    pub fn from_code(code: u8) -> Self {
        match code {
            b'A' => ReplyKind::Acknowledgement,
            b'R' => ReplyKind::ExchangeRejection,
            b'G' => ReplyKind::GatewayRejection,
            b'E' => ReplyKind::Execution,
            b'M' => ReplyKind::ExchangeMessage,
            b'I' => ReplyKind::Inflected,
            other => ReplyKind::Unknown(other as char),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ReplyKind::Acknowledgement => b'A',
            ReplyKind::ExchangeRejection => b'R',
            ReplyKind::GatewayRejection => b'G',
            ReplyKind::Execution => b'E',
            ReplyKind::ExchangeMessage => b'M',
            ReplyKind::Inflected => b'I',
            ReplyKind::Unknown(c) => c as u8,
        }
    }

    pub fn is_rejection(self) -> bool {
        matches!(self, ReplyKind::ExchangeRejection | ReplyKind::GatewayRejection)
    }
}

/// Decoded order-lifecycle reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReply {
    pub chained: bool,
    pub user_number: String,
    pub category: char,
    pub kind: ReplyKind,
    pub index: u32,
    pub count: u32,
    pub local_code: String,
    pub fields: BTreeMap<u8, String>,
}

impl OrderReply {
    /// Non-blank value of field `id`
    pub fn field(&self, id: u8) -> Option<&str> {
        self.fields
            .get(&id)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn status(&self) -> Option<OrderStatus> {
        self.field(field_id::STATUS).and_then(OrderStatus::from_code)
    }

    /// Venue reference required for later modify / cancel
    pub fn exchange_number(&self) -> Option<&str> {
        self.field(field_id::EXCHANGE_NUMBER)
    }

    pub fn order_id(&self) -> Option<&str> {
        self.field(field_id::ORDER_ID)
    }

    pub fn local_reference(&self) -> Option<&str> {
        self.field(field_id::LOCAL_REFERENCE)
    }

    pub fn reject_code(&self) -> Option<&str> {
        self.field(field_id::REJECT_CODE)
    }

    pub fn message(&self) -> Option<&str> {
        self.field(field_id::MESSAGE)
    }

    pub fn executed_quantity(&self) -> Option<u64> {
        self.field(field_id::EXECUTED_QUANTITY)?.parse().ok()
    }

    pub fn execution_price(&self) -> Option<Decimal> {
        parse_price(self.field(field_id::EXECUTION_PRICE)?, 2)
    }

    /// Quantity echoed on amendments
    pub fn quantity(&self) -> Option<u64> {
        self.field(field_id::QUANTITY)?.parse().ok()
    }

    /// Price echoed on amendments
    pub fn price(&self) -> Option<Decimal> {
        parse_price(self.field(field_id::PRICE)?, 2)
    }
}

/// Parse an order reply payload
pub fn parse_reply(payload: &[u8]) -> Option<OrderReply> {
    let mut reader = FieldReader::new(payload);

    let chained = reader.next_byte()? == b'1';
    let user_number = reader.next_fixed(USER_NUMBER_WIDTH)?;
    let category = reader.next_byte()? as char;
    let kind = ReplyKind::from_code(reader.next_byte()?);
    let index = reader.next_fixed(5)?.parse().unwrap_or(0);
    let count = reader.next_fixed(5)?.parse().unwrap_or(0);
    let Some(local_code) = reader.next_field() else {
        warn!(?kind, "Order reply header truncated");
        metrics::record_decode_error("order_reply_header");
        return None;
    };

    let mut fields = BTreeMap::new();
    while !reader.is_empty() {
        let Some(id) = reader.next_field() else {
            break;
        };
        let Ok(id) = id.parse::<u8>() else {
            warn!(id = %id, "Non-numeric field id in order reply");
            metrics::record_decode_error("order_reply_field_id");
            break;
        };
        let Some(value) = reader.next_field() else {
            warn!(id, "Order reply field without value");
            metrics::record_decode_error("order_reply_field");
            break;
        };
        fields.insert(id, value);
    }

    Some(OrderReply {
        chained,
        user_number,
        category,
        kind,
        index,
        count,
        local_code,
        fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::field::PayloadBuilder;
    use rust_decimal_macros::dec;

    fn reply_payload(kind: u8, pairs: &[(u8, &str)]) -> Vec<u8> {
        let mut builder = PayloadBuilder::new();
        builder
            .raw(b"0")
            .fixed("1234", USER_NUMBER_WIDTH, b' ')
            .raw(&[b'O', kind])
            .fixed("00001", 5, b' ')
            .fixed("00001", 5, b' ');
        builder.field("ABC").unwrap();
        for (id, value) in pairs {
            builder.pair(*id, value).unwrap();
        }
        builder.finish().to_vec()
    }

    #[test]
    fn test_parse_acknowledgement() {
        let payload = reply_payload(
            b'A',
            &[
                (field_id::LOCAL_REFERENCE, "O00000001"),
                (field_id::STATUS, "A"),
                (field_id::EXCHANGE_NUMBER, "EX123"),
                (field_id::ORDER_ID, "987"),
            ],
        );
        let reply = parse_reply(&payload).unwrap();

        assert!(!reply.chained);
        assert_eq!(reply.user_number, "1234");
        assert_eq!(reply.category, 'O');
        assert_eq!(reply.kind, ReplyKind::Acknowledgement);
        assert_eq!(reply.index, 1);
        assert_eq!(reply.count, 1);
        assert_eq!(reply.local_code, "ABC");
        assert_eq!(reply.status(), Some(OrderStatus::Accepted));
        assert_eq!(reply.exchange_number(), Some("EX123"));
        assert_eq!(reply.order_id(), Some("987"));
        assert_eq!(reply.local_reference(), Some("O00000001"));
        assert_eq!(reply.reject_code(), None);
    }

    #[test]
    fn test_parse_execution() {
        let payload = reply_payload(
            b'E',
            &[
                (field_id::EXCHANGE_NUMBER, "EX123"),
                (field_id::EXECUTED_QUANTITY, "40"),
                (field_id::EXECUTION_PRICE, "16050"),
            ],
        );
        let reply = parse_reply(&payload).unwrap();
        assert_eq!(reply.kind, ReplyKind::Execution);
        assert_eq!(reply.executed_quantity(), Some(40));
        assert_eq!(reply.execution_price(), Some(dec!(160.50)));
    }

    #[test]
    fn test_reply_kinds() {
        for (code, kind) in [
            (b'R', ReplyKind::ExchangeRejection),
            (b'G', ReplyKind::GatewayRejection),
            (b'M', ReplyKind::ExchangeMessage),
            (b'I', ReplyKind::Inflected),
            (b'Z', ReplyKind::Unknown('Z')),
        ] {
            let reply = parse_reply(&reply_payload(code, &[])).unwrap();
            assert_eq!(reply.kind, kind);
            assert_eq!(kind.code(), code);
        }
        assert!(ReplyKind::GatewayRejection.is_rejection());
        assert!(!ReplyKind::Execution.is_rejection());
    }

    #[test]
    fn test_truncated_header() {
        assert!(parse_reply(b"0").is_none());
        assert!(parse_reply(b"01234    OA0000100001").is_none());
    }

    #[test]
    fn test_garbage_field_id_stops_bitmap() {
        let mut payload = reply_payload(b'M', &[(field_id::MESSAGE, "Halted")]);
        let mut tail = PayloadBuilder::new();
        tail.field("xx").unwrap().field("value").unwrap();
        payload.extend_from_slice(&tail.finish());
        let reply = parse_reply(&payload).unwrap();
        assert_eq!(reply.message(), Some("Halted"));
        assert_eq!(reply.fields.len(), 1);
    }
}
