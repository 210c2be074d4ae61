//! Order request payloads
//!
//! A request is a fixed header (user number, category, command, venue-local
//! code, filler) followed by `(field id, value)` pairs, each field-encoded.
//! Mandatory fields are always present, blank when unset. Optional fields are
//! left out entirely when empty.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use super::{Order, OrderModification, OrderRequest, OrderType, Side, Validity};
use crate::error::{GlError, Result};
use crate::protocol::field::PayloadBuilder;
use crate::protocol::FILLER;

/// Width of the user-number slot in the request header
pub const USER_NUMBER_WIDTH: usize = 8;
/// Request category for order messages
pub const ORDER_CATEGORY: u8 = b'O';

/// Bitmap field ids
pub mod field_id {
    pub const SIDE: u8 = 0;
    pub const QUANTITY: u8 = 1;
    pub const ORDER_TYPE: u8 = 2;
    pub const PRICE: u8 = 3;
    pub const VALIDITY: u8 = 4;
    pub const CLIENT_CODE_TYPE: u8 = 5;
    pub const APPLICATION_FLAG: u8 = 6;
    pub const TIMESTAMP: u8 = 7;
    pub const GLID: u8 = 8;
    pub const ALLOCATION_CODE: u8 = 9;
    pub const MEMO: u8 = 10;
    pub const CLEARING_ACCOUNT: u8 = 11;
    pub const FLOOR_TRADER: u8 = 12;
    pub const CURRENCY: u8 = 13;
    pub const REFERENCE_1: u8 = 14;
    pub const REFERENCE_2: u8 = 15;
    pub const EXCHANGE_NUMBER: u8 = 16;
    pub const LOCAL_REFERENCE: u8 = 17;
}

/// Command byte in the request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    New,
    Modify,
    Cancel,
}

impl Command {
    fn code(self) -> u8 {
        match self {
            Command::New => b'0',
            Command::Modify => b'1',
            Command::Cancel => b'2',
        }
    }
}

/// Prices travel as integer hundredths
pub fn price_to_minor_units(price: Decimal) -> Result<i64> {
    price
        .checked_mul(Decimal::from(100))
        .and_then(|minor| {
            minor
                .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
                .to_i64()
        })
        .ok_or_else(|| GlError::InvalidOrder(format!("price {} out of range", price)))
}

/// Payload for a new order
pub fn build_new_order(
    user_number: &str,
    local_ref: &str,
    request: &OrderRequest,
    timestamp: DateTime<Utc>,
) -> Result<Bytes> {
    validate_quantity(request.quantity)?;
    let price = validate_price(request.order_type, request.price)?;

    let mut payload = header(user_number, Command::New, &request.local_code)?;
    let terms = Terms {
        side: request.side,
        quantity: request.quantity,
        order_type: request.order_type,
        price,
        validity: request.validity,
    };
    put_mandatory(&mut payload, &terms, request, timestamp)?;
    put_optional(&mut payload, field_id::ALLOCATION_CODE, request.allocation_code.as_deref())?;
    put_optional(&mut payload, field_id::MEMO, request.memo.as_deref())?;
    put_optional(&mut payload, field_id::CLEARING_ACCOUNT, request.clearing_account.as_deref())?;
    put_optional(&mut payload, field_id::FLOOR_TRADER, request.floor_trader.as_deref())?;
    put_optional(&mut payload, field_id::CURRENCY, request.currency.as_deref())?;
    put_optional(&mut payload, field_id::REFERENCE_1, request.reference.as_deref())?;
    put_expiry(&mut payload, request.validity)?;
    payload.pair(field_id::LOCAL_REFERENCE, local_ref)?;

    Ok(payload.finish())
}

/// Payload modifying an acknowledged order
pub fn build_modify_order(
    user_number: &str,
    order: &Order,
    change: &OrderModification,
    timestamp: DateTime<Utc>,
) -> Result<Bytes> {
    let exchange_number = require_exchange_number(order)?;
    let request = &order.request;
    let quantity = change.quantity.unwrap_or(request.quantity);
    validate_quantity(quantity)?;
    if quantity < order.executed_quantity {
        return Err(GlError::InvalidOrder(format!(
            "quantity {} below executed quantity {}",
            quantity, order.executed_quantity
        )));
    }
    let price = validate_price(request.order_type, change.price.or(request.price))?;
    let validity = change.validity.unwrap_or(request.validity);

    let mut payload = header(user_number, Command::Modify, &request.local_code)?;
    let terms = Terms {
        side: request.side,
        quantity,
        order_type: request.order_type,
        price,
        validity,
    };
    put_mandatory(&mut payload, &terms, request, timestamp)?;
    put_expiry(&mut payload, validity)?;
    payload.pair(field_id::EXCHANGE_NUMBER, exchange_number)?;
    payload.pair(field_id::LOCAL_REFERENCE, &order.local_ref)?;

    Ok(payload.finish())
}

/// Payload cancelling an acknowledged order
pub fn build_cancel_order(user_number: &str, order: &Order, timestamp: DateTime<Utc>) -> Result<Bytes> {
    let exchange_number = require_exchange_number(order)?;
    let request = &order.request;

    let mut payload = header(user_number, Command::Cancel, &request.local_code)?;
    let terms = Terms {
        side: request.side,
        quantity: request.quantity,
        order_type: request.order_type,
        price: if request.order_type.requires_price() { request.price } else { None },
        validity: request.validity,
    };
    put_mandatory(&mut payload, &terms, request, timestamp)?;
    payload.pair(field_id::EXCHANGE_NUMBER, exchange_number)?;
    payload.pair(field_id::LOCAL_REFERENCE, &order.local_ref)?;

    Ok(payload.finish())
}

/// Economic terms shared by every command
struct Terms {
    side: Side,
    quantity: u64,
    order_type: OrderType,
    price: Option<Decimal>,
    validity: Validity,
}

fn header(user_number: &str, command: Command, local_code: &str) -> Result<PayloadBuilder> {
    let mut payload = PayloadBuilder::new();
    payload
        .fixed(user_number, USER_NUMBER_WIDTH, FILLER)
        .raw(&[ORDER_CATEGORY, command.code()]);
    payload.field(local_code)?;
    payload.raw(&[FILLER, FILLER]);
    Ok(payload)
}

fn put_mandatory(
    payload: &mut PayloadBuilder,
    terms: &Terms,
    request: &OrderRequest,
    timestamp: DateTime<Utc>,
) -> Result<()> {
    payload
        .pair(field_id::SIDE, terms.side.code())?
        .pair(field_id::QUANTITY, &terms.quantity.to_string())?
        .pair(field_id::ORDER_TYPE, terms.order_type.code())?;
    if let Some(price) = terms.price {
        payload.pair(field_id::PRICE, &price_to_minor_units(price)?.to_string())?;
    }
    payload
        .pair(field_id::VALIDITY, terms.validity.code())?
        .pair(field_id::CLIENT_CODE_TYPE, &request.client_code_type)?
        .pair(field_id::APPLICATION_FLAG, &request.application_flag)?
        .pair(field_id::TIMESTAMP, &timestamp.format("%Y%m%d%H%M%S").to_string())?
        .pair(field_id::GLID, &request.glid)?;
    Ok(())
}

fn put_optional(payload: &mut PayloadBuilder, id: u8, value: Option<&str>) -> Result<()> {
    match value {
        Some(value) if !value.is_empty() => {
            payload.pair(id, value)?;
        }
        _ => {}
    }
    Ok(())
}

fn put_expiry(payload: &mut PayloadBuilder, validity: Validity) -> Result<()> {
    if let Validity::GoodTillDate(date) = validity {
        payload.pair(field_id::REFERENCE_2, &date.format("%Y%m%d").to_string())?;
    }
    Ok(())
}

fn validate_quantity(quantity: u64) -> Result<()> {
    if quantity == 0 {
        return Err(GlError::InvalidOrder("quantity must be positive".to_string()));
    }
    Ok(())
}

fn validate_price(order_type: OrderType, price: Option<Decimal>) -> Result<Option<Decimal>> {
    if !order_type.requires_price() {
        return Ok(None);
    }
    match price {
        Some(price) if price > Decimal::ZERO => Ok(Some(price)),
        Some(price) => Err(GlError::InvalidOrder(format!("price {} must be positive", price))),
        None => Err(GlError::InvalidOrder(format!(
            "{:?} order requires a price",
            order_type
        ))),
    }
}

fn require_exchange_number(order: &Order) -> Result<&str> {
    order
        .exchange_number
        .as_deref()
        .ok_or_else(|| GlError::MissingExchangeNumber(order.local_ref.clone()))
}
