//! Client-side book of submitted orders
//!
//! Replies are matched to orders by the echoed local reference, falling back
//! to the exchange number once the venue has assigned one.
//!
//! Pushed executions are increments. Order-book query responses restate
//! orders the venue already reported, so their executed quantity is taken as
//! a cumulative total and replaying one never double counts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use tracing::{debug, warn};

use super::{Order, OrderReply, OrderStatus, ReplyKind};

/// Result of applying one reply to a tracked order
#[derive(Debug, Clone)]
pub struct ReplyOutcome {
    pub order: Order,
    pub previous: OrderStatus,
    pub changed: bool,
}

impl ReplyOutcome {
    pub fn newly_accepted(&self) -> bool {
        self.previous == OrderStatus::Working && self.order.status == OrderStatus::Accepted
    }

    pub fn newly_rejected(&self) -> bool {
        self.previous != OrderStatus::Rejected && self.order.status == OrderStatus::Rejected
    }
}

/// Where a reply came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplySource {
    Push,
    Query,
}

#[derive(Debug)]
pub struct OrderTracker {
    orders: Mutex<HashMap<String, Order>>,
    sequence: AtomicU64,
    prefix: String,
}

impl Default for OrderTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderTracker {
    /// References are prefixed with the creation time so that two sessions on
    /// the same day do not reuse them.
    pub fn new() -> Self {
        Self::with_prefix(&Utc::now().format("%H%M%S").to_string())
    }

    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            orders: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(1),
            prefix: prefix.to_string(),
        }
    }

    fn orders(&self) -> MutexGuard<'_, HashMap<String, Order>> {
        self.orders.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn next_reference(&self) -> String {
        let n = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}{:06}", self.prefix, n)
    }

    pub fn insert(&self, order: Order) {
        self.orders().insert(order.local_ref.clone(), order);
    }

    pub fn remove(&self, local_ref: &str) -> Option<Order> {
        self.orders().remove(local_ref)
    }

    pub fn get(&self, local_ref: &str) -> Option<Order> {
        self.orders().get(local_ref).cloned()
    }

    pub fn find_by_exchange_number(&self, exchange_number: &str) -> Option<Order> {
        self.orders()
            .values()
            .find(|o| o.exchange_number.as_deref() == Some(exchange_number))
            .cloned()
    }

    /// All tracked orders, oldest first
    pub fn all(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.orders().values().cloned().collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.local_ref.cmp(&b.local_ref)));
        orders
    }

    /// Orders not yet in a terminal state
    pub fn open(&self) -> Vec<Order> {
        self.all().into_iter().filter(|o| !o.status.is_terminal()).collect()
    }

    /// Apply a pushed `reply` to the order it refers to
    pub fn apply_reply(&self, reply: &OrderReply) -> Option<ReplyOutcome> {
        self.apply_from(reply, ReplySource::Push)
    }

    /// Apply an order-book query response
    pub fn apply_query_reply(&self, reply: &OrderReply) -> Option<ReplyOutcome> {
        self.apply_from(reply, ReplySource::Query)
    }

    fn apply_from(&self, reply: &OrderReply, source: ReplySource) -> Option<ReplyOutcome> {
        let mut orders = self.orders();

        let key = match reply.local_reference() {
            Some(local_ref) if orders.contains_key(local_ref) => Some(local_ref.to_string()),
            _ => reply.exchange_number().and_then(|number| {
                orders
                    .values()
                    .find(|o| o.exchange_number.as_deref() == Some(number))
                    .map(|o| o.local_ref.clone())
            }),
        };
        let Some(key) = key else {
            debug!(
                kind = ?reply.kind,
                local_ref = ?reply.local_reference(),
                exchange_number = ?reply.exchange_number(),
                "Reply for an order this session does not track"
            );
            return None;
        };

        let order = orders.get_mut(&key)?;
        let previous = order.status;
        let changed = apply(order, reply, source);
        Some(ReplyOutcome {
            order: order.clone(),
            previous,
            changed,
        })
    }

    pub fn len(&self) -> usize {
        self.orders().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn apply(order: &mut Order, reply: &OrderReply, source: ReplySource) -> bool {
    let mut changed = false;
    if order.exchange_number.is_none() {
        if let Some(number) = reply.exchange_number() {
            order.exchange_number = Some(number.to_string());
            changed = true;
        }
    }

    match reply.kind {
        ReplyKind::Acknowledgement => {
            let next = reply.status().unwrap_or(OrderStatus::Accepted);
            if next == OrderStatus::Modified {
                changed |= apply_amendment(order, reply);
            }
            changed |= order.transition(next);
        }
        ReplyKind::ExchangeRejection | ReplyKind::GatewayRejection => {
            let reason = reply
                .reject_code()
                .or_else(|| reply.message())
                .unwrap_or("rejected");
            order.reject_reason = Some(reason.to_string());
            changed = true;
            // A rejected amendment leaves the live order untouched
            if order.status == OrderStatus::Working {
                order.transition(OrderStatus::Rejected);
            }
        }
        ReplyKind::Execution => match reply.executed_quantity() {
            Some(quantity) if source == ReplySource::Query => {
                changed |= order.fill_to(quantity, reply.execution_price())
            }
            Some(quantity) => changed |= order.fill(quantity, reply.execution_price()),
            None => warn!(order = %order.local_ref, "Execution reply without quantity"),
        },
        ReplyKind::ExchangeMessage | ReplyKind::Inflected => {
            let status = reply.status();
            if reply.kind == ReplyKind::Inflected || status == Some(OrderStatus::Modified) {
                changed |= apply_amendment(order, reply);
            }
            if let Some(status) = status {
                changed |= order.transition(status);
            }
        }
        ReplyKind::Unknown(code) => {
            debug!(order = %order.local_ref, code = %code, "Unknown reply type");
        }
    }

    if changed {
        order.updated_at = Utc::now();
    }
    changed
}

/// Take amended quantity / price from the reply
fn apply_amendment(order: &mut Order, reply: &OrderReply) -> bool {
    let mut changed = false;
    if let Some(quantity) = reply.quantity() {
        if quantity >= order.executed_quantity && quantity != order.request.quantity {
            order.request.quantity = quantity;
            changed = true;
        }
    }
    if let Some(price) = reply.price() {
        if order.request.price != Some(price) {
            order.request.price = Some(price);
            changed = true;
        }
    }
    changed
}
