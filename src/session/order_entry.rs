//! Order-entry session
//!
//! The venue only routes order replies to clients that subscribed to them, so
//! the subscription is sent right after login and every order operation
//! checks it first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::connection::{Connection, FrameHandler};
use super::events::{EventHub, OrderEvent};
use super::{SessionSettings, SessionState};
use crate::error::{GlError, Result};
use crate::market::instrument_key;
use crate::metrics;
use crate::order::builder::USER_NUMBER_WIDTH;
use crate::order::{
    build_cancel_order, build_modify_order, build_new_order, parse_reply, Order,
    OrderModification, OrderRequest, OrderTracker,
};
use crate::protocol::{request, Frame, PayloadBuilder, FILLER};

const SESSION_NAME: &str = "order_entry";

struct OrderHandler {
    tracker: OrderTracker,
    events: EventHub<OrderEvent>,
    replies_subscribed: AtomicBool,
}

impl FrameHandler for OrderHandler {
    fn on_frame(&self, frame: Frame) -> Result<()> {
        match frame.request() {
            request::ORDER_REPLY | request::ORDER_BOOK_QUERY | request::ORDER => {
                let Some(reply) = parse_reply(&frame.payload) else {
                    metrics::record_decode_error("order_reply");
                    return Ok(());
                };
                debug!(
                    kind = ?reply.kind,
                    local_ref = ?reply.local_reference(),
                    exchange_number = ?reply.exchange_number(),
                    "Order reply"
                );

                let outcome = if frame.request() == request::ORDER_BOOK_QUERY {
                    self.tracker.apply_query_reply(&reply)
                } else {
                    self.tracker.apply_reply(&reply)
                };
                if let Some(outcome) = &outcome {
                    if outcome.newly_accepted() {
                        info!(order = %outcome.order.local_ref, "Order accepted");
                        self.events.emit(OrderEvent::Accepted(outcome.order.clone()));
                    } else if outcome.newly_rejected() {
                        warn!(
                            order = %outcome.order.local_ref,
                            reason = ?outcome.order.reject_reason,
                            "Order rejected"
                        );
                        self.events.emit(OrderEvent::Rejected(outcome.order.clone()));
                    }
                }
                self.events.emit(OrderEvent::Reply {
                    reply,
                    order: outcome.map(|o| o.order),
                });
            }
            request::ORDER_REPLY_SUBSCRIBE => debug!("Order reply subscription acknowledged"),
            other => debug!(request = other, "Unhandled order-entry frame"),
        }
        Ok(())
    }

    fn on_disconnect(&self) {
        self.replies_subscribed.store(false, Ordering::SeqCst);
        let open = self.tracker.open().len();
        if open > 0 {
            warn!(open, "Disconnected with orders still open");
        }
        self.events.emit(OrderEvent::Disconnected);
    }
}

pub struct OrderEntrySession {
    connection: Arc<Connection>,
    handler: Arc<OrderHandler>,
    user_number: String,
}

impl OrderEntrySession {
    pub fn new(user_number: &str) -> Self {
        Self::with_tracker(user_number, OrderTracker::new())
    }

    pub fn with_tracker(user_number: &str, tracker: OrderTracker) -> Self {
        Self {
            connection: Arc::new(Connection::new(SESSION_NAME)),
            handler: Arc::new(OrderHandler {
                tracker,
                events: EventHub::default(),
                replies_subscribed: AtomicBool::new(false),
            }),
            user_number: user_number.to_string(),
        }
    }

    /// Log in and subscribe to order replies
    pub async fn connect_and_login(&self, settings: &SessionSettings) -> Result<()> {
        self.connection.open(settings, self.handler.clone()).await?;

        if let Err(e) = self.subscribe_replies().await {
            warn!(error = %e, "Order reply subscription failed");
            self.connection.close().await;
            return Err(e);
        }
        Ok(())
    }

    async fn subscribe_replies(&self) -> Result<()> {
        let mut payload = PayloadBuilder::new();
        payload.fixed(&self.user_number, USER_NUMBER_WIDTH, FILLER);
        self.connection
            .send(request::ORDER_REPLY_SUBSCRIBE, &payload.finish())
            .await?;
        self.handler.replies_subscribed.store(true, Ordering::SeqCst);
        info!(user = %self.user_number, "Subscribed to order replies");
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.handler.replies_subscribed.store(false, Ordering::SeqCst);
        self.connection.close().await;
    }

    pub fn state(&self) -> SessionState {
        self.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.connection.watch_state()
    }

    pub fn events(&self) -> &EventHub<OrderEvent> {
        &self.handler.events
    }

    pub fn replies_subscribed(&self) -> bool {
        self.handler.replies_subscribed.load(Ordering::SeqCst)
    }

    fn ensure_ready(&self) -> Result<()> {
        if !self.connection.is_ready() {
            return Err(GlError::NotConnected);
        }
        if !self.replies_subscribed() {
            return Err(GlError::RepliesNotSubscribed);
        }
        Ok(())
    }

    /// Tracked order that can still be amended
    fn live_order(&self, local_ref: &str) -> Result<Order> {
        let order = self
            .handler
            .tracker
            .get(local_ref)
            .ok_or_else(|| GlError::UnknownOrder(local_ref.to_string()))?;
        if order.status.is_terminal() {
            return Err(GlError::InvalidOrder(format!(
                "order {} is {:?}",
                local_ref, order.status
            )));
        }
        Ok(order)
    }

    /// Build, track and send a new order. The returned order is `Working`
    /// until the venue replies.
    pub async fn submit_order(&self, order_request: OrderRequest) -> Result<Order> {
        self.ensure_ready()?;

        let local_ref = self.handler.tracker.next_reference();
        let payload = build_new_order(&self.user_number, &local_ref, &order_request, Utc::now())?;
        let order = Order::new(&local_ref, order_request);
        // Tracked before sending so an immediate reply finds it
        self.handler.tracker.insert(order.clone());

        if let Err(e) = self.connection.send(request::ORDER, &payload).await {
            self.handler.tracker.remove(&local_ref);
            return Err(e);
        }
        info!(
            order = %local_ref,
            key = %instrument_key(&order.request.glid, &order.request.symbol),
            side = ?order.side(),
            quantity = order.quantity(),
            price = ?order.price(),
            "Order submitted"
        );
        Ok(order)
    }

    pub async fn modify_order(&self, local_ref: &str, change: &OrderModification) -> Result<()> {
        self.ensure_ready()?;
        let order = self.live_order(local_ref)?;
        let payload = build_modify_order(&self.user_number, &order, change, Utc::now())?;
        self.connection.send(request::ORDER, &payload).await?;
        info!(order = %local_ref, change = ?change, "Modification sent");
        Ok(())
    }

    pub async fn cancel_order(&self, local_ref: &str) -> Result<()> {
        self.ensure_ready()?;
        let order = self.live_order(local_ref)?;
        let payload = build_cancel_order(&self.user_number, &order, Utc::now())?;
        self.connection.send(request::ORDER, &payload).await?;
        info!(order = %local_ref, "Cancellation sent");
        Ok(())
    }

    /// Ask the venue to replay the state of this user's orders
    pub async fn query_orders(&self) -> Result<()> {
        self.ensure_ready()?;
        let mut payload = PayloadBuilder::new();
        payload.fixed(&self.user_number, USER_NUMBER_WIDTH, FILLER);
        self.connection
            .send(request::ORDER_BOOK_QUERY, &payload.finish())
            .await
    }

    pub fn order(&self, local_ref: &str) -> Option<Order> {
        self.handler.tracker.get(local_ref)
    }

    pub fn orders(&self) -> Vec<Order> {
        self.handler.tracker.all()
    }

    pub fn open_orders(&self) -> Vec<Order> {
        self.handler.tracker.open()
    }
}

impl Drop for OrderEntrySession {
    fn drop(&mut self) {
        self.connection.signal_shutdown();
    }
}
