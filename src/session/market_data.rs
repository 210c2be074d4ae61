//! Market-data session
//!
//! Reference-data dictionary, one-shot snapshots and real-time subscriptions.
//! Subscribed instruments are cached; everything decoded is also emitted as a
//! [`MarketEvent`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::connection::{Connection, FrameHandler};
use super::events::{EventHub, MarketEvent};
use super::{SessionSettings, SessionState};
use crate::error::{GlError, Result};
use crate::market::{
    parse_dictionary, parse_snapshot, parse_update, split_key, Instrument, MarketSnapshot,
    SnapshotCache,
};
use crate::metrics;
use crate::protocol::{request, Frame, PayloadBuilder};

const SESSION_NAME: &str = "market_data";

/// Pause between catalog requests so the venue is not flooded
pub const DEFAULT_DICTIONARY_DELAY: Duration = Duration::from_millis(200);
/// No new instrument for this long ends a dictionary load
pub const DEFAULT_DICTIONARY_QUIET_PERIOD: Duration = Duration::from_secs(5);

struct MarketHandler {
    cache: SnapshotCache,
    events: EventHub<MarketEvent>,
}

impl FrameHandler for MarketHandler {
    fn on_frame(&self, frame: Frame) -> Result<()> {
        match frame.request() {
            request::DICTIONARY => {
                let instruments = parse_dictionary(&frame.payload);
                if instruments.is_empty() {
                    info!("Dictionary response without records");
                    return Ok(());
                }
                debug!(count = instruments.len(), "Instruments received");
                self.events.emit(MarketEvent::InstrumentsReceived(instruments));
            }
            request::SNAPSHOT | request::SNAPSHOT_AND_REFRESH => {
                let Some(snapshot) = parse_snapshot(&frame.payload) else {
                    metrics::record_decode_error("snapshot");
                    return Ok(());
                };
                // One-shot snapshots of unsubscribed keys are emitted, not cached
                let record = match self.cache.store_snapshot(snapshot.clone()) {
                    Some(record) => record,
                    None => Arc::new(snapshot),
                };
                self.events.emit(MarketEvent::SnapshotUpdated(record));
            }
            request::REALTIME_UPDATE => {
                let Some(update) = parse_update(&frame.payload) else {
                    metrics::record_decode_error("update");
                    return Ok(());
                };
                if let Some(record) = self.cache.apply_update(&update) {
                    self.events.emit(MarketEvent::SnapshotUpdated(record));
                }
            }
            request::STOP_REFRESH => debug!("Stop-refresh acknowledged"),
            other => debug!(request = other, "Unhandled market-data frame"),
        }
        Ok(())
    }

    fn on_disconnect(&self) {
        let dropped = self.cache.clear();
        if !dropped.is_empty() {
            info!(subscriptions = dropped.len(), "Subscriptions dropped on disconnect");
        }
        self.events.emit(MarketEvent::Disconnected);
    }
}

pub struct MarketDataSession {
    connection: Arc<Connection>,
    handler: Arc<MarketHandler>,
}

impl Default for MarketDataSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketDataSession {
    pub fn new() -> Self {
        Self {
            connection: Arc::new(Connection::new(SESSION_NAME)),
            handler: Arc::new(MarketHandler {
                cache: SnapshotCache::new(),
                events: EventHub::default(),
            }),
        }
    }

    pub async fn connect_and_login(&self, settings: &SessionSettings) -> Result<()> {
        self.connection.open(settings, self.handler.clone()).await?;
        Ok(())
    }

    /// Unsubscribe everything (best effort), close and clear the cache
    pub async fn disconnect(&self) {
        for key in self.handler.cache.subscriptions() {
            if !self.connection.is_ready() {
                break;
            }
            if let Err(e) = self.send_key(request::STOP_REFRESH, &key).await {
                debug!(key = %key, error = %e, "Unsubscribe on disconnect failed");
            }
        }
        self.connection.close().await;
        self.handler.cache.clear();
    }

    pub fn state(&self) -> SessionState {
        self.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.connection.watch_state()
    }

    pub fn events(&self) -> &EventHub<MarketEvent> {
        &self.handler.events
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.connection.is_ready() {
            Ok(())
        } else {
            Err(GlError::NotConnected)
        }
    }

    async fn send_key(&self, request: u32, key: &str) -> Result<()> {
        let mut payload = PayloadBuilder::new();
        payload.field(key)?;
        self.connection.send(request, &payload.finish()).await
    }

    /// Ask for the instruments of one exchange / market pair
    pub async fn request_dictionary(&self, exchange: &str, market: &str) -> Result<()> {
        self.ensure_ready()?;
        let mut payload = PayloadBuilder::new();
        payload.field(exchange)?.field(market)?;
        debug!(exchange = %exchange, market = %market, "Requesting dictionary");
        self.connection.send(request::DICTIONARY, &payload.finish()).await
    }

    /// Request every catalog entry, pausing `delay` between requests
    pub async fn request_full_dictionary(
        &self,
        catalog: &[(String, String)],
        delay: Duration,
    ) -> Result<()> {
        for (i, (exchange, market)) in catalog.iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                sleep(delay).await;
            }
            self.request_dictionary(exchange, market).await?;
        }
        Ok(())
    }

    /// Request the whole catalog and collect instruments until none arrive
    /// for `quiet_period`. Instruments are deduplicated by key and sorted.
    pub async fn load_dictionary(
        &self,
        catalog: &[(String, String)],
        delay: Duration,
        quiet_period: Duration,
    ) -> Result<Vec<Instrument>> {
        let mut events = self.handler.events.subscribe();
        self.request_full_dictionary(catalog, delay).await?;

        let mut instruments: BTreeMap<String, Instrument> = BTreeMap::new();
        let mut deadline = Instant::now() + quiet_period;
        loop {
            match timeout_at(deadline, events.recv()).await {
                Ok(Ok(MarketEvent::InstrumentsReceived(batch))) => {
                    let before = instruments.len();
                    for instrument in batch {
                        instruments.insert(instrument.key(), instrument);
                    }
                    if instruments.len() > before {
                        deadline = Instant::now() + quiet_period;
                    }
                }
                Ok(Ok(MarketEvent::Disconnected)) => return Err(GlError::NotConnected),
                Ok(Ok(_)) => {}
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(skipped, "Dictionary load fell behind the event stream");
                }
                Ok(Err(RecvError::Closed)) | Err(_) => break,
            }
        }

        info!(count = instruments.len(), "Dictionary loaded");
        Ok(instruments.into_values().collect())
    }

    /// One-shot snapshot without a real-time feed
    pub async fn request_snapshot(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.ensure_ready()?;
        self.send_key(request::SNAPSHOT, key).await
    }

    /// Start the real-time feed for `key`.
    ///
    /// Returns `Ok(false)` without sending anything when already subscribed.
    pub async fn subscribe(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.ensure_ready()?;
        if !self.handler.cache.add_subscription(key) {
            return Ok(false);
        }

        if let Err(e) = self.send_key(request::SNAPSHOT_AND_REFRESH, key).await {
            self.handler.cache.remove_subscription(key);
            return Err(e);
        }
        info!(key = %key, "Subscribed");
        Ok(true)
    }

    /// Stop the feed for `key` and evict its snapshot.
    ///
    /// Returns `Ok(false)` without sending anything when not subscribed.
    pub async fn unsubscribe(&self, key: &str) -> Result<bool> {
        if !self.handler.cache.remove_subscription(key) {
            return Ok(false);
        }
        self.send_key(request::STOP_REFRESH, key).await?;
        info!(key = %key, "Unsubscribed");
        Ok(true)
    }

    pub fn is_subscribed(&self, key: &str) -> bool {
        self.handler.cache.is_subscribed(key)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.handler.cache.subscriptions()
    }

    pub fn snapshot(&self, key: &str) -> Option<Arc<MarketSnapshot>> {
        self.handler.cache.get(key)
    }

    pub fn snapshots(&self) -> Vec<Arc<MarketSnapshot>> {
        self.handler.cache.snapshots()
    }
}

impl Drop for MarketDataSession {
    fn drop(&mut self) {
        self.connection.signal_shutdown();
    }
}

fn validate_key(key: &str) -> Result<()> {
    match split_key(key) {
        Some(_) => Ok(()),
        None => Err(GlError::InvalidInstrumentKey(key.to_string())),
    }
}
