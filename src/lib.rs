//! gl-connect - exchange connectivity over the GL binary protocol
//!
//! This crate provides the protocol engine (field codec, framing, stream
//! reassembly), a market-data session with a subscription-backed snapshot
//! cache, and an order-entry session that tracks order lifecycles.

pub mod config;
pub mod error;
pub mod market;
pub mod metrics;
pub mod order;
pub mod protocol;
pub mod publisher;
pub mod session;

pub use config::Config;
pub use error::{GlError, Result};
pub use market::{Instrument, MarketSnapshot, SnapshotCache};
pub use order::{Order, OrderModification, OrderReply, OrderRequest, OrderStatus, ReplyKind};
pub use protocol::{Frame, FrameAssembler, Routing};
pub use publisher::Publisher;
pub use session::{
    EventHub, ListenerId, MarketDataSession, MarketEvent, OrderEntrySession, OrderEvent,
    SessionSettings, SessionState,
};
