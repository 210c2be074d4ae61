//! gl-connect - connectivity daemon
//!
//! Logs both sessions in, loads the instrument dictionary, subscribes the
//! configured instruments and forwards every session event to the IPC
//! publisher until Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gl_connect::{
    Config, MarketDataSession, MarketEvent, OrderEntrySession, OrderEvent, Publisher,
    SessionState,
};

/// Application state shared with the health server
struct AppState {
    market_data: MarketDataSession,
    order_entry: OrderEntrySession,
    publisher: Publisher,
    config: Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting gl-connect");

    let config = Config::load()?;
    info!(
        market_data = %format!("{}:{}", config.market_data_host, config.market_data_port),
        order_entry = %format!("{}:{}", config.order_entry_host, config.order_entry_port),
        "Configuration loaded"
    );

    let publisher = Publisher::new(&config.ipc_socket_path).await?;
    let state = Arc::new(AppState {
        market_data: MarketDataSession::new(),
        order_entry: OrderEntrySession::new(&config.user_number),
        publisher,
        config,
    });

    let health_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state).await {
            warn!(error = %e, "Health server error");
        }
    });

    // Receivers first so nothing emitted during startup is missed
    let market_events = state.market_data.events().subscribe();
    let order_events = state.order_entry.events().subscribe();
    let forwarder = tokio::spawn(forward_events(state.clone(), market_events, order_events));

    let config = &state.config;
    state
        .market_data
        .connect_and_login(&config.market_data_settings())
        .await?;
    state
        .order_entry
        .connect_and_login(&config.order_entry_settings())
        .await?;

    let catalog = config.dictionary_catalog();
    if !catalog.is_empty() {
        let instruments = state
            .market_data
            .load_dictionary(&catalog, config.dictionary_delay(), config.dictionary_quiet_period())
            .await?;
        info!(count = instruments.len(), "Instrument dictionary ready");
    }

    for key in config.subscription_keys() {
        if let Err(e) = state.market_data.subscribe(&key).await {
            warn!(key = %key, error = %e, "Subscription failed");
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    state.market_data.disconnect().await;
    state.order_entry.disconnect().await;
    forwarder.abort();

    Ok(())
}

/// Publish session events for the life of the process
async fn forward_events(
    state: Arc<AppState>,
    mut market_events: tokio::sync::broadcast::Receiver<MarketEvent>,
    mut order_events: tokio::sync::broadcast::Receiver<OrderEvent>,
) {
    loop {
        let published = tokio::select! {
            event = market_events.recv() => match event {
                Ok(MarketEvent::SnapshotUpdated(snapshot)) => {
                    state.publisher.publish("snapshot", snapshot.as_ref()).await
                }
                Ok(MarketEvent::InstrumentsReceived(instruments)) => {
                    state.publisher.publish("instruments", &instruments).await
                }
                Ok(MarketEvent::Disconnected) => {
                    warn!("Market-data session disconnected");
                    state.publisher.publish("market_data_disconnected", &()).await
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Market event forwarder lagging");
                    Ok(())
                }
                Err(RecvError::Closed) => break,
            },
            event = order_events.recv() => match event {
                Ok(event) => state.publisher.publish("order", &event).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Order event forwarder lagging");
                    Ok(())
                }
                Err(RecvError::Closed) => break,
            },
        };

        if let Err(e) = published {
            error!(error = %e, "Failed to publish event");
        }
    }
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(state: Arc<AppState>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.health_port));
    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let market_data = state.market_data.state();
    let order_entry = state.order_entry.state();
    let healthy = market_data == SessionState::Ready && order_entry == SessionState::Ready;
    let publisher_connected = state.publisher.is_connected().await;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "market_data": market_data,
            "order_entry": order_entry,
            "subscriptions": state.market_data.subscriptions().len(),
            "open_orders": state.order_entry.open_orders().len(),
            "publisher_connected": publisher_connected,
            "timestamp": chrono::Utc::now().to_rfc3339()
        })),
    )
}

async fn metrics() -> (StatusCode, String) {
    use prometheus::{Encoder, TextEncoder};
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    match String::from_utf8(buffer) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
