//! Prometheus counters for the protocol engine

use std::sync::OnceLock;

use prometheus::{IntCounter, IntCounterVec, Opts};
use tracing::warn;

struct Metrics {
    frames_received: IntCounterVec,
    frames_sent: IntCounterVec,
    discarded_bytes: IntCounter,
    decode_errors: IntCounterVec,
}

static METRICS: OnceLock<Option<Metrics>> = OnceLock::new();

fn metrics() -> Option<&'static Metrics> {
    METRICS.get_or_init(register).as_ref()
}

fn register() -> Option<Metrics> {
    let build = || -> prometheus::Result<Metrics> {
        let frames_received = IntCounterVec::new(
            Opts::new("gl_frames_received_total", "Complete frames received"),
            &["session", "request"],
        )?;
        let frames_sent = IntCounterVec::new(
            Opts::new("gl_frames_sent_total", "Frames written to the transport"),
            &["session", "request"],
        )?;
        let discarded_bytes = IntCounter::new(
            "gl_resync_discarded_bytes_total",
            "Bytes discarded while resynchronizing the stream",
        )?;
        let decode_errors = IntCounterVec::new(
            Opts::new("gl_decode_errors_total", "Malformed frames or fields"),
            &["kind"],
        )?;

        let registry = prometheus::default_registry();
        registry.register(Box::new(frames_received.clone()))?;
        registry.register(Box::new(frames_sent.clone()))?;
        registry.register(Box::new(discarded_bytes.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;

        Ok(Metrics {
            frames_received,
            frames_sent,
            discarded_bytes,
            decode_errors,
        })
    };

    match build() {
        Ok(metrics) => Some(metrics),
        Err(e) => {
            warn!(error = %e, "Failed to register metrics");
            None
        }
    }
}

pub fn record_frame_received(session: &str, request: u32) {
    if let Some(m) = metrics() {
        m.frames_received
            .with_label_values(&[session, &request.to_string()])
            .inc();
    }
}

pub fn record_frame_sent(session: &str, request: u32) {
    if let Some(m) = metrics() {
        m.frames_sent
            .with_label_values(&[session, &request.to_string()])
            .inc();
    }
}

pub fn record_discarded_bytes(count: usize) {
    if let Some(m) = metrics() {
        m.discarded_bytes.inc_by(count as u64);
    }
}

pub fn record_decode_error(kind: &str) {
    if let Some(m) = metrics() {
        m.decode_errors.with_label_values(&[kind]).inc();
    }
}
