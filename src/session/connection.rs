//! Transport, login handshake and receive loop
//!
//! One background task owns the read half and the reassembly buffer. Writes
//! come from any caller and are serialized through the writer mutex, so
//! frames never interleave on the wire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::{SessionSettings, SessionState, DEFAULT_REQUEST_TIMEOUT};
use crate::error::{GlError, Result};
use crate::metrics;
use crate::protocol::{
    build_message, parse_header, request, FieldReader, Frame, FrameAssembler, PayloadBuilder,
    Routing, CLIENT_IDENTIFICATION,
};

const READ_BUFFER_LEN: usize = 16 * 1024;

/// Receives every frame the loop reassembles
pub trait FrameHandler: Send + Sync + 'static {
    /// Errors are logged; they never stop the loop
    fn on_frame(&self, frame: Frame) -> Result<()>;

    /// Called once when the loop exits, whatever the cause
    fn on_disconnect(&self);
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct Connection {
    name: &'static str,
    state: watch::Sender<SessionState>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    routing: Mutex<Routing>,
    request_timeout_ms: AtomicU64,
    running: Mutex<Option<Running>>,
}

impl Connection {
    pub fn new(name: &'static str) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            name,
            state,
            writer: tokio::sync::Mutex::new(None),
            routing: Mutex::new(Routing::default()),
            request_timeout_ms: AtomicU64::new(DEFAULT_REQUEST_TIMEOUT.as_millis() as u64),
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Routing used for outbound headers, including the server-assigned
    /// calling address once logged in
    pub fn routing(&self) -> Routing {
        *self.routing.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_routing(&self, routing: Routing) {
        *self.routing.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = routing;
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(session = self.name, from = ?previous, to = ?state, "Session state changed");
        }
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.load(Ordering::Relaxed))
    }

    /// Connect, identify, log in and start the receive loop.
    ///
    /// Returns the login response. On failure the session is back in
    /// `Disconnected` with nothing left open.
    pub async fn open(
        self: &Arc<Self>,
        settings: &SessionSettings,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Frame> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == SessionState::Disconnected {
                *state = SessionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(GlError::AlreadyConnected);
        }

        match self.establish(settings).await {
            Ok((reader, writer, assembler, login)) => {
                *self.writer.lock().await = Some(writer);
                self.request_timeout_ms
                    .store(settings.request_timeout.as_millis() as u64, Ordering::Relaxed);

                // Hold the slot while spawning so a loop that exits at once
                // cannot clear it (and go Disconnected) before we go Ready
                {
                    let mut running = self.running();
                    let (shutdown, shutdown_rx) = watch::channel(false);
                    let task = tokio::spawn(self.clone().receive_loop(
                        reader,
                        assembler,
                        shutdown_rx,
                        handler,
                    ));
                    *running = Some(Running { shutdown, task });
                    self.set_state(SessionState::Ready);
                }
                info!(
                    session = self.name,
                    address = %settings.address(),
                    calling = self.routing().calling,
                    "Session ready"
                );
                Ok(login)
            }
            Err(e) => {
                warn!(session = self.name, address = %settings.address(), error = %e, "Login failed");
                self.set_state(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        settings: &SessionSettings,
    ) -> Result<(OwnedReadHalf, OwnedWriteHalf, FrameAssembler, Frame)> {
        let address = settings.address();
        info!(session = self.name, address = %address, "Connecting");

        let mut stream = timeout(settings.login_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| GlError::ConnectionTimeout)??;
        stream.set_nodelay(true)?;

        self.set_state(SessionState::LoggingIn);
        let mut assembler = FrameAssembler::new();
        let login = timeout(
            settings.login_timeout,
            self.handshake(&mut stream, settings, &mut assembler),
        )
        .await
        .map_err(|_| GlError::ConnectionTimeout)??;

        let (reader, writer) = stream.into_split();
        Ok((reader, writer, assembler, login))
    }

    async fn handshake(
        &self,
        stream: &mut TcpStream,
        settings: &SessionSettings,
        assembler: &mut FrameAssembler,
    ) -> Result<Frame> {
        stream.write_all(CLIENT_IDENTIFICATION).await?;

        let mut payload = PayloadBuilder::new();
        payload
            .field(&settings.username)?
            .field(&settings.password)?
            .field(&settings.client_version)?;
        let message = build_message(&payload.finish(), request::LOGIN, settings.routing)?;
        stream.write_all(&message).await?;
        metrics::record_frame_sent(self.name, request::LOGIN);

        let response = read_frame(stream, assembler).await?;
        metrics::record_frame_received(self.name, response.request());
        if response.request() != request::LOGIN {
            return Err(GlError::LoginFailed(format!(
                "unexpected response to login: request {}",
                response.request()
            )));
        }

        let mut reader = FieldReader::new(&response.payload);
        if let Some(code) = reader.next_field() {
            let code = code.trim();
            if !code.is_empty() && code != "0" {
                let message = reader.next_field().unwrap_or_default();
                return Err(GlError::LoginFailed(format!("code {} {}", code, message.trim())));
            }
        }

        let mut routing = settings.routing;
        let assigned = response.header.routing.called;
        if assigned != 0 {
            routing.calling = assigned;
        }
        self.set_routing(routing);

        Ok(response)
    }

    /// Frame and write one request
    pub async fn send(&self, request: u32, payload: &[u8]) -> Result<()> {
        let message = build_message(payload, request, self.routing())?;

        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(GlError::NotConnected);
        };

        let error = match timeout(self.request_timeout(), stream.write_all(&message)).await {
            Ok(Ok(())) => {
                metrics::record_frame_sent(self.name, request);
                trace!(session = self.name, request, len = message.len(), "Frame sent");
                return Ok(());
            }
            Ok(Err(e)) => GlError::from(e),
            Err(_) => GlError::ConnectionTimeout,
        };

        // A failed or stalled write leaves the stream in an unknown state
        warn!(session = self.name, request, error = %error, "Write failed, closing session");
        *writer = None;
        drop(writer);
        self.signal_shutdown();
        Err(error)
    }

    /// Close the transport and wait for the receive loop to finish.
    ///
    /// Safe to call concurrently and repeatedly; only the first call has any
    /// effect.
    pub async fn close(&self) {
        let running = self.running().take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            if let Err(e) = running.task.await {
                warn!(session = self.name, error = %e, "Receive loop ended abnormally");
            }
        }
        self.release_writer().await;
        self.set_state(SessionState::Disconnected);
    }

    /// Ask the receive loop to stop without waiting for it
    pub fn signal_shutdown(&self) {
        if let Some(running) = self.running().take() {
            let _ = running.shutdown.send(true);
        }
    }

    async fn release_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(session = self.name, error = %e, "Error shutting down writer");
            }
        }
    }

    async fn receive_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        mut assembler: FrameAssembler,
        mut shutdown: watch::Receiver<bool>,
        handler: Arc<dyn FrameHandler>,
    ) {
        // Frames that arrived together with the login response
        self.dispatch(&mut assembler, handler.as_ref());

        let mut buf = vec![0u8; READ_BUFFER_LEN];
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(session = self.name, "Receive loop cancelled");
                        break;
                    }
                }
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        info!(session = self.name, "Peer closed the connection");
                        break;
                    }
                    Ok(n) => {
                        assembler.push(&buf[..n]);
                        self.dispatch(&mut assembler, handler.as_ref());
                    }
                    Err(e) => {
                        warn!(session = self.name, error = %e, "Read failed");
                        break;
                    }
                }
            }
        }

        self.running().take();
        self.release_writer().await;
        self.set_state(SessionState::Disconnected);
        handler.on_disconnect();
        info!(
            session = self.name,
            discarded_bytes = assembler.discarded(),
            "Session disconnected"
        );
    }

    fn dispatch(&self, assembler: &mut FrameAssembler, handler: &dyn FrameHandler) {
        while let Some(raw) = assembler.next_frame() {
            let frame = match parse_header(&raw) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(session = self.name, error = %e, "Dropping malformed frame");
                    metrics::record_decode_error("header");
                    continue;
                }
            };

            let request = frame.request();
            metrics::record_frame_received(self.name, request);
            trace!(session = self.name, request, len = frame.payload.len(), "Frame received");
            if let Err(e) = handler.on_frame(frame) {
                warn!(session = self.name, request, error = %e, "Frame handler failed");
            }
        }
    }
}

/// Read until the first complete, well-formed frame
async fn read_frame(stream: &mut TcpStream, assembler: &mut FrameAssembler) -> Result<Frame> {
    let mut buf = vec![0u8; READ_BUFFER_LEN];
    loop {
        while let Some(raw) = assembler.next_frame() {
            match parse_header(&raw) {
                Ok(frame) => return Ok(frame),
                Err(e) => {
                    warn!(error = %e, "Dropping malformed frame during login");
                    metrics::record_decode_error("header");
                }
            }
        }

        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(GlError::Transport("connection closed during login".to_string()));
        }
        assembler.push(&buf[..n]);
    }
}
