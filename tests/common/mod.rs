//! In-process fake venue for session tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use gl_connect::order::builder::USER_NUMBER_WIDTH;
use gl_connect::protocol::{
    build_message, parse_header, request, PayloadBuilder, CLIENT_IDENTIFICATION, FILLER,
};
use gl_connect::{Frame, FrameAssembler, Routing, SessionSettings};

pub const KEY: &str = "400000001000ABC";
pub const ASSIGNED_ADDRESS: u32 = 77;

#[derive(Debug, Clone, Copy)]
pub enum Login {
    Accept,
    Reject(&'static str),
    WrongRequest,
    Silent,
}

pub struct FakeVenue {
    pub addr: SocketAddr,
    received: mpsc::UnboundedReceiver<Frame>,
    outbound: mpsc::UnboundedSender<Option<Bytes>>,
}

impl FakeVenue {
    pub async fn start(login: Login) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, received) = mpsc::unbounded_channel();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Option<Bytes>>();

        tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };

            let mut preamble = [0u8; CLIENT_IDENTIFICATION.len()];
            if stream.read_exact(&mut preamble).await.is_err() || &preamble[..] != CLIENT_IDENTIFICATION {
                return;
            }

            let mut assembler = FrameAssembler::new();
            let mut buf = vec![0u8; 4096];
            let mut logged_in = false;
            loop {
                while let Some(raw) = assembler.next_frame() {
                    let frame = parse_header(&raw).unwrap();
                    if !logged_in && frame.request() == request::LOGIN {
                        logged_in = true;
                        let response = match login {
                            Login::Accept => Some(login_response(request::LOGIN, "0")),
                            Login::Reject(code) => Some(login_response(request::LOGIN, code)),
                            Login::WrongRequest => Some(login_response(request::SNAPSHOT, "0")),
                            Login::Silent => None,
                        };
                        if let Some(response) = response {
                            if stream.write_all(&response).await.is_err() {
                                return;
                            }
                        }
                        continue;
                    }
                    let _ = received_tx.send(frame);
                }

                tokio::select! {
                    read = stream.read(&mut buf) => match read {
                        Ok(0) | Err(_) => return,
                        Ok(n) => assembler.push(&buf[..n]),
                    },
                    out = outbound_rx.recv() => match out {
                        Some(Some(bytes)) => {
                            if stream.write_all(&bytes).await.is_err() {
                                return;
                            }
                        }
                        // Venue hangs up
                        Some(None) | None => return,
                    },
                }
            }
        });

        Self {
            addr,
            received,
            outbound,
        }
    }

    pub fn settings(&self) -> SessionSettings {
        SessionSettings::new("127.0.0.1", self.addr.port(), "trader", "secret")
            .with_routing(Routing::new(1, 5))
            .with_login_timeout(Duration::from_secs(2))
    }

    /// Next frame the client sent after login
    pub async fn expect_frame(&mut self) -> Frame {
        timeout(Duration::from_secs(2), self.received.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("venue connection ended")
    }

    /// Assert nothing else arrives within a short window
    pub async fn expect_silence(&mut self) {
        if let Ok(Some(frame)) = timeout(Duration::from_millis(150), self.received.recv()).await {
            panic!("unexpected frame {:?}", frame.header);
        }
    }

    pub fn push(&self, request: u32, payload: &[u8]) {
        let frame = build_message(payload, request, Routing::new(ASSIGNED_ADDRESS, 1)).unwrap();
        self.outbound.send(Some(frame)).unwrap();
    }

    pub fn push_raw(&self, bytes: &[u8]) {
        self.outbound.send(Some(Bytes::copy_from_slice(bytes))).unwrap();
    }

    pub fn hang_up(&self) {
        let _ = self.outbound.send(None);
    }
}

fn login_response(request: u32, code: &str) -> Bytes {
    let mut payload = PayloadBuilder::new();
    payload.field(code).unwrap().field("welcome").unwrap();
    build_message(&payload.finish(), request, Routing::new(ASSIGNED_ADDRESS, 1)).unwrap()
}

pub fn fields(values: &[&str]) -> Bytes {
    let mut payload = PayloadBuilder::new();
    for value in values {
        payload.field(value).unwrap();
    }
    payload.finish()
}

/// Real-time update payload: key then `(number + 32, value)` entries
pub fn update(key: &str, entries: &[(u8, &str)]) -> Bytes {
    let mut payload = PayloadBuilder::new();
    payload.field(key).unwrap();
    for (number, value) in entries {
        payload.raw(&[number + 32]);
        payload.field(value).unwrap();
    }
    payload.finish()
}

pub fn order_reply(kind: u8, pairs: &[(u8, &str)]) -> Bytes {
    let mut payload = PayloadBuilder::new();
    payload
        .raw(b"0")
        .fixed("1234", USER_NUMBER_WIDTH, FILLER)
        .raw(&[b'O', kind])
        .fixed("00001", 5, FILLER)
        .fixed("00001", 5, FILLER);
    payload.field("ABC").unwrap();
    for (id, value) in pairs {
        payload.pair(*id, value).unwrap();
    }
    payload.finish()
}
