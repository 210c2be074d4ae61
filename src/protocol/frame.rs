//! Message framer
//!
//! Header layout (offsets relative to the start marker):
//!
//! | offset | width | content                  |
//! |--------|-------|--------------------------|
//! | 0      | 1     | start marker             |
//! | 1      | 1     | version / flags          |
//! | 2      | 5     | content length (payload) |
//! | 7      | 5     | called address           |
//! | 12     | 5     | filler                   |
//! | 17     | 5     | calling address          |
//! | 22     | 2     | filler                   |
//! | 24     | 5     | request number           |
//! | 29     | 3     | filler                   |

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::{
    ETX, FILLER, FOOTER_LEN, HEADER_LEN, LENGTH_PREFIX_LEN, MAX_CANDIDATE_LEN, MAX_HEADER_NUMBER,
    MIN_FRAME_LEN, PROTOCOL_VERSION, STX,
};
use crate::error::{GlError, Result};

const NUMERIC_WIDTH: usize = 5;
const NUMERIC_MODULUS: u32 = MAX_HEADER_NUMBER + 1;

/// Called / calling addresses carried by every header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
    pub called: u32,
    pub calling: u32,
}

impl Routing {
    pub fn new(called: u32, calling: u32) -> Self {
        Self { called, calling }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub content_length: usize,
    pub routing: Routing,
    pub request: u32,
}

/// A complete inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    pub fn request(&self) -> u32 {
        self.header.request
    }
}

/// Assemble a complete frame around `payload`.
///
/// Output depends only on the arguments, so identical inputs produce
/// byte-identical frames.
pub fn build_message(payload: &[u8], request: u32, routing: Routing) -> Result<Bytes> {
    let total = MIN_FRAME_LEN + payload.len();
    if total > MAX_CANDIDATE_LEN {
        return Err(GlError::FrameTooLarge(total));
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u16_le(total as u16);

    buf.put_u8(STX);
    buf.put_u8(PROTOCOL_VERSION);
    put_numeric(&mut buf, payload.len() as u32);
    put_numeric(&mut buf, routing.called);
    buf.put_bytes(FILLER, 5);
    put_numeric(&mut buf, routing.calling);
    buf.put_bytes(FILLER, 2);
    put_numeric(&mut buf, request);
    buf.put_bytes(FILLER, 3);

    buf.put_slice(payload);

    buf.put_bytes(FILLER, 2);
    buf.put_u8(ETX);

    debug_assert_eq!(buf.len(), total);
    Ok(buf.freeze())
}

fn put_numeric(buf: &mut BytesMut, value: u32) {
    let digits = format!("{:0width$}", value % NUMERIC_MODULUS, width = NUMERIC_WIDTH);
    buf.put_slice(digits.as_bytes());
}

/// Split a complete frame (length prefix included) into header and payload
pub fn parse_header(frame: &Bytes) -> Result<Frame> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(GlError::MalformedHeader(format!(
            "frame of {} bytes is shorter than {}",
            frame.len(),
            MIN_FRAME_LEN
        )));
    }

    let declared = u16::from_le_bytes([frame[0], frame[1]]) as usize;
    if declared < MIN_FRAME_LEN || declared > frame.len() {
        return Err(GlError::MalformedHeader(format!(
            "declared length {} does not fit frame of {} bytes",
            declared,
            frame.len()
        )));
    }
    if frame[declared - 1] != ETX {
        return Err(GlError::MalformedHeader(format!(
            "end marker missing at offset {}",
            declared - 1
        )));
    }

    let header = &frame[LENGTH_PREFIX_LEN..LENGTH_PREFIX_LEN + HEADER_LEN];
    if header[0] != STX {
        return Err(GlError::MalformedHeader("start marker missing".to_string()));
    }

    let request = read_numeric(&header[24..29])
        .ok_or_else(|| GlError::MalformedHeader("unreadable request number".to_string()))?;
    let content_length = read_numeric(&header[2..7])
        .ok_or_else(|| GlError::MalformedHeader("unreadable content length".to_string()))?
        as usize;

    let payload_start = LENGTH_PREFIX_LEN + HEADER_LEN;
    let payload_end = declared - FOOTER_LEN;
    if content_length != payload_end - payload_start {
        return Err(GlError::MalformedHeader(format!(
            "content length {} disagrees with payload of {} bytes",
            content_length,
            payload_end - payload_start
        )));
    }

    Ok(Frame {
        header: Header {
            version: header[1],
            content_length,
            routing: Routing {
                called: read_numeric(&header[7..12]).unwrap_or(0),
                calling: read_numeric(&header[17..22]).unwrap_or(0),
            },
            request,
        },
        payload: frame.slice(payload_start..payload_end),
    })
}

/// Parse a space- or zero-padded ASCII number; blank slots read as zero
fn read_numeric(raw: &[u8]) -> Option<u32> {
    let text = std::str::from_utf8(raw).ok()?.trim();
    if text.is_empty() {
        return Some(0);
    }
    text.parse().ok()
}
