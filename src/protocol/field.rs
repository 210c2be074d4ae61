//! Field codec
//!
//! A field is one length byte (`payload length + 32`) followed by the payload.
//! An empty value travels as the reserved blank form: length byte 33 and a
//! single space.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{GlError, Result};

/// Added to the payload length to form the length byte
pub const LENGTH_OFFSET: u8 = 32;
/// Longest value a single length byte can describe
pub const MAX_FIELD_LEN: usize = (u8::MAX - LENGTH_OFFSET) as usize;
/// Wire form of an empty field
pub const BLANK_FIELD: [u8; 2] = [LENGTH_OFFSET + 1, b' '];

/// Encode a single value, blank form for empty strings.
///
/// A lone space has the same wire form as the blank, so it decodes as `""`.
pub fn encode_field(value: &str) -> Result<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(value.len() + 1);
    put_field(&mut buf, value)?;
    Ok(buf.to_vec())
}

/// Append an encoded field to `buf`
pub fn put_field(buf: &mut BytesMut, value: &str) -> Result<()> {
    if value.is_empty() {
        buf.put_slice(&BLANK_FIELD);
        return Ok(());
    }

    let bytes = to_wire_bytes(value);
    if bytes.len() > MAX_FIELD_LEN {
        return Err(GlError::FieldTooLong { len: bytes.len() });
    }

    buf.put_u8(bytes.len() as u8 + LENGTH_OFFSET);
    buf.put_slice(&bytes);
    Ok(())
}

/// Decode the field starting at `position`.
///
/// Returns the value and the number of bytes consumed. Out-of-range positions,
/// zero lengths and lengths that overrun the buffer all yield `("", 0)` so the
/// caller decides whether to skip ahead or abandon the message.
pub fn decode_field(buf: &[u8], position: usize) -> (String, usize) {
    let Some(&length_byte) = buf.get(position) else {
        return (String::new(), 0);
    };
    if length_byte <= LENGTH_OFFSET {
        return (String::new(), 0);
    }

    let len = (length_byte - LENGTH_OFFSET) as usize;
    let start = position + 1;
    let end = start + len;
    if end > buf.len() {
        return (String::new(), 0);
    }

    let raw = &buf[start..end];
    if raw == b" " {
        return (String::new(), len + 1);
    }
    (from_wire_bytes(raw), len + 1)
}

/// Latin-1 mapping: the venue sends single-byte text
fn to_wire_bytes(value: &str) -> Vec<u8> {
    value
        .chars()
        .map(|c| if (c as u32) <= 0xFF { c as u8 } else { b'?' })
        .collect()
}

fn from_wire_bytes(raw: &[u8]) -> String {
    raw.iter().map(|&b| b as char).collect()
}

/// Cursor over a frame payload
#[derive(Debug, Clone)]
pub struct FieldReader<'a> {
    buf: &'a [u8],
    position: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, position: 0 }
    }

    /// Next encoded field, `None` at the end of the payload or on a malformed length
    pub fn next_field(&mut self) -> Option<String> {
        let (value, consumed) = decode_field(self.buf, self.position);
        if consumed == 0 {
            return None;
        }
        self.position += consumed;
        Some(value)
    }

    /// Next raw byte, used for field-number markers
    pub fn next_byte(&mut self) -> Option<u8> {
        let byte = *self.buf.get(self.position)?;
        self.position += 1;
        Some(byte)
    }

    /// Fixed-width ASCII slot, trimmed of padding
    pub fn next_fixed(&mut self, width: usize) -> Option<String> {
        let end = self.position.checked_add(width)?;
        let raw = self.buf.get(self.position..end)?;
        self.position = end;
        Some(from_wire_bytes(raw).trim().to_string())
    }

    /// Skip `count` bytes of filler
    pub fn skip(&mut self, count: usize) -> bool {
        if self.remaining() < count {
            return false;
        }
        self.position += count;
        true
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.position)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

/// Incremental payload writer
#[derive(Debug, Default)]
pub struct PayloadBuilder {
    buf: BytesMut,
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(128),
        }
    }

    /// Append one encoded field
    pub fn field(&mut self, value: &str) -> Result<&mut Self> {
        put_field(&mut self.buf, value)?;
        Ok(self)
    }

    /// Append a `(field id, value)` pair, both field-encoded
    pub fn pair(&mut self, id: u8, value: &str) -> Result<&mut Self> {
        put_field(&mut self.buf, &id.to_string())?;
        put_field(&mut self.buf, value)?;
        Ok(self)
    }

    /// Append a fixed-width slot, left-aligned and padded with `pad`
    pub fn fixed(&mut self, value: &str, width: usize, pad: u8) -> &mut Self {
        let bytes = to_wire_bytes(value);
        let take = bytes.len().min(width);
        self.buf.put_slice(&bytes[..take]);
        self.buf.put_bytes(pad, width - take);
        self
    }

    /// Append raw bytes unchanged
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}
