//! Stream reassembler
//!
//! Rebuilds whole frames from an undifferentiated byte stream. The only
//! self-describing anchor is the (length prefix, start marker) pair, so the
//! buffer is scanned for a start marker whose preceding two bytes declare a
//! plausible length.

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use super::{
    ETX, LENGTH_PREFIX_LEN, MAX_CANDIDATE_LEN, MIN_CANDIDATE_LEN, MIN_FRAME_LEN,
    PROTOCOL_VERSION, STX,
};
use crate::metrics;

/// Discarding more than this many bytes in one go means the link lost sync
const MAX_UNSYNCED_BYTES: usize = 100;
/// Hard cap on buffered bytes
const MAX_BUFFERED_BYTES: usize = 64 * 1024;
/// Content-length digits, relative to the length prefix
const CONTENT_LENGTH_DIGITS: std::ops::Range<usize> = 4..9;

/// Growable reassembly buffer fed by transport reads
#[derive(Debug)]
pub struct FrameAssembler {
    buf: BytesMut,
    discarded: u64,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            discarded: 0,
        }
    }

    /// Append freshly read bytes
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_BUFFERED_BYTES {
            warn!(buffered = self.buf.len(), "Reassembly buffer overflow, clearing");
            let len = self.buf.len();
            self.discard(len);
        }
    }

    /// Extract the next complete frame, length prefix included.
    ///
    /// Call repeatedly after every `push`: one read may carry several frames.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            if self.buf.len() < LENGTH_PREFIX_LEN + 1 {
                return None;
            }

            let Some((start, len)) = self.find_candidate() else {
                // The trailing two bytes may be the prefix of a frame whose
                // start marker is still in flight.
                let unsynced = self.buf.len() - LENGTH_PREFIX_LEN;
                if unsynced > MAX_UNSYNCED_BYTES {
                    warn!(bytes = unsynced, "Stream desynchronized, discarding buffer");
                }
                self.discard(unsynced);
                return None;
            };

            if start > 0 {
                debug!(bytes = start, "Skipping bytes before frame boundary");
                self.discard(start);
            }

            if self.buf.len() < len {
                return None;
            }

            if self.buf[len - 1] != ETX {
                // Start marker and length were coincidental
                self.discard(1);
                continue;
            }

            return Some(self.buf.split_to(len).freeze());
        }
    }

    /// First start marker with a plausible length whose header does not
    /// contradict it. A candidate whose header is still in flight is returned
    /// so the caller waits for it.
    fn find_candidate(&self) -> Option<(usize, usize)> {
        (LENGTH_PREFIX_LEN..self.buf.len()).find_map(|i| {
            if self.buf[i] != STX {
                return None;
            }
            let len = u16::from_le_bytes([self.buf[i - 2], self.buf[i - 1]]) as usize;
            if !(MIN_CANDIDATE_LEN..=MAX_CANDIDATE_LEN).contains(&len) {
                return None;
            }
            let start = i - LENGTH_PREFIX_LEN;
            match self.header_agrees(start, len) {
                Some(false) => None,
                _ => Some((start, len)),
            }
        })
    }

    /// Whether the header at `start` is consistent with a frame of `len`
    /// bytes, `None` while it is incomplete
    fn header_agrees(&self, start: usize, len: usize) -> Option<bool> {
        let header = self.buf.get(start..start + CONTENT_LENGTH_DIGITS.end)?;
        if header[LENGTH_PREFIX_LEN + 1] != PROTOCOL_VERSION {
            return Some(false);
        }
        let digits = &header[CONTENT_LENGTH_DIGITS];
        if !digits.iter().all(u8::is_ascii_digit) {
            return Some(false);
        }
        let content = digits
            .iter()
            .fold(0usize, |acc, d| acc * 10 + (d - b'0') as usize);
        Some(len.checked_sub(MIN_FRAME_LEN) == Some(content))
    }

    fn discard(&mut self, count: usize) {
        let _ = self.buf.split_to(count);
        self.discarded += count as u64;
        metrics::record_discarded_bytes(count);
    }

    /// Bytes currently waiting for completion
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes thrown away while resynchronizing
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_message, parse_header, request, Routing};

    fn sample_frames() -> Vec<Bytes> {
        let routing = Routing::new(10, 20);
        vec![
            build_message(b"\x23ABC", request::SNAPSHOT, routing).unwrap(),
            build_message(b"", request::STOP_REFRESH, routing).unwrap(),
            build_message(&[b'Z'; 300], request::REALTIME_UPDATE, routing).unwrap(),
            build_message(b"\x21\x02\x03", request::ORDER_REPLY, routing).unwrap(),
        ]
    }

    fn drain(assembler: &mut FrameAssembler, out: &mut Vec<Bytes>) {
        while let Some(frame) = assembler.next_frame() {
            out.push(frame);
        }
    }

    fn feed_in_chunks(bytes: &[u8], chunk: usize) -> Vec<Bytes> {
        let mut assembler = FrameAssembler::new();
        let mut out = Vec::new();
        for piece in bytes.chunks(chunk) {
            assembler.push(piece);
            drain(&mut assembler, &mut out);
        }
        out
    }

    #[test]
    fn test_single_frame() {
        let frame = sample_frames().remove(0);
        let out = feed_in_chunks(&frame, frame.len());
        assert_eq!(out, vec![frame]);
    }

    #[test]
    fn test_coalesced_frames_in_one_read() {
        let frames = sample_frames();
        let stream: Vec<u8> = frames.iter().flat_map(|f| f.iter().copied()).collect();
        let out = feed_in_chunks(&stream, stream.len());
        assert_eq!(out, frames);
    }

    #[test]
    fn test_fragmentation_does_not_change_output() {
        let frames = sample_frames();
        let stream: Vec<u8> = frames.iter().flat_map(|f| f.iter().copied()).collect();
        let whole = feed_in_chunks(&stream, stream.len());
        for chunk in [1, 2, 3, 5, 7, 36, 37, 64, 301] {
            assert_eq!(feed_in_chunks(&stream, chunk), whole, "chunk size {}", chunk);
        }
    }

    #[test]
    fn test_irregular_chunks() {
        let frames = sample_frames();
        let stream: Vec<u8> = frames.iter().flat_map(|f| f.iter().copied()).collect();
        let mut assembler = FrameAssembler::new();
        let mut out = Vec::new();
        let mut pos = 0;
        let mut step = 1;
        while pos < stream.len() {
            let end = (pos + step).min(stream.len());
            assembler.push(&stream[pos..end]);
            drain(&mut assembler, &mut out);
            pos = end;
            step = step * 3 % 17 + 1;
        }
        assert_eq!(out, frames);
    }

    #[test]
    fn test_garbage_before_frame_is_discarded() {
        let frame = sample_frames().remove(0);
        for garbage_len in [1, 2, 3, 50, 99, 150, 400] {
            let mut stream = vec![b'x'; garbage_len];
            stream.extend_from_slice(&frame);

            let out = feed_in_chunks(&stream, stream.len());
            assert_eq!(out, vec![frame.clone()], "garbage {}", garbage_len);
            assert!(parse_header(&out[0]).is_ok());
        }
    }

    #[test]
    fn test_garbage_then_frame_byte_by_byte() {
        let frame = sample_frames().remove(2);
        let mut stream = vec![0xFFu8; 250];
        stream.extend_from_slice(&frame);
        let out = feed_in_chunks(&stream, 1);
        assert_eq!(out, vec![frame]);
    }

    #[test]
    fn test_partial_frame_waits() {
        let frame = sample_frames().remove(0);
        let mut assembler = FrameAssembler::new();
        assembler.push(&frame[..frame.len() - 1]);
        assert!(assembler.next_frame().is_none());
        assert_eq!(assembler.buffered(), frame.len() - 1);
        assembler.push(&frame[frame.len() - 1..]);
        assert_eq!(assembler.next_frame(), Some(frame));
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_implausible_lengths_are_skipped() {
        let frame = sample_frames().remove(0);
        // Start marker preceded by a length below the floor
        let mut stream = vec![5, 0, STX, b'x', b'x'];
        // Start marker preceded by a length above the ceiling
        stream.extend_from_slice(&[0xFF, 0xFF, STX]);
        stream.extend_from_slice(&frame);
        let out = feed_in_chunks(&stream, stream.len());
        assert_eq!(out, vec![frame]);
    }

    #[test]
    fn test_garbage_before_frames_whose_length_contains_start_marker() {
        // Totals of 512..=767 bytes put a start marker in the length prefix
        for payload_len in [477, 563] {
            let frame =
                build_message(&vec![b'Z'; payload_len], request::SNAPSHOT, Routing::new(1, 2))
                    .unwrap();
            assert_eq!(frame[1], STX);
            for garbage in [&b"xx"[..], &b"x"[..], &b"\x10\x27"[..], &b"noise"[..]] {
                let mut stream = garbage.to_vec();
                stream.extend_from_slice(&frame);

                let out = feed_in_chunks(&stream, stream.len());
                assert_eq!(out, vec![frame.clone()], "payload {} garbage {:?}", payload_len, garbage);
                let out = feed_in_chunks(&stream, 1);
                assert_eq!(out, vec![frame.clone()], "payload {} byte by byte", payload_len);
            }
        }
    }

    #[test]
    fn test_candidate_with_inconsistent_header_is_skipped() {
        let frame = sample_frames().remove(0);
        // Plausible length and start marker, but content length disagrees
        let mut stream = vec![40, 0, STX, PROTOCOL_VERSION];
        stream.extend_from_slice(b"00009");
        stream.extend_from_slice(&frame);
        let mut assembler = FrameAssembler::new();
        assembler.push(&stream);
        assert_eq!(assembler.next_frame(), Some(frame));
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_false_candidate_without_end_marker() {
        let frame = sample_frames().remove(0);
        // Plausible length and start marker, but no end marker where it should be
        let mut stream = vec![40, 0, STX];
        stream.extend_from_slice(&[b'q'; 37]);
        stream.extend_from_slice(&frame);
        let out = feed_in_chunks(&stream, stream.len());
        assert_eq!(out, vec![frame]);
    }
}
