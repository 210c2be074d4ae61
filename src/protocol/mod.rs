//! GL wire protocol
//!
//! Both sessions share one envelope:
//! `[2 bytes total length, LE][32 byte header][payload][3 byte footer]`.
//! Payloads are sequences of length-prefixed ASCII fields.

pub mod assembler;
pub mod field;
pub mod frame;

pub use assembler::FrameAssembler;
pub use field::{decode_field, encode_field, FieldReader, PayloadBuilder};
pub use frame::{build_message, parse_header, Frame, Header, Routing};

/// Start-of-message marker
pub const STX: u8 = 0x02;
/// End-of-message marker
pub const ETX: u8 = 0x03;
/// Protocol version / flags byte
pub const PROTOCOL_VERSION: u8 = b'0';
/// Padding byte used in headers and footers
pub const FILLER: u8 = b' ';

/// Size of the little-endian total-length prefix
pub const LENGTH_PREFIX_LEN: usize = 2;
pub const HEADER_LEN: usize = 32;
pub const FOOTER_LEN: usize = 3;
/// Smallest well-formed frame: prefix, header and footer with an empty payload
pub const MIN_FRAME_LEN: usize = LENGTH_PREFIX_LEN + HEADER_LEN + FOOTER_LEN;

/// Largest value a 5-digit header field can carry
pub const MAX_HEADER_NUMBER: u32 = 99_999;

/// Bounds applied to a declared length before the reassembler trusts it
pub const MIN_CANDIDATE_LEN: usize = HEADER_LEN + FOOTER_LEN;
pub const MAX_CANDIDATE_LEN: usize = 30_000;

/// Sent once on a fresh connection, before the login frame
pub const CLIENT_IDENTIFICATION: &[u8] = b"GLCLIENT\r\n";

/// Request numbers, shared by a request and its response
pub mod request {
    pub const LOGIN: u32 = 1100;
    pub const DICTIONARY: u32 = 5108;
    pub const SNAPSHOT: u32 = 1000;
    pub const SNAPSHOT_AND_REFRESH: u32 = 1001;
    pub const STOP_REFRESH: u32 = 1002;
    pub const REALTIME_UPDATE: u32 = 1003;
    pub const ORDER: u32 = 2000;
    pub const ORDER_BOOK_QUERY: u32 = 2008;
    pub const ORDER_REPLY_SUBSCRIBE: u32 = 2017;
    pub const ORDER_REPLY: u32 = 2019;
}
