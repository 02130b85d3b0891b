//! Binary framing and transport for procbridge.
//!
//! This crate defines the procbridge wire protocol used between a client and
//! a server over a duplex byte stream (normally TCP).
//!
//! # Frame Layout
//!
//! Every message is a single frame, all integers little-endian:
//!
//! ```text
//! +-----------+-------------+--------+------------+--------------+-----------+
//! | magic (2) | version (2) | status | reserved 2 | length (4 LE)| JSON      |
//! |   "pb"    |    1, 0     |  (1)   |    0, 0    |              | payload   |
//! +-----------+-------------+--------+------------+--------------+-----------+
//! ```
//!
//! The payload of a [`StatusCode::Request`] frame is a [`RequestPayload`];
//! responses carry a [`ResponsePayload`]. A good response with
//! `respTo == -1` is a push frame sent by a handler while a request is still
//! being processed.
//!
//! # Example
//!
//! ```rust
//! use procbridge_protocol::{decode_frame, encode_frame, Frame, RequestPayload};
//!
//! let frame = Frame::request(&RequestPayload::new("echo", 1));
//! let bytes = encode_frame(&frame).unwrap();
//! let decoded = decode_frame(&bytes).unwrap();
//! assert_eq!(decoded, frame);
//! ```

mod error;
mod framing;
mod transport;
mod types;

pub use error::{ProtocolError, ProtocolResult};
pub use framing::{FrameReader, FrameWriter, decode_frame, encode_frame};
pub use transport::{Connection, ConnectionHandle};
pub use types::{Frame, RequestPayload, ResponsePayload, StatusCode, into_body};

/// Two-byte tag that opens every frame.
pub const MAGIC: [u8; 2] = *b"pb";

/// Protocol version as `[major, minor]`.
pub const VERSION: [u8; 2] = [1, 0];

/// Size of the fixed frame header preceding the payload.
pub const HEADER_SIZE: usize = 11;

/// Maximum payload size (16 MB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Reserved api name asking the server to close the connection.
///
/// No response is sent for a request carrying this api.
pub const API_CLOSE: &str = "__PB_CLOSE__";

/// Correlation id carried by push frames.
pub const PUSH_RESP_TO: i64 = -1;
