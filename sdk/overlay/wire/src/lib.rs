//! Wire protocol envelope, typed headers, and streaming decode for the
//! overlay edge protocol.
//!
//! Every exchange between a client and an edge router is a sequence of
//! messages multiplexed over one physical channel. A message is an immutable
//! envelope: a content-type tag, a small integer-keyed header section, a raw
//! body, and an envelope sequence number stamped by the sending transport.
//! Request/reply pairs correlate through the `ReplyForSequence` header, which
//! echoes the request's envelope sequence number.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 version          | protocol version (1)       |
//! +----------------------+----------------------------+
//! | u32 content type     | message kind               |
//! +----------------------+----------------------------+
//! | u32 sequence         | monotonic per transport    |
//! +----------------------+----------------------------+
//! | u32 headers_len      | header section length      |
//! +----------------------+----------------------------+
//! | u32 body_len         | body length                |
//! +----------------------+----------------------------+
//! | headers              | { u32 key, u32 len, bytes }|
//! +----------------------+----------------------------+
//! | body                 | variable (0..N)            |
//! +----------------------+----------------------------+
//! ```
//!
//! All integers are little-endian.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod header;
pub mod message;

// Re-export main types
pub use codec::{body_conn_id, body_text, MessageBuilder};
pub use error::WireError;
pub use header::{ContentType, HeaderEntry, HeaderId, Headers, WIRE_VERSION};
pub use message::{
    Message, MessageDecoder, DEFAULT_MAX_MESSAGE_SIZE, MAX_HEADERS_SIZE, PREAMBLE_SIZE,
};
