//! Content types and typed message headers for the edge protocol.
//!
//! Every message carries an enumerated content type and a small set of
//! integer-keyed headers. Well-known keys get typed accessors; keys this
//! build does not recognize are preserved as raw bytes so newer routers can
//! attach headers without breaking older clients.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Wire protocol version
pub const WIRE_VERSION: u32 = 1;

/// Message content types as defined in the edge protocol
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    /// Channel hello, first message after the physical connect
    Hello = 1,
    /// Bind a listening endpoint for a service
    Bind = 2,
    /// Release a bound listening endpoint
    Unbind = 3,
    /// Inbound request to open a new logical connection
    Dial = 4,
    /// Listener's acceptance of a dial
    DialSuccess = 5,
    /// Listener's rejection of a dial (backlog full)
    DialFailed = 6,
    /// Remote confirms a connection or bind is established
    StateConnected = 7,
    /// Remote closed or rejected a connection or bind
    StateClosed = 8,
    /// Data-plane payload on an established connection
    Data = 9,
}

impl TryFrom<u32> for ContentType {
    type Error = crate::WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ContentType::Hello),
            2 => Ok(ContentType::Bind),
            3 => Ok(ContentType::Unbind),
            4 => Ok(ContentType::Dial),
            5 => Ok(ContentType::DialSuccess),
            6 => Ok(ContentType::DialFailed),
            7 => Ok(ContentType::StateConnected),
            8 => Ok(ContentType::StateClosed),
            9 => Ok(ContentType::Data),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

/// Well-known header keys
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderId {
    /// Logical connection id the message is addressed to
    ConnectionId = 1000,
    /// Data-plane sequence counter (0 on control messages)
    SequenceNumber = 1001,
    /// Ephemeral key-exchange public key
    PublicKey = 1002,
    /// Envelope sequence number this message replies to
    ReplyForSequence = 1003,
}

impl From<HeaderId> for u32 {
    fn from(id: HeaderId) -> u32 {
        id as u32
    }
}

/// One raw header entry (key plus value bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderEntry {
    /// Numeric header key
    pub key: u32,
    /// Raw value bytes
    pub value: Bytes,
}

/// Header collection with map semantics over a small inline vector.
///
/// Messages rarely carry more than four headers, so entries live inline and
/// lookups are linear. Inserting an existing key replaces its value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Headers {
    entries: SmallVec<[HeaderEntry; 4]>,
}

impl Headers {
    /// Create an empty header collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of headers present
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no headers are present
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert raw value bytes under a numeric key, replacing any existing value
    pub fn insert_raw(&mut self, key: u32, value: Bytes) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) {
            entry.value = value;
            return;
        }
        self.entries.push(HeaderEntry { key, value });
    }

    /// Insert a little-endian u32 value under a well-known key
    pub fn insert_u32(&mut self, key: HeaderId, value: u32) {
        self.insert_raw(key.into(), Bytes::copy_from_slice(&value.to_le_bytes()));
    }

    /// Insert raw bytes under a well-known key
    pub fn insert_bytes(&mut self, key: HeaderId, value: Bytes) {
        self.insert_raw(key.into(), value);
    }

    /// Raw value bytes for a numeric key
    pub fn get_raw(&self, key: u32) -> Option<&Bytes> {
        self.entries.iter().find(|e| e.key == key).map(|e| &e.value)
    }

    /// Value bytes for a well-known key
    pub fn get_bytes(&self, key: HeaderId) -> Option<&Bytes> {
        self.get_raw(key.into())
    }

    /// Decode a u32 value for a well-known key; None if absent or mis-sized
    pub fn get_u32(&self, key: HeaderId) -> Option<u32> {
        let value = self.get_raw(key.into())?;
        let bytes: [u8; 4] = value.as_ref().try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    /// True when the key is present
    pub fn contains(&self, key: HeaderId) -> bool {
        self.get_raw(key.into()).is_some()
    }

    /// Iterate over raw entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &HeaderEntry> {
        self.entries.iter()
    }

    /// Total encoded size in bytes
    pub fn encoded_size(&self) -> usize {
        self.entries.iter().map(|e| 8 + e.value.len()).sum()
    }

    /// Encode all headers (little-endian key/length pairs plus value bytes)
    pub fn encode(&self, buf: &mut BytesMut) {
        for entry in &self.entries {
            buf.put_u32_le(entry.key);
            buf.put_u32_le(entry.value.len() as u32);
            buf.put_slice(&entry.value);
        }
    }

    /// Decode a header section of exactly `buf` bytes
    pub fn decode(mut buf: Bytes) -> Result<Self, crate::WireError> {
        let mut headers = Headers::new();
        while !buf.is_empty() {
            if buf.len() < 8 {
                return Err(crate::WireError::Malformed);
            }
            let key = buf.get_u32_le();
            let len = buf.get_u32_le() as usize;
            if buf.len() < len {
                return Err(crate::WireError::Malformed);
            }
            headers.insert_raw(key, buf.split_to(len));
        }
        Ok(headers)
    }
}
