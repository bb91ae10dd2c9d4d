//! Message construction and body codecs for the edge protocol.
//!
//! This module provides the message builder plus helpers for the two body
//! encodings the protocol uses: UTF-8 text (session tokens, error reasons)
//! and 4-byte little-endian connection ids.

use crate::header::{ContentType, HeaderId, Headers};
use crate::message::Message;
use bytes::Bytes;

/// Message builder for constructing wire messages
#[derive(Debug)]
pub struct MessageBuilder {
    content: ContentType,
    headers: Headers,
    body: Bytes,
}

impl MessageBuilder {
    /// Create a new message builder
    pub fn new(content: ContentType) -> Self {
        Self {
            content,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Add a u32 header
    pub fn header_u32(mut self, key: HeaderId, value: u32) -> Self {
        self.headers.insert_u32(key, value);
        self
    }

    /// Add a raw bytes header
    pub fn header_bytes(mut self, key: HeaderId, value: impl Into<Bytes>) -> Self {
        self.headers.insert_bytes(key, value.into());
        self
    }

    /// Set the raw body
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Set a UTF-8 text body
    pub fn text_body(mut self, text: &str) -> Self {
        self.body = Bytes::copy_from_slice(text.as_bytes());
        self
    }

    /// Set a 4-byte little-endian connection id body
    pub fn conn_id_body(mut self, conn_id: u32) -> Self {
        self.body = Bytes::copy_from_slice(&conn_id.to_le_bytes());
        self
    }

    /// Build the message (sequence number 0 until stamped by the transport)
    pub fn build(self) -> Message {
        Message {
            content: self.content,
            headers: self.headers,
            body: self.body,
            sequence: 0,
        }
    }
}

/// Decode a message body as UTF-8 text
pub fn body_text(msg: &Message) -> Result<&str, crate::WireError> {
    std::str::from_utf8(&msg.body).map_err(|_| crate::WireError::Utf8)
}

/// Decode a message body as a 4-byte little-endian connection id
pub fn body_conn_id(msg: &Message) -> Result<u32, crate::WireError> {
    let bytes: [u8; 4] = msg
        .body
        .as_ref()
        .try_into()
        .map_err(|_| crate::WireError::Malformed)?;
    Ok(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_assembles_all_parts() {
        let msg = MessageBuilder::new(ContentType::Bind)
            .header_u32(HeaderId::ConnectionId, 5)
            .header_u32(HeaderId::SequenceNumber, 0)
            .header_bytes(HeaderId::PublicKey, Bytes::from_static(&[7; 32]))
            .text_body("token-abc")
            .build();

        assert_eq!(msg.content, ContentType::Bind);
        assert_eq!(msg.sequence, 0);
        assert_eq!(msg.headers.get_u32(HeaderId::ConnectionId), Some(5));
        assert_eq!(body_text(&msg).unwrap(), "token-abc");
    }

    #[test]
    fn test_conn_id_body_roundtrip() {
        let msg = MessageBuilder::new(ContentType::DialSuccess)
            .conn_id_body(0x0102_0304)
            .build();

        assert_eq!(msg.body.as_ref(), &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(body_conn_id(&msg).unwrap(), 0x0102_0304);
    }

    #[test]
    fn test_body_decode_errors() {
        let text = MessageBuilder::new(ContentType::StateClosed)
            .body(Bytes::from_static(&[0xFF, 0xFE]))
            .build();
        assert!(body_text(&text).is_err());

        let short = MessageBuilder::new(ContentType::DialSuccess)
            .body(Bytes::from_static(&[1, 2]))
            .build();
        assert!(body_conn_id(&short).is_err());
    }
}
