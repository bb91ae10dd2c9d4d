//! Message envelope and streaming decode for the edge protocol.
//!
//! A message is a fixed little-endian preamble followed by the header section
//! and the body. Envelopes are immutable once built; the transport stamps the
//! envelope sequence number at send time via [`Message::with_sequence`].

use crate::header::{ContentType, Headers, WIRE_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Preamble size in bytes (version, content, sequence, headers len, body len)
pub const PREAMBLE_SIZE: usize = 20;

/// Maximum message size accepted by default (16 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Maximum header section size (64 KiB)
pub const MAX_HEADERS_SIZE: usize = 64 * 1024;

/// Complete wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Content type tag
    pub content: ContentType,
    /// Header collection
    pub headers: Headers,
    /// Raw body bytes
    pub body: Bytes,
    /// Envelope sequence number, monotonic per transport
    pub sequence: u32,
}

impl Message {
    /// Create a message with empty headers and body
    pub fn new(content: ContentType) -> Self {
        Self {
            content,
            headers: Headers::new(),
            body: Bytes::new(),
            sequence: 0,
        }
    }

    /// Return the same message stamped with an envelope sequence number
    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    /// Sequence number of the message this one replies to, if any
    pub fn reply_for(&self) -> Option<u32> {
        self.headers.get_u32(crate::HeaderId::ReplyForSequence)
    }

    /// Get the total message size when encoded
    pub fn encoded_size(&self) -> usize {
        PREAMBLE_SIZE + self.headers.encoded_size() + self.body.len()
    }

    /// Encode the message to a contiguous buffer
    pub fn encode(&self, max_message_size: usize) -> Result<Bytes, crate::WireError> {
        let total_size = self.encoded_size();
        if total_size > max_message_size {
            return Err(crate::WireError::Size(total_size));
        }

        let mut buf = BytesMut::with_capacity(total_size);

        buf.put_u32_le(WIRE_VERSION);
        buf.put_u32_le(self.content as u32);
        buf.put_u32_le(self.sequence);
        buf.put_u32_le(self.headers.encoded_size() as u32);
        buf.put_u32_le(self.body.len() as u32);

        self.headers.encode(&mut buf);
        buf.put_slice(&self.body);

        Ok(buf.freeze())
    }
}

/// Streaming decoder for parsing incoming messages
#[derive(Debug)]
pub struct MessageDecoder {
    max_message_size: usize,
}

impl MessageDecoder {
    /// Create a decoder with the default size limit
    pub fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Create a decoder with an explicit size limit
    pub fn with_max_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    /// Decode one message from a buffer.
    ///
    /// Returns `Ok(None)` until a complete message is buffered. Decoded bytes
    /// are consumed from `buf`; on error the stream is unrecoverable and the
    /// caller should drop the connection.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, crate::WireError> {
        if buf.len() < PREAMBLE_SIZE {
            return Ok(None);
        }

        let version = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if version != WIRE_VERSION {
            return Err(crate::WireError::Version(version));
        }

        let content_raw = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let sequence = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let headers_len = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]) as usize;
        let body_len = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]) as usize;

        if headers_len > MAX_HEADERS_SIZE {
            return Err(crate::WireError::Size(headers_len));
        }

        let total_size = PREAMBLE_SIZE + headers_len + body_len;
        if total_size > self.max_message_size {
            return Err(crate::WireError::Size(total_size));
        }

        // Wait for the complete message
        if buf.len() < total_size {
            return Ok(None);
        }

        let content = ContentType::try_from(content_raw)?;

        buf.advance(PREAMBLE_SIZE);
        let headers = Headers::decode(buf.split_to(headers_len).freeze())?;
        let body = buf.split_to(body_len).freeze();

        Ok(Some(Message {
            content,
            headers,
            body,
            sequence,
        }))
    }
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HeaderId;

    fn sample_message() -> Message {
        let mut msg = Message::new(ContentType::Dial);
        msg.headers.insert_u32(HeaderId::ConnectionId, 3);
        msg.headers.insert_bytes(HeaderId::PublicKey, Bytes::from_static(&[9; 32]));
        msg.body = Bytes::from_static(b"payload");
        msg.with_sequence(17)
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = sample_message();
        let encoded = msg.encode(DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        assert_eq!(encoded.len(), msg.encoded_size());

        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = MessageDecoder::new().decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_incomplete_returns_none() {
        let msg = sample_message();
        let encoded = msg.encode(DEFAULT_MAX_MESSAGE_SIZE).unwrap();

        let mut decoder = MessageDecoder::new();
        let mut buf = BytesMut::new();
        for chunk in encoded.chunks(5) {
            if buf.len() + chunk.len() < encoded.len() {
                buf.extend_from_slice(chunk);
                assert!(decoder.decode(&mut buf).unwrap().is_none());
            } else {
                buf.extend_from_slice(chunk);
            }
        }
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), msg);
    }

    #[test]
    fn test_decode_two_messages_from_one_buffer() {
        let first = sample_message();
        let second = Message::new(ContentType::StateClosed).with_sequence(18);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first.encode(DEFAULT_MAX_MESSAGE_SIZE).unwrap());
        buf.extend_from_slice(&second.encode(DEFAULT_MAX_MESSAGE_SIZE).unwrap());

        let mut decoder = MessageDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), second);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_bad_version() {
        let msg = sample_message();
        let encoded = msg.encode(DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let mut bytes = encoded.to_vec();
        bytes[0] = 99;

        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            MessageDecoder::new().decode(&mut buf),
            Err(crate::WireError::Version(99))
        ));
    }

    #[test]
    fn test_decode_unknown_content_type() {
        let msg = sample_message();
        let encoded = msg.encode(DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let mut bytes = encoded.to_vec();
        bytes[4] = 0xAA;
        bytes[5] = 0;

        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            MessageDecoder::new().decode(&mut buf),
            Err(crate::WireError::Type(0xAA))
        ));
    }

    #[test]
    fn test_decode_oversize_message() {
        let msg = sample_message();
        let encoded = msg.encode(DEFAULT_MAX_MESSAGE_SIZE).unwrap();

        let mut buf = BytesMut::from(&encoded[..]);
        let mut decoder = MessageDecoder::with_max_size(8);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(crate::WireError::Size(_))
        ));
    }

    #[test]
    fn test_encode_respects_size_limit() {
        let msg = sample_message();
        assert!(matches!(msg.encode(4), Err(crate::WireError::Size(_))));
    }
}
