//! Broadcast message type.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use trickle_protocol::codec;

/// An immutable payload queued for broadcast.
///
/// The frame is encoded once at construction and shared (zero-copy) with
/// every connection it is delivered to.
#[derive(Clone)]
pub struct Message {
    /// Payload text.
    payload: Arc<str>,
    /// Payload length in UTF-16 code units.
    char_len: usize,
    /// Encoded `<length>;<payload>;` frame.
    frame: Bytes,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(payload: impl Into<Arc<str>>) -> Self {
        let payload = payload.into();
        Self {
            char_len: codec::char_len(&payload),
            frame: codec::encode(&payload),
            payload,
        }
    }

    /// Get the payload text.
    #[must_use]
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Get the payload length in UTF-16 code units.
    #[must_use]
    pub fn char_len(&self) -> usize {
        self.char_len
    }

    /// Get the encoded frame.
    #[must_use]
    pub fn frame(&self) -> &Bytes {
        &self.frame
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("payload", &self.payload)
            .field("char_len", &self.char_len)
            .finish()
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::new("hello");
        assert_eq!(msg.payload(), "hello");
        assert_eq!(msg.char_len(), 5);
        assert_eq!(&msg.frame()[..], b"5;hello;");
    }

    #[test]
    fn test_message_frame_counts_characters() {
        let msg = Message::from("日本");
        assert_eq!(msg.char_len(), 2);
        assert_eq!(&msg.frame()[..], "2;日本;".as_bytes());

        let msg = Message::from("日本🎉");
        assert_eq!(msg.char_len(), 4);
        assert_eq!(&msg.frame()[..], "4;日本🎉;".as_bytes());
    }

    #[test]
    fn test_message_clone_shares_frame() {
        let msg = Message::from(String::from("shared"));
        let copy = msg.clone();
        assert_eq!(msg.frame().as_ptr(), copy.frame().as_ptr());
    }
}
