//! Codec for encoding and decoding Trickle frames.
//!
//! A frame is `<length>;<payload>;` where `<length>` is the number of
//! UTF-16 code units in `<payload>` (the `length` a browser client sees),
//! rendered in base-10 ASCII without leading zeros. The payload is written verbatim and may
//! itself contain `;`: the length prefix makes the frame self-delimiting.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Field separator and frame terminator.
pub const DELIMITER: u8 = b';';

/// Longest accepted length prefix, in digits (`usize::MAX` has 20).
const MAX_LENGTH_DIGITS: usize = 20;

/// Protocol errors that can occur while decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not enough data to decode a frame.
    #[error("Incomplete frame")]
    Incomplete,

    /// The length prefix is empty, not decimal, has leading zeros or overflows.
    #[error("Invalid length prefix: {0:?}")]
    InvalidLength(String),

    /// The byte after the payload is not the terminating `;`, or the
    /// length ends inside a surrogate pair.
    #[error("Missing frame terminator after {0} characters")]
    MissingTerminator(usize),

    /// The payload is not valid UTF-8.
    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,

    /// A control message could not be parsed.
    #[error("Malformed form data: {0}")]
    Form(String),
}

/// A single decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// The frame payload.
    pub payload: String,
    /// Number of input bytes the frame occupied.
    pub consumed: usize,
}

/// Count the characters of a payload as the length prefix does: one per
/// UTF-16 code unit, so a character outside the Basic Multilingual Plane
/// counts twice.
#[must_use]
pub fn char_len(payload: &str) -> usize {
    payload.encode_utf16().count()
}

/// Encode a payload into a frame.
///
/// Never fails; there is no length limit at this layer.
#[must_use]
pub fn encode(payload: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + MAX_LENGTH_DIGITS + 2);
    encode_into(payload, &mut buf);
    buf.freeze()
}

/// Encode a payload into an existing buffer.
pub fn encode_into(payload: &str, buf: &mut BytesMut) {
    let length = char_len(payload).to_string();

    buf.reserve(length.len() + payload.len() + 2);
    buf.put_slice(length.as_bytes());
    buf.put_u8(DELIMITER);
    buf.put_slice(payload.as_bytes());
    buf.put_u8(DELIMITER);
}

/// Decode the first frame in `data`.
///
/// # Errors
///
/// Returns [`ProtocolError::Incomplete`] if `data` ends before the frame
/// does, or another variant if the frame is malformed.
pub fn decode(data: &[u8]) -> Result<Decoded, ProtocolError> {
    let (chars, prefix_len) = parse_length(data)?;
    let body = &data[prefix_len..];

    let end = payload_end(body, chars)?;
    if body[end] != DELIMITER {
        return Err(ProtocolError::MissingTerminator(chars));
    }

    let payload = std::str::from_utf8(&body[..end])
        .map_err(|_| ProtocolError::InvalidUtf8)?
        .to_owned();

    Ok(Decoded {
        payload,
        consumed: prefix_len + end + 1,
    })
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(payload))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the buffered frame is malformed.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
    match decode(&buf[..]) {
        Ok(decoded) => {
            buf.advance(decoded.consumed);
            Ok(Some(decoded.payload))
        }
        Err(ProtocolError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Parse `<digits>;`, returning the declared character count and the number
/// of bytes the prefix occupies (including the delimiter).
fn parse_length(data: &[u8]) -> Result<(usize, usize), ProtocolError> {
    let digits_end = data
        .iter()
        .take(MAX_LENGTH_DIGITS + 1)
        .position(|&b| b == DELIMITER);

    let digits = match digits_end {
        Some(end) => &data[..end],
        None => {
            let seen = &data[..data.len().min(MAX_LENGTH_DIGITS + 1)];
            if seen.len() > MAX_LENGTH_DIGITS || !seen.iter().all(u8::is_ascii_digit) {
                return Err(invalid_length(seen));
            }
            return Err(ProtocolError::Incomplete);
        }
    };

    let well_formed = !digits.is_empty()
        && digits.iter().all(u8::is_ascii_digit)
        && (digits.len() == 1 || digits[0] != b'0');
    if !well_formed {
        return Err(invalid_length(digits));
    }

    let chars = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| invalid_length(digits))?;

    Ok((chars, digits.len() + 1))
}

/// Byte offset just past the first `chars` UTF-16 code units of `body`.
///
/// Fails with [`ProtocolError::Incomplete`] until the byte following those
/// characters is available, so a frame split inside a multi-byte character
/// reads as incomplete.
fn payload_end(body: &[u8], chars: usize) -> Result<usize, ProtocolError> {
    let mut offset = 0;
    let mut seen = 0;

    while seen < chars {
        let Some(&lead) = body.get(offset) else {
            return Err(ProtocolError::Incomplete);
        };
        // (bytes, code units) of the character starting at `lead`.
        let (width, units) = match lead {
            0x00..=0x7F => (1, 1),
            0xC0..=0xDF => (2, 1),
            0xE0..=0xEF => (3, 1),
            0xF0..=0xF7 => (4, 2),
            _ => return Err(ProtocolError::InvalidUtf8),
        };
        offset += width;
        seen += units;
    }

    if seen > chars {
        return Err(ProtocolError::MissingTerminator(chars));
    }
    if offset >= body.len() {
        return Err(ProtocolError::Incomplete);
    }
    Ok(offset)
}

fn invalid_length(digits: &[u8]) -> ProtocolError {
    ProtocolError::InvalidLength(String::from_utf8_lossy(digits).into_owned())
}

/// Codec for streaming frame encoding/decoding.
#[derive(Debug, Default)]
pub struct FrameCodec {
    // Stateless: the buffer is owned by the caller.
}

impl FrameCodec {
    /// Create a new codec instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a payload into a frame.
    #[must_use]
    pub fn encode(&self, payload: &str) -> Bytes {
        encode(payload)
    }

    /// Decode one frame from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails.
    pub fn decode(&self, data: &[u8]) -> Result<Decoded, ProtocolError> {
        decode(data)
    }

    /// Try to decode a frame from a buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is invalid.
    pub fn decode_from(&self, buf: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
        decode_from(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_hello() {
        assert_eq!(&encode("hello")[..], b"5;hello;");
    }

    #[test]
    fn test_encode_empty_payload() {
        assert_eq!(&encode("")[..], b"0;;");
        let decoded = decode(b"0;;").unwrap();
        assert_eq!(decoded.payload, "");
        assert_eq!(decoded.consumed, 3);
    }

    #[test]
    fn test_payload_with_delimiters() {
        let payload = "a;b;;c;";
        let encoded = encode(payload);
        assert_eq!(&encoded[..], b"7;a;b;;c;;");

        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.consumed, encoded.len());
    }

    #[test]
    fn test_length_counts_characters() {
        let payload = "héllo, 世界 🎉";
        let encoded = encode(payload);
        let prefix = format!("{};", char_len(payload));
        assert!(encoded.starts_with(prefix.as_bytes()));
        assert_eq!(char_len(payload), 12);
        assert_ne!(char_len(payload), payload.len());

        assert_eq!(decode(&encoded).unwrap().payload, payload);
    }

    #[test]
    fn test_astral_characters_count_twice() {
        assert_eq!(&encode("🎉")[..], "2;🎉;".as_bytes());
        assert_eq!(&encode("a🎉b")[..], "4;a🎉b;".as_bytes());
        assert_eq!(decode("2;🎉;".as_bytes()).unwrap().payload, "🎉");

        // A length that ends inside the surrogate pair can never terminate.
        assert_eq!(
            decode("1;🎉;".as_bytes()),
            Err(ProtocolError::MissingTerminator(1))
        );
    }

    #[test]
    fn test_roundtrip_json_payload() {
        let payload = r#"{"username":"x","message":"hi"}"#;
        let encoded = encode(payload);
        let decoded = decode(&encoded).unwrap();

        assert_eq!(decoded.payload, payload);
        assert!(encoded.starts_with(format!("{};", payload.len()).as_bytes()));
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode("hello");

        for cut in 0..encoded.len() {
            match decode(&encoded[..cut]) {
                Err(ProtocolError::Incomplete) => {}
                other => panic!("Expected Incomplete at {cut}, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_decode_split_multibyte_is_incomplete() {
        let encoded = encode("世");
        // "1;" then three bytes of 世 then ";"
        assert_eq!(decode(&encoded[..3]), Err(ProtocolError::Incomplete));
        assert_eq!(decode(&encoded[..5]), Err(ProtocolError::Incomplete));
        assert_eq!(decode(&encoded).unwrap().payload, "世");
    }

    #[test]
    fn test_decode_invalid_length() {
        assert!(matches!(decode(b";x;"), Err(ProtocolError::InvalidLength(_))));
        assert!(matches!(decode(b"05;hello;"), Err(ProtocolError::InvalidLength(_))));
        assert!(matches!(decode(b"x5;hello;"), Err(ProtocolError::InvalidLength(_))));
        assert!(matches!(decode(b"12ab"), Err(ProtocolError::InvalidLength(_))));
        assert!(matches!(
            decode(b"999999999999999999999999;"),
            Err(ProtocolError::InvalidLength(_))
        ));
    }

    #[test]
    fn test_decode_missing_terminator() {
        assert_eq!(
            decode(b"3;hello;"),
            Err(ProtocolError::MissingTerminator(3))
        );
    }

    #[test]
    fn test_decode_invalid_utf8() {
        assert_eq!(decode(b"1;\xff;"), Err(ProtocolError::InvalidUtf8));
        assert_eq!(decode(b"1;\x80\x80;"), Err(ProtocolError::InvalidUtf8));

        let mut buf = BytesMut::from(&b"2;\x80"[..]);
        assert_eq!(decode_from(&mut buf), Err(ProtocolError::InvalidUtf8));
    }

    #[test]
    fn test_streaming_decode() {
        let mut buf = BytesMut::new();
        encode_into("first", &mut buf);
        encode_into("second;frame", &mut buf);
        encode_into("", &mut buf);

        assert_eq!(decode_from(&mut buf).unwrap().as_deref(), Some("first"));
        assert_eq!(
            decode_from(&mut buf).unwrap().as_deref(),
            Some("second;frame")
        );
        assert_eq!(decode_from(&mut buf).unwrap().as_deref(), Some(""));
        assert_eq!(decode_from(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_streaming_decode_byte_by_byte() {
        let encoded = encode("ünïcode;frame 🎉");
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();

        for byte in encoded.iter() {
            buf.put_u8(*byte);
            if let Some(payload) = decode_from(&mut buf).unwrap() {
                decoded.push(payload);
            }
        }

        assert_eq!(decoded, vec!["ünïcode;frame 🎉".to_string()]);
        assert!(buf.is_empty());
    }
}
