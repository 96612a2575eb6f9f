//! Stream-open preamble.
//!
//! The first bytes written on every new stream are `<connection-id>;<padding>;`.
//! The padding is a run of spaces whose length carries no meaning; it exists
//! to push older browsers past their buffering thresholds.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{ProtocolError, DELIMITER};

/// Default padding length, in spaces.
pub const DEFAULT_PADDING: usize = 1024;

/// Encode the preamble for a freshly opened stream.
#[must_use]
pub fn encode_preamble(connection_id: &str, padding: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(connection_id.len() + padding + 2);
    buf.put_slice(connection_id.as_bytes());
    buf.put_u8(DELIMITER);
    buf.put_bytes(b' ', padding);
    buf.put_u8(DELIMITER);
    buf.freeze()
}

/// Try to read the preamble from the start of a buffer.
///
/// Returns the connection id and advances the buffer past the padding, or
/// `Ok(None)` if the preamble has not fully arrived.
///
/// # Errors
///
/// Returns an error if the id is not UTF-8 or the padding is not whitespace.
pub fn decode_preamble(buf: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
    let Some(id_end) = buf.iter().position(|&b| b == DELIMITER) else {
        return Ok(None);
    };
    let Some(pad_len) = buf[id_end + 1..].iter().position(|&b| b == DELIMITER) else {
        return Ok(None);
    };

    let padding = &buf[id_end + 1..id_end + 1 + pad_len];
    if !padding.iter().all(u8::is_ascii_whitespace) {
        return Err(ProtocolError::Form("preamble padding is not whitespace".into()));
    }

    let id = std::str::from_utf8(&buf[..id_end])
        .map_err(|_| ProtocolError::InvalidUtf8)?
        .to_owned();

    buf.advance(id_end + pad_len + 2);
    Ok(Some(id))
}
