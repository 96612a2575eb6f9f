//! # trickle-protocol
//!
//! Wire protocol definitions for the Trickle streaming server.
//!
//! This crate defines the text framing shared by every transport, the
//! preamble that opens a stream, and the form-encoded control messages
//! clients send back to the server.
//!
//! ## Frames
//!
//! - `<id>;<padding>;` - stream-open preamble, written once
//! - `<length>;<payload>;` - one pushed message, `<length>` in UTF-16 code units
//!
//! ## Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use trickle_protocol::codec;
//!
//! let encoded = codec::encode("hello");
//! assert_eq!(&encoded[..], b"5;hello;");
//!
//! let mut buf = BytesMut::from(&encoded[..]);
//! let decoded = codec::decode_from(&mut buf).unwrap();
//! assert_eq!(decoded.as_deref(), Some("hello"));
//! ```

pub mod codec;
pub mod control;
pub mod preamble;

pub use codec::{
    char_len, decode, decode_from, encode, encode_into, Decoded, FrameCodec, ProtocolError,
};
pub use control::{ControlKind, ControlMessage};
pub use preamble::{decode_preamble, encode_preamble, DEFAULT_PADDING};
