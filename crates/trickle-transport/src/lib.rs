//! # trickle-transport
//!
//! Transport adapters for the Trickle streaming core.
//!
//! Each adapter binds one network mechanism to a connection's lifecycle:
//!
//! - **Streaming** - one long-lived HTTP response per connection
//! - **Long-poll** - one request per batch of frames
//! - **WebSocket** - frames as text messages, control messages inbound
//!
//! Adapters never touch the registry directly. They open a [`Session`]
//! through the hub, forward its frames to the wire, and drop it when the
//! transport is done.
//!
//! ```rust,ignore
//! use trickle_transport::{AdapterContext, FieldRenderer, StreamingAdapter};
//!
//! let context = AdapterContext::new(hub, Arc::new(FieldRenderer::default()));
//! let body = StreamingAdapter::new(context).open_stream().await?;
//! ```

pub mod longpoll;
pub mod session;
pub mod streaming;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use longpoll::{LongPollAdapter, DEFAULT_POLL_WAIT};
pub use session::{EndReason, Next, Session};
pub use streaming::StreamingAdapter;
pub use traits::{AdapterContext, FieldRenderer, PayloadRenderer, TransportAdapter, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketAdapter;
