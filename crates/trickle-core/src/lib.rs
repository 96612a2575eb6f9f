//! # trickle-core
//!
//! The streaming core of Trickle: everything between "a client opened a
//! stream" and "a frame was queued to that client".
//!
//! - **Connection** - one client's logical stream and its lifecycle
//! - **Registry** - concurrent map of live connections
//! - **Dispatcher** - queue and worker fanning broadcasts out to the registry
//! - **Hub** - the owned instance tying them together
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ register ┌─────────────┐ snapshot ┌─────────────┐
//! │  Transport  │─────────▶│  Registry   │◀─────────│ Dispatcher  │
//! └─────────────┘          └─────────────┘          └─────────────┘
//!        ▲                        │                        ▲
//!        │ frames                 ▼                        │ publish
//!        └──────────────── FrameSink per            ┌─────────────┐
//!                           connection              │     Hub     │
//!                                                   └─────────────┘
//! ```

pub mod connection;
pub mod dispatcher;
pub mod hub;
pub mod message;
pub mod registry;

pub use connection::{
    channel_sink, ChannelSink, Connection, ConnectionId, ConnectionState, FrameSink, Lifecycle,
    Registration, SinkError,
};
pub use dispatcher::{deliver, DeliveryReport, DispatchError, Dispatcher};
pub use hub::{ControlOutcome, Hub, HubConfig, HubError, DEFAULT_CONNECTION_TIMEOUT};
pub use message::Message;
pub use registry::{Registry, RegistryError, RegistryStats};
