//! Connections and their lifecycle.
//!
//! A [`Connection`] is the server-side handle for one client's logical
//! stream, independent of the transport carrying it. It owns the sink frames
//! are pushed into and a small state machine:
//!
//! ```text
//! Open ──close request──▶ Closing ──transport done──▶ Closed
//!   └──────────────transport done / failed write──────────┘
//! ```
//!
//! `Closed` is terminal and is entered exactly once, when the registry
//! removes the connection.

use bytes::Bytes;
use std::borrow::Borrow;
use std::fmt;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a random connection ID (128-bit, v4 UUID).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ConnectionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Registered and eligible for broadcasts.
    Open,
    /// Close requested; the transport is being torn down.
    Closing,
    /// Removed from the registry. Terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Delivery failures. Both mean the connection should be treated as gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The underlying transport has gone away.
    #[error("transport gone")]
    Gone,

    /// The connection is no longer open.
    #[error("connection not open")]
    Closed,
}

/// Accepts framed payloads for delivery to one client.
///
/// Implementations must not block: the dispatcher calls `send` for every
/// connection in turn.
pub trait FrameSink: Send + Sync {
    /// Queue one complete frame.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Gone`] if the transport can no longer accept data.
    fn send(&self, frame: Bytes) -> Result<(), SinkError>;
}

/// A [`FrameSink`] backed by an unbounded channel.
///
/// The transport adapter owns the receiving half and writes whatever arrives
/// to the wire. Dropping the receiver makes every later send fail with
/// [`SinkError::Gone`].
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl FrameSink for ChannelSink {
    fn send(&self, frame: Bytes) -> Result<(), SinkError> {
        self.tx.send(frame).map_err(|_| SinkError::Gone)
    }
}

/// Create a channel-backed sink and the receiver the transport drains.
#[must_use]
pub fn channel_sink() -> (ChannelSink, mpsc::UnboundedReceiver<Bytes>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSink { tx }, rx)
}

/// One client's logical stream.
pub struct Connection {
    id: ConnectionId,
    state: watch::Sender<ConnectionState>,
    sink: Box<dyn FrameSink>,
    opened_at: Instant,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, sink: Box<dyn FrameSink>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Open);
        Self {
            id,
            state,
            sink,
            opened_at: Instant::now(),
        }
    }

    /// Get the connection's unique identifier.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Get the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Check if the connection is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// When the connection was registered.
    #[must_use]
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Watch this connection's lifecycle.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle {
            rx: self.state.subscribe(),
        }
    }

    /// Request an explicit close (`Open -> Closing`).
    ///
    /// Returns `true` if this call made the transition.
    pub fn request_close(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Open {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        })
    }

    /// Enter the terminal state. Only the registry calls this, on removal.
    pub(crate) fn mark_closed(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        })
    }

    /// Push a frame to the client.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Closed`] unless the connection is open, or the
    /// sink's error if the transport is gone.
    pub fn deliver(&self, frame: Bytes) -> Result<(), SinkError> {
        if !self.is_open() {
            return Err(SinkError::Closed);
        }
        self.sink.send(frame)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Read-only view of a connection's state, held by its transport adapter.
///
/// Outlives the connection: once the registry drops it, the lifecycle
/// reports [`ConnectionState::Closed`].
#[derive(Debug, Clone)]
pub struct Lifecycle {
    rx: watch::Receiver<ConnectionState>,
}

impl Lifecycle {
    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        if self.rx.has_changed().is_err() {
            return ConnectionState::Closed;
        }
        *self.rx.borrow()
    }

    /// Check if the connection is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Wait until the connection leaves `Open`, returning the new state.
    pub async fn wait_until_not_open(&mut self) -> ConnectionState {
        match self
            .rx
            .wait_for(|state| *state != ConnectionState::Open)
            .await
        {
            Ok(state) => *state,
            Err(_) => ConnectionState::Closed,
        }
    }
}

/// Result of registering a connection.
#[derive(Debug)]
pub struct Registration {
    /// The freshly generated id.
    pub id: ConnectionId,
    /// Lifecycle watcher for the transport adapter.
    pub lifecycle: Lifecycle,
}
