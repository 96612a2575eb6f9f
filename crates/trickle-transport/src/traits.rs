//! Transport abstraction traits for Trickle.
//!
//! Every transport binds its network mechanism to the core through the same
//! three events: a client connects, a control message arrives, the
//! transport is done with a connection.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use trickle_core::{ControlOutcome, Hub, HubError};
use trickle_protocol::{ControlMessage, ProtocolError};

use crate::session::Session;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The hub refused the connection.
    #[error("Connection refused: {0}")]
    Refused(#[from] HubError),

    /// No session exists for the given id.
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl TransportError {
    /// Whether the hub refused because it is shutting down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, TransportError::Refused(e) if e.is_shutdown())
    }
}

/// Turns the payload fields of a control message into broadcast text.
pub trait PayloadRenderer: Send + Sync {
    /// Render the payload, or `None` if required fields are missing.
    fn render(&self, message: &ControlMessage) -> Option<String>;
}

/// Broadcasts one field verbatim.
#[derive(Debug, Clone)]
pub struct FieldRenderer {
    field: String,
}

impl FieldRenderer {
    /// Render the named field.
    #[must_use]
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl Default for FieldRenderer {
    fn default() -> Self {
        Self::new("message")
    }
}

impl PayloadRenderer for FieldRenderer {
    fn render(&self, message: &ControlMessage) -> Option<String> {
        message.field(&self.field).map(str::to_owned)
    }
}

/// Binds one network mechanism to a connection's lifecycle.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// What `on_connect` hands back to the transport.
    type Opened: Send;

    /// Get the transport name (e.g., "streaming", "websocket").
    fn name(&self) -> &'static str;

    /// A client established a stream.
    async fn on_connect(&self) -> Result<Self::Opened, TransportError>;

    /// A control message arrived for this transport.
    async fn on_inbound_control(&self, message: ControlMessage) -> ControlOutcome;

    /// The transport is done with a connection (completed, timed out or
    /// failed). Returns `true` if the connection was still registered.
    fn on_transport_closed(&self, id: &str) -> bool;
}

/// State shared by every adapter: the hub and the payload renderer.
#[derive(Clone)]
pub struct AdapterContext {
    hub: Arc<Hub>,
    renderer: Arc<dyn PayloadRenderer>,
}

impl AdapterContext {
    /// Create a context.
    #[must_use]
    pub fn new(hub: Arc<Hub>, renderer: Arc<dyn PayloadRenderer>) -> Self {
        Self { hub, renderer }
    }

    /// Get the hub.
    #[must_use]
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// The configured connection timeout.
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        self.hub.config().connection_timeout
    }

    /// Register a new connection and open its session.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub refuses the connection.
    pub fn open_session(
        &self,
        transport: &'static str,
        timeout: Option<Duration>,
    ) -> Result<Session, TransportError> {
        let session = Session::open(Arc::clone(&self.hub), timeout)?;
        debug!(connection = %session.id(), transport, "Connection opened");
        Ok(session)
    }

    /// Route a control message through the hub.
    pub async fn control(&self, message: &ControlMessage, require_id: bool) -> ControlOutcome {
        let renderer = Arc::clone(&self.renderer);
        let outcome = self
            .hub
            .handle_control(message, require_id, |m| renderer.render(m))
            .await;

        if let ControlOutcome::Rejected(reason) = &outcome {
            warn!(connection = ?message.id, %reason, "Control message rejected");
        }
        outcome
    }

    /// Report a connection done.
    pub fn closed(&self, id: &str) -> bool {
        self.hub.disconnect(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_renderer() {
        let msg = ControlMessage::from_pairs([("username", "a"), ("message", "hi")]);
        assert_eq!(FieldRenderer::default().render(&msg).as_deref(), Some("hi"));
        assert_eq!(
            FieldRenderer::new("username").render(&msg).as_deref(),
            Some("a")
        );
        assert_eq!(FieldRenderer::new("missing").render(&msg), None);
    }

    #[test]
    fn test_shutdown_error_detection() {
        let err = TransportError::from(HubError::Registry(
            trickle_core::RegistryError::ShutdownInProgress,
        ));
        assert!(err.is_shutdown());
        assert!(!TransportError::ConnectionClosed.is_shutdown());

        let err = TransportError::from(ProtocolError::Form("bad".into()));
        assert!(!err.is_shutdown());
        assert_eq!(err.to_string(), "Protocol error: Malformed form data: bad");
    }
}
