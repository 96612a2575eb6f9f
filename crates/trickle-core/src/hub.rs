//! The hub: one owned instance of the streaming core.
//!
//! A [`Hub`] owns the connection registry and the broadcast dispatcher, and
//! routes inbound control messages. Transport adapters receive it as an
//! `Arc<Hub>`; nothing in the core is global.

use crate::connection::{Connection, FrameSink, Registration};
use crate::dispatcher::{DeliveryReport, DispatchError, Dispatcher};
use crate::message::Message;
use crate::registry::{Registry, RegistryError, RegistryStats};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use trickle_protocol::{ControlKind, ControlMessage, DEFAULT_PADDING};

/// Default connection timeout (5 minutes).
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Hub errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// Registration failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Publishing failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl HubError {
    /// Whether this error means the hub is shutting down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            HubError::Registry(RegistryError::ShutdownInProgress)
                | HubError::Dispatch(DispatchError::ShutdownInProgress)
        )
    }
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How long a transport may keep a connection before timing it out.
    pub connection_timeout: Duration,
    /// Spaces written in the stream-open preamble.
    pub padding: usize,
    /// Maximum number of live connections.
    pub max_connections: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            padding: DEFAULT_PADDING,
            max_connections: 100_000,
        }
    }
}

/// What the hub did with a control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// The named connection was asked to close.
    Closed,
    /// The payload was broadcast.
    Published(DeliveryReport),
    /// Nothing to do: the id is unknown or already closing.
    Ignored,
    /// The message was malformed.
    Rejected(String),
}

/// The streaming core.
pub struct Hub {
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    config: HubConfig,
    shut_down: AtomicBool,
}

impl Hub {
    /// Create a hub with default configuration.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a hub with custom configuration.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn with_config(config: HubConfig) -> Self {
        info!(
            timeout_ms = config.connection_timeout.as_millis() as u64,
            max_connections = config.max_connections,
            "Creating hub"
        );
        let registry = Arc::new(Registry::with_capacity_limit(config.max_connections));
        let dispatcher = Dispatcher::spawn(Arc::clone(&registry));

        Self {
            registry,
            dispatcher,
            config,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Get the registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Register a connection around `sink`.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is shutting down or full.
    pub fn connect(&self, sink: impl FrameSink + 'static) -> Result<Registration, HubError> {
        Ok(self.registry.register(Box::new(sink))?)
    }

    /// The transport reports the connection is done (completed, timed out or
    /// failed). Idempotent.
    ///
    /// Returns `true` if this call removed the connection.
    pub fn disconnect(&self, id: &str) -> bool {
        self.registry.unregister(id).is_some()
    }

    /// Ask a connection to close. No-op for unknown ids.
    pub fn request_close(&self, id: &str) -> bool {
        self.registry.request_close(id)
    }

    /// Look up a live connection.
    #[must_use]
    pub fn lookup(&self, id: &str) -> Option<Arc<Connection>> {
        self.registry.lookup(id)
    }

    /// Broadcast a payload and wait for it to reach every current sink.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is shutting down.
    pub async fn publish(&self, payload: impl Into<Message>) -> Result<DeliveryReport, HubError> {
        Ok(self.dispatcher.publish(payload).await?)
    }

    /// Broadcast a payload without waiting for delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is shutting down.
    pub fn publish_detached(&self, payload: impl Into<Message>) -> Result<(), HubError> {
        Ok(self.dispatcher.publish_detached(payload)?)
    }

    /// Route an inbound control message.
    ///
    /// `require_id` demands a `metadata.id` on send requests (the HTTP
    /// control channel); `render` turns the payload fields into the text to
    /// broadcast and returns `None` if required fields are missing.
    pub async fn handle_control<F>(
        &self,
        message: &ControlMessage,
        require_id: bool,
        render: F,
    ) -> ControlOutcome
    where
        F: FnOnce(&ControlMessage) -> Option<String>,
    {
        let id = message.id.as_deref();

        if message.kind == ControlKind::Close {
            return match id {
                Some(id) if self.request_close(id) => ControlOutcome::Closed,
                _ => {
                    debug!(connection = ?id, "Close for unknown connection ignored");
                    ControlOutcome::Ignored
                }
            };
        }

        match id {
            Some(id) if self.registry.lookup(id).is_none() => {
                debug!(connection = %id, "Send from unknown connection ignored");
                return ControlOutcome::Ignored;
            }
            None if require_id => {
                return ControlOutcome::Rejected("missing metadata.id".into());
            }
            _ => {}
        }

        let Some(payload) = render(message) else {
            return ControlOutcome::Rejected("missing payload fields".into());
        };

        match self.publish(payload).await {
            Ok(report) => ControlOutcome::Published(report),
            Err(e) => {
                warn!(error = %e, "Publish rejected");
                ControlOutcome::Rejected(e.to_string())
            }
        }
    }

    /// Check if shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Shut the hub down.
    ///
    /// Registration is refused immediately, messages already queued are
    /// delivered, and then every connection is closed so each transport's
    /// session ends.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down hub");

        self.registry.begin_shutdown();
        self.dispatcher.shutdown().await;
        let closed = self.registry.drain();

        info!(closed, "Hub shut down");
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{channel_sink, ConnectionState};
    use bytes::Bytes;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn connect(hub: &Hub) -> (Registration, UnboundedReceiver<Bytes>) {
        let (sink, rx) = channel_sink();
        (hub.connect(sink).unwrap(), rx)
    }

    fn render_message(msg: &ControlMessage) -> Option<String> {
        msg.field("message").map(str::to_owned)
    }

    #[tokio::test]
    async fn test_publish_and_close_via_control() {
        let hub = Hub::new();
        let (a, mut rx_a) = connect(&hub);
        let (b, mut rx_b) = connect(&hub);

        let payload = r#"{"username":"x","message":"hi"}"#;
        let report = hub.publish(payload).await.unwrap();
        assert_eq!(report.delivered, 2);

        let expected = format!("{};{};", payload.len(), payload);
        assert_eq!(rx_a.recv().await.unwrap(), expected.as_bytes());
        assert_eq!(rx_b.recv().await.unwrap(), expected.as_bytes());

        let close = ControlMessage::close(a.id.as_str());
        let outcome = hub.handle_control(&close, true, render_message).await;
        assert_eq!(outcome, ControlOutcome::Closed);
        assert_eq!(a.lifecycle.state(), ConnectionState::Closing);

        // The adapter observes Closing and reports done.
        assert!(hub.disconnect(a.id.as_str()));
        assert!(!hub.disconnect(a.id.as_str()));

        let report = hub.publish("again").await.unwrap();
        assert_eq!(report.recipients, 1);
        assert_eq!(rx_b.recv().await.unwrap(), Bytes::from_static(b"5;again;"));
        assert!(rx_a.try_recv().is_err());
        assert!(b.lifecycle.is_open());

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_unknown_id_is_ignored() {
        let hub = Hub::new();
        let outcome = hub
            .handle_control(&ControlMessage::close("nope"), true, render_message)
            .await;
        assert_eq!(outcome, ControlOutcome::Ignored);

        let no_id = ControlMessage::from_pairs([("metadata.type", "close")]);
        let outcome = hub.handle_control(&no_id, true, render_message).await;
        assert_eq!(outcome, ControlOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_send_routing_rules() {
        let hub = Hub::new();
        let (reg, mut rx) = connect(&hub);

        let unknown = ControlMessage::from_pairs([("metadata.id", "nope"), ("message", "hi")]);
        assert_eq!(
            hub.handle_control(&unknown, true, render_message).await,
            ControlOutcome::Ignored
        );

        let anonymous = ControlMessage::from_pairs([("message", "hi")]);
        assert!(matches!(
            hub.handle_control(&anonymous, true, render_message).await,
            ControlOutcome::Rejected(_)
        ));

        let empty = ControlMessage::from_pairs([("metadata.id", reg.id.as_str())]);
        assert!(matches!(
            hub.handle_control(&empty, true, render_message).await,
            ControlOutcome::Rejected(_)
        ));
        assert!(rx.try_recv().is_err());

        let valid = ControlMessage::from_pairs([
            ("metadata.id", reg.id.as_str()),
            ("metadata.type", "send"),
            ("message", "hi"),
        ]);
        assert!(matches!(
            hub.handle_control(&valid, true, render_message).await,
            ControlOutcome::Published(DeliveryReport { delivered: 1, .. })
        ));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"2;hi;"));

        assert!(matches!(
            hub.handle_control(&anonymous, false, render_message).await,
            ControlOutcome::Published(_)
        ));
    }

    #[tokio::test]
    async fn test_shutdown() {
        let hub = Hub::new();
        let (reg, _rx) = connect(&hub);
        let mut lifecycle = reg.lifecycle.clone();

        hub.shutdown().await;
        hub.shutdown().await;

        assert!(hub.is_shutting_down());
        assert_eq!(lifecycle.wait_until_not_open().await, ConnectionState::Closed);
        assert!(hub.registry().is_empty());

        let (sink, _rx) = channel_sink();
        let err = hub.connect(sink).unwrap_err();
        assert!(err.is_shutdown());
        assert!(hub.publish("late").await.unwrap_err().is_shutdown());
    }

    #[tokio::test]
    async fn test_connection_limit_from_config() {
        let hub = Hub::with_config(HubConfig {
            max_connections: 1,
            ..HubConfig::default()
        });
        let _first = connect(&hub);

        let (sink, _rx) = channel_sink();
        assert_eq!(
            hub.connect(sink).unwrap_err(),
            HubError::Registry(RegistryError::Full(1))
        );
    }
}
