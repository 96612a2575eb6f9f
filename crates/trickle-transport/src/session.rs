//! A registered connection as seen from its transport.
//!
//! A [`Session`] owns the receiving side of a connection's frame channel and
//! its lifecycle watcher. Dropping it reports the connection done to the hub,
//! so every exit path of a transport (normal end, timeout, client gone,
//! panic) unregisters exactly once.

use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use trickle_core::{channel_sink, ConnectionId, ConnectionState, Hub, Lifecycle, Registration};
use trickle_protocol::encode_preamble;

use crate::traits::TransportError;

/// Why a session stopped producing frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// A close was requested through the control channel.
    CloseRequested,
    /// The connection was removed (failed delivery or shutdown).
    Closed,
    /// The connection timeout elapsed.
    Timeout,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::CloseRequested => write!(f, "close requested"),
            EndReason::Closed => write!(f, "closed"),
            EndReason::Timeout => write!(f, "timeout"),
        }
    }
}

/// What a session yields next.
#[derive(Debug, PartialEq, Eq)]
pub enum Next {
    /// An encoded frame to write to the client.
    Frame(Bytes),
    /// The stream is over.
    End(EndReason),
}

/// One connection's transport-side state.
pub struct Session {
    hub: Arc<Hub>,
    id: ConnectionId,
    preamble: Bytes,
    frames: mpsc::UnboundedReceiver<Bytes>,
    lifecycle: Lifecycle,
    deadline: Option<Instant>,
}

impl Session {
    /// Register a new connection with `hub`.
    ///
    /// With a `timeout`, the session ends with [`EndReason::Timeout`] once
    /// that much time has passed without the deadline being extended.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub refuses the connection.
    pub fn open(hub: Arc<Hub>, timeout: Option<Duration>) -> Result<Self, TransportError> {
        let (sink, frames) = channel_sink();
        let Registration { id, lifecycle } = hub.connect(sink)?;
        let preamble = encode_preamble(id.as_str(), hub.config().padding);

        Ok(Self {
            hub,
            id,
            preamble,
            frames,
            lifecycle,
            deadline: timeout.map(|t| Instant::now() + t),
        })
    }

    /// Get the connection id.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// The stream-open preamble, written before any frame.
    #[must_use]
    pub fn preamble(&self) -> Bytes {
        self.preamble.clone()
    }

    /// Get the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    /// Check whether the timeout has elapsed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| d <= Instant::now())
    }

    /// Restart the timeout from now.
    pub fn extend_deadline(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    /// Wait for the next frame or the end of the stream.
    ///
    /// Frames already queued are returned before a close is reported.
    pub async fn next(&mut self) -> Next {
        let deadline = self.deadline;
        let timeout = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            frame = self.frames.recv() => match frame {
                Some(frame) => Next::Frame(frame),
                None => Next::End(EndReason::Closed),
            },

            state = self.lifecycle.wait_until_not_open() => {
                if let Ok(frame) = self.frames.try_recv() {
                    return Next::Frame(frame);
                }
                match state {
                    ConnectionState::Closing => Next::End(EndReason::CloseRequested),
                    _ => Next::End(EndReason::Closed),
                }
            }

            () = timeout => Next::End(EndReason::Timeout),
        }
    }

    /// Take a frame that is already queued, without waiting.
    pub fn try_next(&mut self) -> Option<Bytes> {
        self.frames.try_recv().ok()
    }

    /// Turn the session into a byte stream: the preamble, then every frame
    /// until the session ends.
    pub fn into_stream(self) -> impl Stream<Item = Bytes> + Send + 'static {
        let preamble = self.preamble();
        stream::once(async move { preamble }).chain(stream::unfold(
            self,
            |mut session| async move {
                match session.next().await {
                    Next::Frame(frame) => Some((frame, session)),
                    Next::End(reason) => {
                        debug!(connection = %session.id, %reason, "Stream ended");
                        None
                    }
                }
            },
        ))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.hub.disconnect(self.id.as_str()) {
            debug!(connection = %self.id, "Connection unregistered");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trickle_core::HubConfig;
    use trickle_protocol::decode_preamble;

    fn hub() -> Arc<Hub> {
        Arc::new(Hub::with_config(HubConfig {
            padding: 8,
            ..HubConfig::default()
        }))
    }

    #[tokio::test]
    async fn test_open_registers_and_drop_unregisters() {
        let hub = hub();
        let session = Session::open(Arc::clone(&hub), None).unwrap();
        let id = session.id().to_string();

        assert!(hub.lookup(&id).is_some());
        let mut preamble = bytes::BytesMut::from(&session.preamble()[..]);
        assert_eq!(decode_preamble(&mut preamble).unwrap(), Some(id.clone()));

        drop(session);
        assert!(hub.lookup(&id).is_none());
    }

    #[tokio::test]
    async fn test_frames_then_close_request() {
        let hub = hub();
        let mut session = Session::open(Arc::clone(&hub), None).unwrap();

        hub.publish("one").await.unwrap();
        hub.publish("two").await.unwrap();
        hub.request_close(session.id().as_str());

        assert_eq!(session.next().await, Next::Frame(Bytes::from_static(b"3;one;")));
        assert_eq!(session.next().await, Next::Frame(Bytes::from_static(b"3;two;")));
        assert_eq!(session.next().await, Next::End(EndReason::CloseRequested));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let hub = hub();
        let timeout = Some(Duration::from_millis(150));
        let mut session = Session::open(Arc::clone(&hub), timeout).unwrap();

        assert!(!session.is_expired());
        assert_eq!(session.next().await, Next::End(EndReason::Timeout));
        assert!(session.is_expired());

        session.extend_deadline(Duration::from_secs(1));
        assert!(!session.is_expired());
    }

    #[tokio::test]
    async fn test_shutdown_ends_session() {
        let hub = hub();
        let mut session = Session::open(Arc::clone(&hub), None).unwrap();

        hub.shutdown().await;
        assert_eq!(session.next().await, Next::End(EndReason::Closed));
        assert_eq!(session.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_into_stream() {
        let hub = hub();
        let session = Session::open(Arc::clone(&hub), None).unwrap();
        let id = session.id().to_string();
        let preamble = session.preamble();

        hub.publish("hi").await.unwrap();
        hub.request_close(&id);

        let chunks: Vec<Bytes> = session.into_stream().collect().await;
        assert_eq!(chunks, vec![preamble, Bytes::from_static(b"2;hi;")]);
        assert!(hub.lookup(&id).is_none());
    }
}
