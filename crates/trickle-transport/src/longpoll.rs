//! Long-poll transport.
//!
//! A long-poll connection spans many requests. The opening request gets the
//! preamble; each later poll waits up to the poll window for frames and
//! returns everything queued. Between polls the session is parked here, and
//! a sweeper expires sessions whose client stopped polling.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use trickle_core::{ConnectionId, ConnectionState, ControlOutcome};
use trickle_protocol::ControlMessage;

use crate::session::{EndReason, Next, Session};
use crate::traits::{AdapterContext, TransportAdapter, TransportError};

/// Default time a poll waits for frames (30 seconds).
pub const DEFAULT_POLL_WAIT: Duration = Duration::from_secs(30);

/// Long-poll adapter.
pub struct LongPollAdapter {
    context: AdapterContext,
    sessions: DashMap<ConnectionId, Arc<Mutex<Session>>>,
    wait: Duration,
}

impl LongPollAdapter {
    /// Create a long-poll adapter whose polls wait at most `wait`.
    #[must_use]
    pub fn new(context: AdapterContext, wait: Duration) -> Self {
        Self {
            context,
            sessions: DashMap::new(),
            wait,
        }
    }

    /// Number of parked sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Wait for frames on connection `id`.
    ///
    /// Returns the concatenation of every frame queued by the time the first
    /// one arrives, or an empty body if the poll window passes first.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::UnknownConnection`] for ids without a
    /// session and [`TransportError::ConnectionClosed`] once the connection
    /// has ended.
    pub async fn poll(&self, id: &str) -> Result<Bytes, TransportError> {
        let session = self
            .sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::UnknownConnection(id.to_owned()))?;

        let mut session = session.lock().await;
        let idle = self.context.connection_timeout();
        session.extend_deadline(idle);

        let first = match tokio::time::timeout(self.wait, session.next()).await {
            Ok(Next::Frame(frame)) => frame,
            Ok(Next::End(reason)) => {
                debug!(connection = %id, %reason, "Long-poll session ended");
                self.sessions.remove(id);
                return Err(TransportError::ConnectionClosed);
            }
            Err(_) => {
                session.extend_deadline(idle);
                return Ok(Bytes::new());
            }
        };

        let mut body = BytesMut::from(&first[..]);
        while let Some(frame) = session.try_next() {
            body.extend_from_slice(&frame);
        }
        session.extend_deadline(idle);

        Ok(body.freeze())
    }

    /// Drop sessions that timed out or whose connection is no longer open.
    ///
    /// Sessions with a poll in flight are skipped. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|id, session| match session.try_lock() {
            Ok(session) => {
                let keep = !session.is_expired() && session.state() == ConnectionState::Open;
                if !keep {
                    let reason = if session.is_expired() {
                        EndReason::Timeout
                    } else {
                        EndReason::Closed
                    };
                    debug!(connection = %id, %reason, "Expiring long-poll session");
                }
                keep
            }
            Err(_) => true,
        });
        before.saturating_sub(self.sessions.len())
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the adapter is
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let adapter = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(adapter) = adapter.upgrade() else {
                    break;
                };
                let expired = adapter.sweep();
                if expired > 0 {
                    info!(expired, "Long-poll sessions expired");
                }
            }
        })
    }
}

#[async_trait]
impl TransportAdapter for LongPollAdapter {
    /// The preamble to return to the opening request.
    type Opened = Bytes;

    fn name(&self) -> &'static str {
        "long-poll"
    }

    async fn on_connect(&self) -> Result<Bytes, TransportError> {
        let timeout = self.context.connection_timeout();
        let session = self.context.open_session(self.name(), Some(timeout))?;
        let preamble = session.preamble();
        self.sessions
            .insert(session.id().clone(), Arc::new(Mutex::new(session)));
        Ok(preamble)
    }

    async fn on_inbound_control(&self, message: ControlMessage) -> ControlOutcome {
        self.context.control(&message, true).await
    }

    fn on_transport_closed(&self, id: &str) -> bool {
        // Dropping the parked session unregisters the connection.
        let parked = self.sessions.remove(id).is_some();
        self.context.closed(id) || parked
    }
}
