//! WebSocket transport.
//!
//! The socket carries the preamble as its first text message and then one
//! text message per frame. Inbound text messages are form-encoded control
//! messages; a send without `metadata.id` is attributed to the socket's own
//! connection. The connection lives as long as the socket, or until the
//! connection timeout passes without an inbound message.

use async_trait::async_trait;
use axum::extract::ws::Message;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use tracing::{debug, warn};
use trickle_core::ControlOutcome;
use trickle_protocol::ControlMessage;

use crate::session::{Next, Session};
use crate::traits::{AdapterContext, TransportAdapter, TransportError};

/// WebSocket adapter.
#[derive(Clone)]
pub struct WebSocketAdapter {
    context: AdapterContext,
}

impl WebSocketAdapter {
    /// Create a WebSocket adapter.
    #[must_use]
    pub fn new(context: AdapterContext) -> Self {
        Self { context }
    }

    /// Drive one upgraded socket until either side closes it.
    pub async fn serve<S, E>(&self, socket: S)
    where
        S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Send + Unpin,
        E: Display + Send,
    {
        let (mut sender, mut receiver) = socket.split();

        let mut session = match self.on_connect().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "WebSocket connection refused");
                let _ = sender.send(Message::Close(None)).await;
                return;
            }
        };

        if let Err(e) = sender.send(text(session.preamble())).await {
            warn!(connection = %session.id(), error = %e, "Failed to send preamble");
            return;
        }

        loop {
            tokio::select! {
                next = session.next() => match next {
                    Next::Frame(frame) => {
                        if let Err(e) = sender.send(text(frame)).await {
                            debug!(connection = %session.id(), error = %e, "WebSocket send failed");
                            break;
                        }
                    }
                    Next::End(reason) => {
                        debug!(connection = %session.id(), %reason, "Closing WebSocket");
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                },

                inbound = receiver.next() => {
                    if let Some(Ok(_)) = &inbound {
                        session.extend_deadline(self.context.connection_timeout());
                    }

                    match inbound {
                        Some(Ok(Message::Text(body))) => {
                            match parse_control(&body, session.id().as_str()) {
                                Ok(message) => {
                                    self.on_inbound_control(message).await;
                                }
                                Err(e) => {
                                    warn!(
                                        connection = %session.id(),
                                        error = %e,
                                        "Malformed control message"
                                    );
                                }
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            warn!(connection = %session.id(), "Ignoring binary WebSocket message");
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = sender.send(Message::Pong(data)).await {
                                let id = session.id();
                                warn!(connection = %id, error = %e, "Failed to send pong");
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(connection = %session.id(), "WebSocket closed by client");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(connection = %session.id(), error = %e, "WebSocket error");
                            break;
                        }
                    }
                }
            }
        }

        self.on_transport_closed(session.id().as_str());
    }
}

/// Parse an inbound text message, binding it to the socket's connection
/// when it names none.
fn parse_control(body: &str, id: &str) -> Result<ControlMessage, TransportError> {
    Ok(ControlMessage::from_form(body)?.with_default_id(id))
}

/// Frames and preambles are always valid UTF-8.
fn text(frame: Bytes) -> Message {
    Message::Text(String::from_utf8_lossy(&frame).into_owned())
}

#[async_trait]
impl TransportAdapter for WebSocketAdapter {
    type Opened = Session;

    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn on_connect(&self) -> Result<Session, TransportError> {
        let timeout = self.context.connection_timeout();
        self.context.open_session(self.name(), Some(timeout))
    }

    async fn on_inbound_control(&self, message: ControlMessage) -> ControlOutcome {
        self.context.control(&message, false).await
    }

    fn on_transport_closed(&self, id: &str) -> bool {
        self.context.closed(id)
    }
}
