//! HTTP streaming transport.
//!
//! One long-lived response per connection: the preamble, then each frame as
//! it is published, until the connection is closed or times out.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::Stream;
use trickle_core::ControlOutcome;
use trickle_protocol::ControlMessage;

use crate::session::Session;
use crate::traits::{AdapterContext, TransportAdapter, TransportError};

/// Streaming adapter.
#[derive(Clone)]
pub struct StreamingAdapter {
    context: AdapterContext,
}

impl StreamingAdapter {
    /// Create a streaming adapter.
    #[must_use]
    pub fn new(context: AdapterContext) -> Self {
        Self { context }
    }

    /// Open a connection and return its response body.
    ///
    /// Dropping the stream (for instance because the client went away)
    /// unregisters the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub refuses the connection.
    pub async fn open_stream(
        &self,
    ) -> Result<impl Stream<Item = Bytes> + Send + 'static, TransportError> {
        Ok(self.on_connect().await?.into_stream())
    }
}

#[async_trait]
impl TransportAdapter for StreamingAdapter {
    type Opened = Session;

    fn name(&self) -> &'static str {
        "streaming"
    }

    async fn on_connect(&self) -> Result<Session, TransportError> {
        let timeout = self.context.connection_timeout();
        self.context.open_session(self.name(), Some(timeout))
    }

    async fn on_inbound_control(&self, message: ControlMessage) -> ControlOutcome {
        self.context.control(&message, true).await
    }

    fn on_transport_closed(&self, id: &str) -> bool {
        self.context.closed(id)
    }
}
