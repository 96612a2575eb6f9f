//! Chat payload: what a `send` control message broadcasts.

use serde::{Deserialize, Serialize};
use tracing::warn;
use trickle_protocol::ControlMessage;
use trickle_transport::PayloadRenderer;

/// One chat line, broadcast as `{"username":..,"message":..}`.
///
/// An anonymous line omits `username` entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    /// Who sent it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// What they said.
    pub message: String,
}

impl ChatPayload {
    /// Extract the payload fields of a control message.
    ///
    /// Returns `None` if there is no `message` field.
    #[must_use]
    pub fn from_control(message: &ControlMessage) -> Option<Self> {
        Some(Self {
            username: message.field("username").map(str::to_owned),
            message: message.field("message")?.to_owned(),
        })
    }
}

/// Renders `send` requests as [`ChatPayload`] JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatRenderer;

impl PayloadRenderer for ChatRenderer {
    fn render(&self, message: &ControlMessage) -> Option<String> {
        let payload = ChatPayload::from_control(message)?;
        match serde_json::to_string(&payload) {
            Ok(json) => Some(json),
            Err(e) => {
                warn!(error = %e, "Failed to serialize chat payload");
                None
            }
        }
    }
}
