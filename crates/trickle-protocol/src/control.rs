//! Inbound control messages.
//!
//! Clients talk to the server out-of-band (a POST body, or a WebSocket text
//! message) using form-encoded key/value pairs. Two keys are reserved:
//!
//! - `metadata.id` - the connection the message concerns
//! - `metadata.type` - `close` to end that connection; anything else sends
//!
//! Every other pair is payload, kept in arrival order.

use crate::codec::ProtocolError;

/// Key carrying the connection id.
pub const METADATA_ID: &str = "metadata.id";

/// Key carrying the request type.
pub const METADATA_TYPE: &str = "metadata.type";

/// What a control message asks the server to do.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ControlKind {
    /// Publish the payload fields.
    #[default]
    Send,
    /// Terminate the connection named by `metadata.id`.
    Close,
    /// Unrecognised type; handled as [`ControlKind::Send`].
    Other(String),
}

impl ControlKind {
    /// Parse a `metadata.type` value.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "send" | "" => ControlKind::Send,
            "close" => ControlKind::Close,
            other => ControlKind::Other(other.to_string()),
        }
    }

    /// Whether this is a close request.
    #[must_use]
    pub fn is_close(&self) -> bool {
        matches!(self, ControlKind::Close)
    }
}

/// A parsed inbound control message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControlMessage {
    /// Connection id from `metadata.id`, if present and non-empty.
    pub id: Option<String>,
    /// Request type from `metadata.type`.
    pub kind: ControlKind,
    /// Remaining payload fields, in arrival order.
    pub fields: Vec<(String, String)>,
}

impl ControlMessage {
    /// Build a control message from key/value pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut message = ControlMessage::default();

        for (key, value) in pairs {
            let key = key.into();
            let value = value.into();
            match key.as_str() {
                METADATA_ID => message.id = Some(value).filter(|v| !v.is_empty()),
                METADATA_TYPE => message.kind = ControlKind::parse(&value),
                _ => message.fields.push((key, value)),
            }
        }

        message
    }

    /// Parse an `application/x-www-form-urlencoded` string.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Form`] if the input is not valid form data.
    pub fn from_form(input: &str) -> Result<Self, ProtocolError> {
        let pairs: Vec<(String, String)> =
            serde_urlencoded::from_str(input).map_err(|e| ProtocolError::Form(e.to_string()))?;
        Ok(Self::from_pairs(pairs))
    }

    /// Attach a connection id if none was supplied.
    #[must_use]
    pub fn with_default_id(mut self, id: impl Into<String>) -> Self {
        if self.id.is_none() {
            self.id = Some(id.into());
        }
        self
    }

    /// Look up the first payload field with the given name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Create a close request for a connection.
    #[must_use]
    pub fn close(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            kind: ControlKind::Close,
            fields: Vec::new(),
        }
    }
}
