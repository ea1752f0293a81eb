//! `graphql-ws` message envelope.

use gqlx_core::{GraphQLError, OperationPayload, OperationResult};
use serde::{Deserialize, Serialize};

/// Subprotocol negotiated during the WebSocket handshake.
pub const SUBPROTOCOL: &str = "graphql-ws";

/// Envelope type tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    ConnectionInit,
    ConnectionAck,
    ConnectionError,
    KeepAlive,
    Start,
    Stop,
    Data,
    Error,
    Complete,
    ConnectionTerminate,
    /// Any tag this client does not know. Ignored on receipt.
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ConnectionInit => "connection_init",
            Self::ConnectionAck => "connection_ack",
            Self::ConnectionError => "connection_error",
            Self::KeepAlive => "ka",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Data => "data",
            Self::Error => "error",
            Self::Complete => "complete",
            Self::ConnectionTerminate => "connection_terminate",
            Self::Unknown(tag) => tag,
        }
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "connection_init" => Self::ConnectionInit,
            "connection_ack" => Self::ConnectionAck,
            "connection_error" => Self::ConnectionError,
            "ka" => Self::KeepAlive,
            "start" => Self::Start,
            "stop" => Self::Stop,
            "data" => Self::Data,
            "error" => Self::Error,
            "complete" => Self::Complete,
            "connection_terminate" => Self::ConnectionTerminate,
            _ => Self::Unknown(tag),
        }
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Unknown(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{id?, type, payload?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl OperationMessage {
    pub fn new(kind: MessageType) -> Self {
        Self {
            id: None,
            kind,
            payload: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn init(payload: Option<serde_json::Value>) -> Self {
        Self {
            payload,
            ..Self::new(MessageType::ConnectionInit)
        }
    }

    pub fn start(id: &str, payload: &OperationPayload) -> Self {
        Self {
            id: Some(id.to_string()),
            kind: MessageType::Start,
            payload: serde_json::to_value(payload).ok(),
        }
    }

    pub fn stop(id: &str) -> Self {
        Self::new(MessageType::Stop).with_id(id)
    }

    pub fn terminate() -> Self {
        Self::new(MessageType::ConnectionTerminate)
    }

    /// Converts a `data` or `error` payload into a result.
    ///
    /// A payload that does not decode becomes a result carrying one error,
    /// so the consumer learns about it instead of the message being dropped.
    pub fn into_result(self) -> OperationResult {
        let payload = self.payload.unwrap_or_default();

        if self.kind == MessageType::Error {
            // `error` payloads are a bare error object or a list of them.
            if let Ok(errors) = serde_json::from_value::<Vec<GraphQLError>>(payload.clone()) {
                return OperationResult {
                    errors,
                    ..Default::default()
                };
            }
            if let Ok(error) = serde_json::from_value::<GraphQLError>(payload.clone()) {
                return OperationResult::error(error);
            }
        }

        match serde_json::from_value::<OperationResult>(payload) {
            Ok(result) => result,
            Err(e) => OperationResult::error(
                GraphQLError::new(format!("failed to decode {} payload: {e}", self.kind))
                    .with_code("DESERIALIZE_ERROR"),
            ),
        }
    }
}
