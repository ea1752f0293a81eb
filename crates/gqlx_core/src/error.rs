//! Strongly typed transport errors.
//!
//! Transport errors are distinct from result-level errors: a GraphQL error
//! inside an [`OperationResult`](crate::OperationResult) is data, an
//! [`Error`] means the exchange itself failed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Typed error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // Network errors
    NetworkError,
    Timeout,
    ConnectionRefused,

    // Protocol errors
    HttpError,
    HttpsNotSupported,
    InvalidUrl,
    InvalidHeader,
    ProtocolError,
    ConnectionError,
    ConnectionTerminated,

    // GraphQL errors
    ExecutionError,
    NoData,

    // Serialization errors
    SerializeError,
    DeserializeError,

    // Lifecycle errors
    Cancelled,
    Closed,

    // Broker errors
    BrokerError,
    NoResponders,
    HeartbeatFailed,

    // Internal errors
    InternalError,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkError => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ConnectionRefused => "CONNECTION_REFUSED",
            Self::HttpError => "HTTP_ERROR",
            Self::HttpsNotSupported => "HTTPS_NOT_SUPPORTED",
            Self::InvalidUrl => "INVALID_URL",
            Self::InvalidHeader => "INVALID_HEADER",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::ConnectionTerminated => "CONNECTION_TERMINATED",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::NoData => "NO_DATA",
            Self::SerializeError => "SERIALIZE_ERROR",
            Self::DeserializeError => "DESERIALIZE_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::Closed => "CLOSED",
            Self::BrokerError => "BROKER_ERROR",
            Self::NoResponders => "NO_RESPONDERS",
            Self::HeartbeatFailed => "HEARTBEAT_FAILED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Returns true if a failed exchange with this code may be attempted again.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkError | Self::Timeout | Self::ConnectionRefused | Self::NoResponders
        )
    }

    /// Returns true if the code describes the connection going away rather
    /// than a malformed exchange.
    pub const fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::NetworkError
                | Self::Timeout
                | Self::ConnectionRefused
                | Self::ConnectionError
                | Self::ConnectionTerminated
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transport error.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("[{code}] {message}")]
pub struct Error {
    /// Typed error code.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Extension data for debugging.
    pub extensions: Option<HashMap<String, serde_json::Value>>,
}

impl Error {
    /// Creates a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            extensions: None,
        }
    }

    /// Adds extension data.
    #[must_use]
    pub fn with_extension(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let extensions = self.extensions.get_or_insert_with(HashMap::new);
        if let Ok(v) = serde_json::to_value(value) {
            extensions.insert(key.into(), v);
        }
        self
    }

    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkError, message)
    }

    /// Creates a timeout error.
    pub fn timeout() -> Self {
        Self::new(ErrorCode::Timeout, "Request timed out")
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProtocolError, message)
    }

    /// Creates a serialization error.
    pub fn serialize(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SerializeError, message)
    }

    /// Creates a deserialization error.
    pub fn deserialize(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeserializeError, message)
    }

    /// Creates a cancellation error.
    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "Operation cancelled")
    }

    /// Creates a closed error.
    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Closed, message)
    }

    /// Creates a broker error.
    pub fn broker(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BrokerError, message)
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

impl Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("Error", 3)?;
        state.serialize_field("code", &self.code)?;
        state.serialize_field("message", &self.message)?;
        if let Some(ref ext) = self.extensions {
            state.serialize_field("extensions", ext)?;
        }
        state.end()
    }
}

/// Type alias for gqlx results.
pub type Result<T> = std::result::Result<T, Error>;

/// Result extension for mapping foreign errors onto a code.
pub trait ResultExt<T> {
    /// Maps the error to an [`Error`] with the given code.
    fn map_err_code(self, code: ErrorCode) -> Result<T>;

    /// Maps the error to an [`Error`] with the given code and message,
    /// keeping the original error text as an extension.
    fn map_err_with(self, code: ErrorCode, message: impl Into<String>) -> Result<T>;
}

impl<T, E: std::error::Error> ResultExt<T> for std::result::Result<T, E> {
    fn map_err_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| Error::new(code, e.to_string()))
    }

    fn map_err_with(self, code: ErrorCode, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::new(code, message).with_extension("original_error", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_properties() {
        assert!(ErrorCode::Timeout.is_retryable());
        assert!(ErrorCode::NoResponders.is_retryable());
        assert!(!ErrorCode::DeserializeError.is_retryable());

        assert!(ErrorCode::ConnectionTerminated.is_disconnect());
        assert!(!ErrorCode::ExecutionError.is_disconnect());
    }

    #[test]
    fn test_error_display() {
        let err = Error::network("Connection reset");
        assert_eq!(err.to_string(), "[NETWORK_ERROR] Connection reset");
    }

    #[test]
    fn test_error_serialization() {
        let err = Error::broker("no route").with_extension("subject", "rooms");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("BROKER_ERROR"));
        assert!(json.contains("rooms"));
    }

    #[test]
    fn test_result_ext() {
        let result: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));

        let mapped = result.map_err_code(ErrorCode::ConnectionRefused);
        assert_eq!(mapped.unwrap_err().code, ErrorCode::ConnectionRefused);
    }
}
