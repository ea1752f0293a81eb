//! Operation results.

use crate::error::{Error, ErrorCode, Result, ResultExt};
use indexmap::IndexMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// One unit of data, errors and extensions produced for an operation.
///
/// Wire shape: `{data?, errors?, extensions?}`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OperationResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub extensions: IndexMap<String, serde_json::Value>,
}

impl OperationResult {
    /// Creates a result carrying data.
    pub fn data(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }

    /// Creates a result carrying a single error.
    pub fn error(error: GraphQLError) -> Self {
        Self {
            errors: vec![error],
            ..Default::default()
        }
    }

    /// Returns true if the result carries neither data nor errors.
    pub fn is_empty(&self) -> bool {
        self.data.is_none() && self.errors.is_empty()
    }

    /// Returns true if any error carries the given `extensions.code`.
    pub fn has_error_code(&self, code: &str) -> bool {
        self.errors.iter().any(|e| e.code() == Some(code))
    }

    /// Deserializes the data, failing on result-level errors or missing data.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T> {
        if let Some(first) = self.errors.first() {
            let mut err = Error::new(ErrorCode::ExecutionError, first.message.clone());
            if let Some(code) = first.code() {
                err = err.with_extension("code", code);
            }
            return Err(err);
        }

        match self.data {
            Some(data) => serde_json::from_value(data).map_err_code(ErrorCode::DeserializeError),
            None => Err(Error::new(ErrorCode::NoData, "No data in response")),
        }
    }
}

/// A result-level GraphQL error.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub extensions: IndexMap<String, serde_json::Value>,
}

impl GraphQLError {
    /// Creates an error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Sets `extensions.code`.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.extensions
            .insert("code".to_string(), serde_json::Value::String(code.into()));
        self
    }

    /// Returns `extensions.code`, if it is a string.
    pub fn code(&self) -> Option<&str> {
        self.extensions.get("code").and_then(|c| c.as_str())
    }
}

impl From<&Error> for GraphQLError {
    fn from(err: &Error) -> Self {
        Self::new(err.message.clone()).with_code(err.code.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct RoomData {
        room: Room,
    }

    #[derive(Deserialize)]
    struct Room {
        name: String,
    }

    #[test]
    fn test_decode_data() {
        let result: OperationResult =
            serde_json::from_str(r#"{"data":{"room":{"name":"test"}}}"#).unwrap();
        let data: RoomData = result.decode().unwrap();
        assert_eq!(data.room.name, "test");
    }

    #[test]
    fn test_decode_surfaces_first_error() {
        let result = OperationResult::error(GraphQLError::new("boom").with_code("INTERNAL"));
        let err = result.decode::<serde_json::Value>().unwrap_err();
        assert_eq!(err.code, ErrorCode::ExecutionError);
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn test_decode_without_data() {
        let err = OperationResult::default()
            .decode::<serde_json::Value>()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NoData);
    }

    #[test]
    fn test_error_code_lookup() {
        let result: OperationResult = serde_json::from_str(
            r#"{"errors":[{"message":"PersistedQueryNotFound","extensions":{"code":"PERSISTED_QUERY_NOT_FOUND"}}]}"#,
        )
        .unwrap();
        assert!(result.has_error_code("PERSISTED_QUERY_NOT_FOUND"));
        assert!(!result.has_error_code("NOT_FOUND"));
        assert!(!result.is_empty());
    }
}
