//! GraphQL operations and their wire payload.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Variable values keyed by variable name.
pub type Variables = IndexMap<String, serde_json::Value>;

/// Extension values keyed by extension name (e.g. `persistedQuery`).
pub type Extensions = IndexMap<String, serde_json::Value>;

/// Operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    #[default]
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    /// Recovers the kind from the leading keyword of a document.
    ///
    /// Anonymous shorthand documents (`{ ... }`) and empty documents (a
    /// hash-only persisted query) are queries.
    pub fn detect(document: &str) -> Self {
        let mut rest = document.trim_start();
        // Skip leading comment lines.
        while let Some(stripped) = rest.strip_prefix('#') {
            rest = stripped
                .split_once('\n')
                .map_or("", |(_, tail)| tail)
                .trim_start();
        }

        if starts_with_keyword(rest, "subscription") {
            Self::Subscription
        } else if starts_with_keyword(rest, "mutation") {
            Self::Mutation
        } else {
            Self::Query
        }
    }

    /// Returns true for kinds that stream more than one result.
    pub const fn is_streaming(&self) -> bool {
        matches!(self, Self::Subscription)
    }
}

fn starts_with_keyword(text: &str, keyword: &str) -> bool {
    text.strip_prefix(keyword)
        .is_some_and(|tail| !tail.starts_with(|c: char| c.is_alphanumeric() || c == '_'))
}

/// A single GraphQL operation.
///
/// Operations are treated as values: interceptors that need a different
/// shape (for example a hash-only persisted query) build a new operation
/// with the `with_*` methods instead of mutating a shared one.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Operation {
    pub kind: OperationKind,
    pub name: Option<String>,
    pub query: String,
    pub variables: Variables,
    pub extensions: Extensions,
    pub headers: HashMap<String, String>,
}

impl Operation {
    /// Creates an operation, detecting its kind from the document.
    pub fn new(query: impl Into<String>) -> Self {
        let query = query.into();
        Self {
            kind: OperationKind::detect(&query),
            query,
            ..Default::default()
        }
    }

    /// Creates a query operation.
    pub fn query(query: impl Into<String>) -> Self {
        Self::new(query).with_kind(OperationKind::Query)
    }

    /// Creates a mutation operation.
    pub fn mutation(query: impl Into<String>) -> Self {
        Self::new(query).with_kind(OperationKind::Mutation)
    }

    /// Creates a subscription operation.
    pub fn subscription(query: impl Into<String>) -> Self {
        Self::new(query).with_kind(OperationKind::Subscription)
    }

    /// Sets the kind.
    #[must_use]
    pub fn with_kind(mut self, kind: OperationKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the operation name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Replaces the document text.
    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    /// Adds a variable.
    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.variables.insert(name.into(), value);
        }
        self
    }

    /// Replaces all variables with the fields of a serializable struct.
    ///
    /// Values that do not serialize to a JSON object leave the variables empty.
    #[must_use]
    pub fn with_variables<V: Serialize>(mut self, variables: V) -> Self {
        self.variables = match serde_json::to_value(variables) {
            Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => Variables::new(),
        };
        self
    }

    /// Adds an extension value.
    #[must_use]
    pub fn with_extension(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.extensions.insert(name.into(), value);
        self
    }

    /// Adds a transport-level header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Returns the wire payload for this operation.
    pub fn payload(&self) -> OperationPayload {
        OperationPayload {
            query: self.query.clone(),
            operation_name: self.name.clone(),
            variables: self.variables.clone(),
            extensions: self.extensions.clone(),
            headers: self.headers.clone(),
        }
    }
}

/// Wire payload of an operation: `{query, operationName?, variables?, extensions?, headers?}`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationPayload {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub variables: Variables,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub extensions: Extensions,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl From<OperationPayload> for Operation {
    fn from(payload: OperationPayload) -> Self {
        Self {
            kind: OperationKind::detect(&payload.query),
            name: payload.operation_name,
            query: payload.query,
            variables: payload.variables,
            extensions: payload.extensions,
            headers: payload.headers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_kind() {
        assert_eq!(OperationKind::detect("{ rooms { name } }"), OperationKind::Query);
        assert_eq!(
            OperationKind::detect("  mutation Post { post(text: \"hi\") }"),
            OperationKind::Mutation
        );
        assert_eq!(
            OperationKind::detect("# watch\nsubscription { messageAdded { text } }"),
            OperationKind::Subscription
        );
        assert_eq!(OperationKind::detect("mutations { x }"), OperationKind::Query);
        assert_eq!(OperationKind::detect(""), OperationKind::Query);
    }

    #[test]
    fn test_payload_skips_empty_fields() {
        let op = Operation::query("{ rooms { name } }");
        let json = serde_json::to_value(op.payload()).unwrap();
        assert_eq!(json, serde_json::json!({"query": "{ rooms { name } }"}));
    }

    #[test]
    fn test_payload_field_names() {
        let op = Operation::query("query Room($name: String!) { room(name: $name) { name } }")
            .with_name("Room")
            .with_variable("name", "test")
            .with_extension("persistedQuery", serde_json::json!({"version": 1}));
        let json = serde_json::to_value(op.payload()).unwrap();
        assert_eq!(json["operationName"], "Room");
        assert_eq!(json["variables"]["name"], "test");
        assert_eq!(json["extensions"]["persistedQuery"]["version"], 1);
    }

    #[test]
    fn test_with_variables_from_struct() {
        #[derive(Serialize)]
        struct RoomVars {
            name: String,
        }

        let op = Operation::query("{ x }").with_variables(RoomVars {
            name: "lobby".into(),
        });
        assert_eq!(op.variables.get("name"), Some(&serde_json::json!("lobby")));
    }

    #[test]
    fn test_operation_from_payload_detects_kind() {
        let payload: OperationPayload =
            serde_json::from_str(r#"{"query":"subscription { tick }","operationName":"Tick"}"#)
                .unwrap();
        let op = Operation::from(payload);
        assert_eq!(op.kind, OperationKind::Subscription);
        assert_eq!(op.name.as_deref(), Some("Tick"));
    }
}
