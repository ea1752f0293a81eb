//! Pluggable payload serialization.
//!
//! Transports never call `serde_json` on payloads directly; they go through
//! a [`Codec`] so a binary format can be swapped in without touching the
//! transport logic.

use crate::error::{ErrorCode, Result, ResultExt};
use crate::operation::{Operation, OperationPayload};
use crate::result::OperationResult;
use bytes::Bytes;

/// Encodes and decodes operation and result payloads.
pub trait Codec: Send + Sync + 'static {
    /// Content type advertised by transports that carry one.
    fn content_type(&self) -> &'static str;

    fn encode_operation(&self, operation: &Operation) -> Result<Bytes>;

    fn decode_operation(&self, bytes: &[u8]) -> Result<Operation>;

    fn encode_result(&self, result: &OperationResult) -> Result<Bytes>;

    fn decode_result(&self, bytes: &[u8]) -> Result<OperationResult>;
}

/// JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode_operation(&self, operation: &Operation) -> Result<Bytes> {
        serde_json::to_vec(&operation.payload())
            .map(Bytes::from)
            .map_err_code(ErrorCode::SerializeError)
    }

    fn decode_operation(&self, bytes: &[u8]) -> Result<Operation> {
        serde_json::from_slice::<OperationPayload>(bytes)
            .map(Operation::from)
            .map_err_code(ErrorCode::DeserializeError)
    }

    fn encode_result(&self, result: &OperationResult) -> Result<Bytes> {
        serde_json::to_vec(result)
            .map(Bytes::from)
            .map_err_code(ErrorCode::SerializeError)
    }

    fn decode_result(&self, bytes: &[u8]) -> Result<OperationResult> {
        serde_json::from_slice(bytes).map_err_code(ErrorCode::DeserializeError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationKind;

    #[test]
    fn test_decode_operation_keeps_kind_and_headers() {
        let codec = JsonCodec;
        let op = Operation::subscription("subscription { tick }").with_header("x-room", "lobby");
        let bytes = codec.encode_operation(&op).unwrap();
        let decoded = codec.decode_operation(&bytes).unwrap();
        assert_eq!(decoded.kind, OperationKind::Subscription);
        assert_eq!(decoded.headers.get("x-room").map(String::as_str), Some("lobby"));
    }

    #[test]
    fn test_decode_result_rejects_garbage() {
        let err = JsonCodec.decode_result(b"not json").unwrap_err();
        assert_eq!(err.code, ErrorCode::DeserializeError);
    }
}
