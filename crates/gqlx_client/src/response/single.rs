use super::{ErrorSlot, Response};
use async_trait::async_trait;
use gqlx_core::{Error, OperationResult};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// A response holding exactly one result, used for queries and mutations.
#[derive(Debug)]
pub struct SingleResponse {
    result: Mutex<Option<OperationResult>>,
    err: ErrorSlot,
    done: CancellationToken,
}

impl SingleResponse {
    pub fn new(result: OperationResult) -> Self {
        Self::build(Some(result))
    }

    /// A response that yields nothing and reports `err`.
    pub fn failed(err: Error) -> Self {
        let response = Self::build(None);
        response.err.set(err);
        response
    }

    fn build(result: Option<OperationResult>) -> Self {
        let done = CancellationToken::new();
        done.cancel();
        Self {
            result: Mutex::new(result),
            err: ErrorSlot::default(),
            done,
        }
    }
}

#[async_trait]
impl Response for SingleResponse {
    async fn next(&self) -> Option<OperationResult> {
        if self.err.is_set() {
            return None;
        }
        self.result
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    fn err(&self) -> Option<Error> {
        self.err.get()
    }

    fn close(&self) {}

    fn close_with_error(&self, err: Error) {
        self.err.set(err);
    }

    fn done(&self) -> CancellationToken {
        self.done.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gqlx_core::ErrorCode;

    #[tokio::test]
    async fn test_yields_once() {
        let response = SingleResponse::new(OperationResult::data(serde_json::json!({"ok": true})));
        assert!(response.done().is_cancelled());

        let first = response.next().await.unwrap();
        assert_eq!(first.data, Some(serde_json::json!({"ok": true})));
        assert!(response.next().await.is_none());
        assert!(response.err().is_none());
    }

    #[tokio::test]
    async fn test_error_suppresses_result() {
        let response = SingleResponse::new(OperationResult::default());
        response.close_with_error(Error::network("down"));
        response.close_with_error(Error::internal("ignored"));

        assert!(response.next().await.is_none());
        assert_eq!(response.err().unwrap().code, ErrorCode::NetworkError);
    }

    #[tokio::test]
    async fn test_failed() {
        let response = SingleResponse::failed(Error::timeout());
        response.close();
        assert!(response.next().await.is_none());
        assert_eq!(response.err().unwrap().code, ErrorCode::Timeout);
    }
}
