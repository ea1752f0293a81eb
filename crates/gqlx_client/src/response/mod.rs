//! The uniform consumer-facing handle for "zero, one or many results over time".
//!
//! Every transport hands back a [`Response`], whether the operation was served
//! by a single request/reply exchange or by a long-lived stream:
//! - [`SingleResponse`]: exactly one already-available result
//! - [`ChanResponse`]: a channel fed by a producer task
//! - [`ProxyResponse`]: relays one or more upstream responses and can swap them
//!   while the consumer keeps reading

mod chan;
mod proxy;
mod single;

pub use chan::ChanResponse;
pub use proxy::{OnResult, ProxyResponse, ProxySink};
pub use single::SingleResponse;

use async_trait::async_trait;
use gqlx_core::{Error, OperationResult};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// Shared handle to a response.
pub type BoxResponse = Arc<dyn Response>;

/// A stream of operation results with cancellation and error reporting.
///
/// All methods take `&self`: a response is read by its consumer while other
/// tasks may close it.
#[async_trait]
pub trait Response: Send + Sync + 'static {
    /// Waits for the next result. `None` means the response is finished;
    /// check [`Response::err`] to tell completion from failure.
    async fn next(&self) -> Option<OperationResult>;

    /// Returns the first error recorded on this response.
    fn err(&self) -> Option<Error>;

    /// Closes the response. Idempotent and safe to call from any task.
    fn close(&self);

    /// Records `err` (unless an error is already recorded) and closes.
    fn close_with_error(&self, err: Error);

    /// Completion signal, cancelled once the response is closed or exhausted.
    fn done(&self) -> CancellationToken;
}

/// Returns true if both handles point at the same response.
pub fn same_response(a: &BoxResponse, b: &BoxResponse) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

/// Error slot where the first write wins.
#[derive(Debug, Default)]
pub(crate) struct ErrorSlot(OnceLock<Error>);

impl ErrorSlot {
    /// Stores `err` if the slot is empty. Returns false if it was already set.
    pub(crate) fn set(&self, err: Error) -> bool {
        self.0.set(err).is_ok()
    }

    pub(crate) fn get(&self) -> Option<Error> {
        self.0.get().cloned()
    }

    pub(crate) fn is_set(&self) -> bool {
        self.0.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gqlx_core::ErrorCode;

    #[test]
    fn test_error_slot_first_write_wins() {
        let slot = ErrorSlot::default();
        assert!(slot.set(Error::network("first")));
        assert!(!slot.set(Error::internal("second")));
        assert_eq!(slot.get().unwrap().code, ErrorCode::NetworkError);
    }

    #[test]
    fn test_same_response() {
        let a: BoxResponse = Arc::new(SingleResponse::new(OperationResult::default()));
        let b: BoxResponse = Arc::new(SingleResponse::new(OperationResult::default()));
        assert!(same_response(&a, &a.clone()));
        assert!(!same_response(&a, &b));
    }
}
