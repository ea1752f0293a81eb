//! Execution seam between the transport layer and a GraphQL engine.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use gqlx_core::{Operation, OperationResult, Result};

/// Results of one subscription, in production order.
pub type ResultStream = BoxStream<'static, OperationResult>;

/// Runs operations for a [`BrokerServer`](crate::BrokerServer).
///
/// Errors returned by [`Executor::subscribe`] refuse the subscription and
/// are replied to the client as a result. A stream that panics is reported
/// to the client as an error result and closed.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Executes a query or mutation.
    async fn execute(&self, operation: Operation) -> OperationResult;

    /// Starts a subscription.
    async fn subscribe(&self, operation: Operation) -> Result<ResultStream>;
}

#[async_trait]
impl<E: Executor> Executor for std::sync::Arc<E> {
    async fn execute(&self, operation: Operation) -> OperationResult {
        (**self).execute(operation).await
    }

    async fn subscribe(&self, operation: Operation) -> Result<ResultStream> {
        (**self).subscribe(operation).await
    }
}
