//! Per-operation transport routing.

use crate::response::BoxResponse;
use crate::transport::Transport;
use async_trait::async_trait;
use gqlx_core::Operation;
use std::sync::Arc;

type Classifier = Box<dyn Fn(&Operation) -> Arc<dyn Transport> + Send + Sync>;

/// A transport that picks one of several transports per operation.
pub struct SplitTransport {
    classify: Classifier,
}

impl SplitTransport {
    /// Routes each operation to the transport returned by `classify`.
    pub fn new<F>(classify: F) -> Self
    where
        F: Fn(&Operation) -> Arc<dyn Transport> + Send + Sync + 'static,
    {
        Self {
            classify: Box::new(classify),
        }
    }

    /// Sends subscriptions to `subscriptions` and everything else to `other`.
    pub fn by_kind(subscriptions: Arc<dyn Transport>, other: Arc<dyn Transport>) -> Self {
        Self::new(move |operation| {
            if operation.kind.is_streaming() {
                subscriptions.clone()
            } else {
                other.clone()
            }
        })
    }
}

#[async_trait]
impl Transport for SplitTransport {
    async fn request(&self, operation: Operation) -> BoxResponse {
        let transport = (self.classify)(&operation);
        transport.request(operation).await
    }
}
