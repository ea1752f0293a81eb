//! The single-operation request contract.

use crate::response::BoxResponse;
use async_trait::async_trait;
use gqlx_core::Operation;
use std::sync::Arc;

/// Carries one operation and hands back its response.
///
/// Implementations only issue the call; results (and transport failures)
/// arrive through the returned response.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request(&self, operation: Operation) -> BoxResponse;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn request(&self, operation: Operation) -> BoxResponse {
        (**self).request(operation).await
    }
}
