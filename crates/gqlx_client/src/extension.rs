//! Request interceptors.
//!
//! Extensions are registered once on a client. For every request the chain
//! is rebuilt from the registered list, innermost first, so the first
//! registered extension sees the operation first and the response last.

use crate::response::BoxResponse;
use crate::transport::Transport;
use futures_util::future::{BoxFuture, FutureExt};
use gqlx_core::Operation;
use std::sync::Arc;
use tracing::warn;

/// The rest of the chain, ending in the transport call.
pub type Next = Arc<dyn Fn(Operation) -> BoxFuture<'static, BoxResponse> + Send + Sync>;

/// An interceptor wrapped around every request.
///
/// Implementations may rewrite the operation before calling `next` and may
/// wrap the returned response, but must not mutate shared state: a retried
/// send can run concurrently with the original.
pub trait AroundRequest: Send + Sync + 'static {
    /// Identity used to reject double registration.
    fn name(&self) -> &str;

    fn around_request(&self, operation: Operation, next: Next) -> BoxFuture<'static, BoxResponse>;
}

/// Closure-backed [`AroundRequest`].
pub struct AroundRequestFn<F> {
    name: String,
    f: F,
}

impl<F> AroundRequestFn<F>
where
    F: Fn(Operation, Next) -> BoxFuture<'static, BoxResponse> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> AroundRequest for AroundRequestFn<F>
where
    F: Fn(Operation, Next) -> BoxFuture<'static, BoxResponse> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn around_request(&self, operation: Operation, next: Next) -> BoxFuture<'static, BoxResponse> {
        (self.f)(operation, next)
    }
}

/// Registered extensions, one explicit list per capability.
#[derive(Clone, Default)]
pub struct Extensions {
    around_request: Vec<Arc<dyn AroundRequest>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an interceptor.
    ///
    /// Registering two interceptors with the same name is a programming
    /// error: it panics in debug builds and is ignored otherwise.
    pub fn push_around_request(&mut self, extension: Arc<dyn AroundRequest>) {
        if self
            .around_request
            .iter()
            .any(|e| e.name() == extension.name())
        {
            if cfg!(debug_assertions) {
                panic!("extension `{}` registered twice", extension.name());
            }
            warn!(name = extension.name(), "extension registered twice, ignoring");
            return;
        }
        self.around_request.push(extension);
    }

    /// Number of registered interceptors.
    pub fn len(&self) -> usize {
        self.around_request.len()
    }

    pub fn is_empty(&self) -> bool {
        self.around_request.is_empty()
    }

    /// Builds the chain for one request, terminating in `transport`.
    pub fn chain(&self, transport: Arc<dyn Transport>) -> Next {
        let terminal: Next = Arc::new(move |operation: Operation| {
            let transport = transport.clone();
            async move { transport.request(operation).await }.boxed()
        });

        self.around_request
            .iter()
            .rev()
            .fold(terminal, |next, extension| {
                let extension = extension.clone();
                let wrapped: Next = Arc::new(move |operation: Operation| {
                    extension.around_request(operation, next.clone())
                });
                wrapped
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::{Response, SingleResponse};
    use async_trait::async_trait;
    use gqlx_core::OperationResult;
    use std::sync::Mutex;

    /// Echoes the `trail` extension back as data.
    struct Echo;

    #[async_trait]
    impl Transport for Echo {
        async fn request(&self, operation: Operation) -> BoxResponse {
            let trail = operation.extensions.get("trail").cloned().unwrap_or_default();
            Arc::new(SingleResponse::new(OperationResult::data(trail)))
        }
    }

    fn tagging(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<dyn AroundRequest> {
        Arc::new(AroundRequestFn::new(name, move |operation: Operation, next: Next| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("{name}:request"));
                let mut trail = operation
                    .extensions
                    .get("trail")
                    .and_then(|t| t.as_array().cloned())
                    .unwrap_or_default();
                trail.push(serde_json::json!(name));
                let response = next(operation.with_extension("trail", trail.into())).await;
                log.lock().unwrap().push(format!("{name}:response"));
                response
            }
            .boxed()
        }))
    }

    #[tokio::test]
    async fn test_first_registered_runs_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut extensions = Extensions::new();
        extensions.push_around_request(tagging("outer", log.clone()));
        extensions.push_around_request(tagging("inner", log.clone()));

        let next = extensions.chain(Arc::new(Echo));
        let response = next(Operation::query("{ x }")).await;

        assert_eq!(
            response.next().await.unwrap().data,
            Some(serde_json::json!(["outer", "inner"]))
        );
        assert_eq!(
            *log.lock().unwrap(),
            ["outer:request", "inner:request", "inner:response", "outer:response"]
        );
    }

    #[tokio::test]
    async fn test_empty_chain_calls_transport() {
        let next = Extensions::new().chain(Arc::new(Echo));
        let response = next(Operation::query("{ x }")).await;
        assert!(response.next().await.is_some());
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_duplicate_registration_ignored() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut extensions = Extensions::new();
        extensions.push_around_request(tagging("apq", log.clone()));
        extensions.push_around_request(tagging("apq", log));
        assert_eq!(extensions.len(), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_registration_panics() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut extensions = Extensions::new();
        extensions.push_around_request(tagging("apq", log.clone()));
        extensions.push_around_request(tagging("apq", log));
    }
}
