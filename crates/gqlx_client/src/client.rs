//! High-level client.

use crate::extension::{AroundRequest, Extensions};
use crate::response::BoxResponse;
use crate::transport::Transport;
use gqlx_core::{Error, ErrorCode, Operation, OperationKind, OperationResult, Result};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Sends operations through the registered extensions to one transport.
///
/// ```ignore
/// let transport = SplitTransport::by_kind(
///     Arc::new(WsTransport::connect(WsConfig::new("ws://localhost:4000/graphql"))),
///     Arc::new(HttpTransport::new(HttpConfig::new("http://localhost:4000/graphql"))),
/// );
/// let client = Client::new(transport).with_extension(PersistedQuery::new());
///
/// let room: RoomData = client.query(Operation::query("{ room(name: \"test\") { name } }")).await?;
/// ```
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
    extensions: Extensions,
}

impl Client {
    pub fn new(transport: impl Transport) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    pub fn from_arc(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            extensions: Extensions::new(),
        }
    }

    /// Registers a request interceptor. The first registered sees each
    /// request first.
    #[must_use]
    pub fn with_extension(mut self, extension: impl AroundRequest) -> Self {
        self.extensions.push_around_request(Arc::new(extension));
        self
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Sends an operation. Cancelling `cancel` closes the returned response
    /// with [`ErrorCode::Cancelled`].
    pub async fn execute(&self, cancel: &CancellationToken, operation: Operation) -> BoxResponse {
        debug!(kind = ?operation.kind, name = ?operation.name, "executing operation");
        let response = self.extensions.chain(self.transport.clone())(operation).await;

        let watched = response.clone();
        let cancel = cancel.clone();
        let done = response.done();
        tokio::spawn(async move {
            tokio::select! {
                () = done.cancelled() => {}
                () = cancel.cancelled() => watched.close_with_error(Error::cancelled()),
            }
        });

        response
    }

    /// Runs a query and decodes its data.
    pub async fn query<T: DeserializeOwned>(&self, operation: Operation) -> Result<T> {
        self.single(operation.with_kind(OperationKind::Query)).await
    }

    /// Runs a mutation and decodes its data.
    pub async fn mutation<T: DeserializeOwned>(&self, operation: Operation) -> Result<T> {
        self.single(operation.with_kind(OperationKind::Mutation)).await
    }

    async fn single<T: DeserializeOwned>(&self, operation: Operation) -> Result<T> {
        // Dropping this future mid-flight closes the response.
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();

        let response = self.execute(&cancel, operation).await;
        let result = response.next().await;
        let err = response.err();
        response.close();

        if let Some(err) = err {
            return Err(err);
        }
        result
            .ok_or_else(|| Error::new(ErrorCode::NoData, "operation produced no result"))?
            .decode()
    }

    /// Starts a subscription.
    pub async fn subscription(&self, operation: Operation) -> Subscription {
        let cancel = CancellationToken::new();
        let response = self
            .execute(&cancel, operation.with_kind(OperationKind::Subscription))
            .await;
        Subscription { response }
    }
}

/// A running subscription. Dropping it closes the underlying response.
pub struct Subscription {
    response: BoxResponse,
}

impl Subscription {
    /// Waits for the next result. `None` once the subscription ended; see
    /// [`Subscription::err`].
    pub async fn next(&self) -> Option<OperationResult> {
        self.response.next().await
    }

    /// Waits for the next result and decodes its data.
    pub async fn next_as<T: DeserializeOwned>(&self) -> Option<Result<T>> {
        Some(self.next().await?.decode())
    }

    pub fn err(&self) -> Option<Error> {
        self.response.err()
    }

    pub fn close(&self) {
        self.response.close();
    }

    pub fn response(&self) -> &BoxResponse {
        &self.response
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.response.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::{ChanResponse, Response, SingleResponse};
    use async_trait::async_trait;
    use gqlx_core::GraphQLError;
    use serde::Deserialize;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Deserialize)]
    struct Room {
        name: String,
    }

    #[derive(Debug, Deserialize)]
    struct RoomData {
        room: Room,
    }

    struct Fixed(OperationResult);

    #[async_trait]
    impl Transport for Fixed {
        async fn request(&self, _operation: Operation) -> BoxResponse {
            Arc::new(SingleResponse::new(self.0.clone()))
        }
    }

    /// Hands out channel responses and keeps the last one for inspection.
    #[derive(Clone, Default)]
    struct Streaming {
        last: Arc<Mutex<Option<Arc<ChanResponse>>>>,
    }

    #[async_trait]
    impl Transport for Streaming {
        async fn request(&self, _operation: Operation) -> BoxResponse {
            let response = Arc::new(ChanResponse::new());
            *self.last.lock().unwrap() = Some(response.clone());
            response
        }
    }

    impl Streaming {
        fn last(&self) -> Arc<ChanResponse> {
            self.last.lock().unwrap().clone().unwrap()
        }
    }

    #[tokio::test]
    async fn test_query_decodes_data() {
        let client = Client::new(Fixed(OperationResult::data(
            serde_json::json!({ "room": { "name": "test" } }),
        )));
        let data: RoomData = client
            .query(Operation::new("{ room(name: \"test\") { name } }"))
            .await
            .unwrap();
        assert_eq!(data.room.name, "test");
    }

    #[tokio::test]
    async fn test_query_result_errors_fail() {
        let client = Client::new(Fixed(OperationResult::error(
            GraphQLError::new("denied").with_code("FORBIDDEN"),
        )));
        let err = client
            .query::<RoomData>(Operation::new("{ room { name } }"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ExecutionError);
    }

    #[tokio::test]
    async fn test_transport_error_is_returned() {
        struct Down;

        #[async_trait]
        impl Transport for Down {
            async fn request(&self, _operation: Operation) -> BoxResponse {
                Arc::new(SingleResponse::failed(Error::network("down")))
            }
        }

        let err = Client::new(Down)
            .mutation::<RoomData>(Operation::new("mutation { post }"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NetworkError);
    }

    #[tokio::test]
    async fn test_cancel_closes_response() {
        let transport = Streaming::default();
        let client = Client::new(transport.clone());
        let cancel = CancellationToken::new();

        let response = client
            .execute(&cancel, Operation::subscription("subscription { tick }"))
            .await;
        cancel.cancel();

        assert!(response.next().await.is_none());
        assert_eq!(response.err().unwrap().code, ErrorCode::Cancelled);
        assert!(transport.last().is_done());
    }

    #[tokio::test]
    async fn test_dropping_subscription_closes() {
        let transport = Streaming::default();
        let client = Client::new(transport.clone());

        let subscription = client
            .subscription(Operation::new("subscription { tick }"))
            .await;
        let upstream = transport.last();
        upstream.send(OperationResult::data(serde_json::json!(1))).await;
        assert!(subscription.next().await.is_some());

        drop(subscription);
        tokio::time::timeout(Duration::from_secs(1), upstream.done().cancelled())
            .await
            .expect("upstream closed");
    }
}
