//! Broker request loop.
//!
//! Listens on two subjects:
//! - `{subject}`: queries and mutations, answered with one encoded result
//! - `{subject}.subscribe`: subscriptions, answered with the name of a
//!   freshly opened stream (or with an error result if refused)

use crate::executor::Executor;
use crate::streams::{Streams, StreamsConfig};
use gqlx_broker::{heartbeat, Broker, Message, Subscription};
use gqlx_core::{Codec, JsonCodec, OperationKind, OperationResult, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Subject to answer requests on.
    pub subject: String,
    pub streams: StreamsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            subject: "graphql".to_string(),
            streams: StreamsConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn streams(mut self, streams: StreamsConfig) -> Self {
        self.streams = streams;
        self
    }
}

struct Shared<B, E> {
    broker: Arc<B>,
    executor: E,
    streams: Streams<B>,
    codec: Arc<dyn Codec>,
}

/// Serves an [`Executor`] over a [`Broker`].
///
/// ```ignore
/// let server = BrokerServer::bind(broker, executor, ServerConfig::new("graphql")).await?;
/// tokio::spawn(server.serve(shutdown.clone()));
/// ```
pub struct BrokerServer<B, E> {
    shared: Arc<Shared<B, E>>,
    subject: String,
    requests: Subscription,
    subscribes: Subscription,
}

impl<B: Broker, E: Executor> BrokerServer<B, E> {
    /// Subscribes to the request subjects. Requests sent after this returns
    /// are queued until [`BrokerServer::serve`] runs.
    pub async fn bind(broker: B, executor: E, config: ServerConfig) -> Result<Self> {
        Self::bind_with_codec(broker, executor, config, Arc::new(JsonCodec)).await
    }

    pub async fn bind_with_codec(
        broker: B,
        executor: E,
        config: ServerConfig,
        codec: Arc<dyn Codec>,
    ) -> Result<Self> {
        let broker = Arc::new(broker);
        let requests = broker.subscribe(&config.subject).await?;
        let subscribes = broker
            .subscribe(&heartbeat::subscribe_subject(&config.subject))
            .await?;
        let streams = Streams::with_codec(broker.clone(), config.streams, codec.clone());

        Ok(Self {
            shared: Arc::new(Shared {
                broker,
                executor,
                streams,
                codec,
            }),
            subject: config.subject,
            requests,
            subscribes,
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Returns a handle to the server's stream registry.
    pub fn streams(&self) -> Streams<B> {
        self.shared.streams.clone()
    }

    /// Answers requests until `shutdown` fires, then closes every stream.
    pub async fn serve(mut self, shutdown: CancellationToken) {
        info!(subject = %self.subject, "serving");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                message = self.requests.next() => {
                    let Some(message) = message else { break };
                    tokio::spawn(self.shared.clone().handle_request(message));
                }
                message = self.subscribes.next() => {
                    let Some(message) = message else { break };
                    tokio::spawn(self.shared.clone().handle_subscribe(message));
                }
            }
        }
        debug!(subject = %self.subject, "server stopped");
        self.shared.streams.shutdown();
    }
}

impl<B: Broker, E: Executor> Shared<B, E> {
    async fn handle_request(self: Arc<Self>, message: Message) {
        let Some(reply) = message.reply.as_deref() else {
            warn!(subject = %message.subject, "dropping request without reply subject");
            return;
        };
        let result = match self.codec.decode_operation(&message.payload) {
            Ok(operation) => {
                debug!(kind = ?operation.kind, name = ?operation.name, "executing");
                self.executor.execute(operation).await
            }
            Err(e) => OperationResult::error((&e).into()),
        };
        self.reply(reply, &result).await;
    }

    async fn handle_subscribe(self: Arc<Self>, message: Message) {
        let Some(reply) = message.reply.as_deref() else {
            warn!(subject = %message.subject, "dropping subscribe without reply subject");
            return;
        };
        let result = match self.open(&message).await {
            Ok(name) => {
                let mut result = OperationResult::default();
                result.extensions.insert(
                    heartbeat::STREAM_EXTENSION.to_string(),
                    serde_json::Value::String(name),
                );
                result
            }
            Err(e) => {
                debug!(error = %e, "subscription refused");
                OperationResult::error((&e).into())
            }
        };
        self.reply(reply, &result).await;
    }

    async fn open(&self, message: &Message) -> Result<String> {
        let operation = self
            .codec
            .decode_operation(&message.payload)?
            .with_kind(OperationKind::Subscription);
        debug!(name = ?operation.name, "subscribing");
        let results = self.executor.subscribe(operation).await?;
        self.streams.open(results).await
    }

    async fn reply(&self, subject: &str, result: &OperationResult) {
        let body = match self.codec.encode_result(result) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to encode reply");
                return;
            }
        };
        if let Err(e) = self.broker.publish(subject, body).await {
            warn!(%subject, error = %e, "failed to publish reply");
        }
    }
}
