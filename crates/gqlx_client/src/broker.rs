//! Transport over a message broker.
//!
//! Queries and mutations are a single `request` on the configured subject.
//! Subscriptions ask the server for a stream, then read results from the
//! stream's delivery subject while both sides probe each other on the
//! paired heartbeat subject.

use crate::response::{BoxResponse, ChanResponse, Response, SingleResponse};
use crate::transport::Transport;
use async_trait::async_trait;
use gqlx_broker::{heartbeat, Broker, Message, Subscription};
use gqlx_core::{Codec, Error, ErrorCode, JsonCodec, Operation, OperationResult, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Broker transport configuration.
#[derive(Debug, Clone)]
pub struct BrokerTransportConfig {
    /// Subject the server answers requests on.
    pub subject: String,
    /// Timeout of every request/reply exchange, probes included.
    pub request_timeout: Duration,
    /// Interval between liveness probes sent to the server.
    pub heartbeat_interval: Duration,
    /// Results buffered per subscription.
    pub buffer: usize,
}

impl Default for BrokerTransportConfig {
    fn default() -> Self {
        Self {
            subject: "graphql".to_string(),
            request_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(1),
            buffer: 16,
        }
    }
}

impl BrokerTransportConfig {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }
}

/// Carries operations over a [`Broker`].
pub struct BrokerTransport<B> {
    broker: Arc<B>,
    config: BrokerTransportConfig,
    codec: Arc<dyn Codec>,
}

impl<B: Broker> BrokerTransport<B> {
    pub fn new(broker: B, config: BrokerTransportConfig) -> Self {
        Self {
            broker: Arc::new(broker),
            config,
            codec: Arc::new(JsonCodec),
        }
    }

    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    async fn call(&self, subject: &str, operation: &Operation) -> Result<OperationResult> {
        let body = self.codec.encode_operation(operation)?;
        let reply = self
            .broker
            .request(subject, body, self.config.request_timeout)
            .await?;
        self.codec.decode_result(&reply)
    }

    async fn execute(&self, operation: Operation) -> BoxResponse {
        match self.call(&self.config.subject, &operation).await {
            Ok(result) if result.is_empty() => Arc::new(SingleResponse::failed(Error::new(
                ErrorCode::NoData,
                "reply carried neither data nor errors",
            ))),
            Ok(result) => Arc::new(SingleResponse::new(result)),
            Err(e) => Arc::new(SingleResponse::failed(e)),
        }
    }

    async fn subscribe(&self, operation: Operation) -> BoxResponse {
        let subject = heartbeat::subscribe_subject(&self.config.subject);
        let reply = match self.call(&subject, &operation).await {
            Ok(reply) => reply,
            Err(e) => return Arc::new(SingleResponse::failed(e)),
        };

        // A refused subscription comes back as a plain result.
        let Some(stream) = reply
            .extensions
            .get(heartbeat::STREAM_EXTENSION)
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
        else {
            return Arc::new(SingleResponse::new(reply));
        };

        match self.attach(&stream).await {
            Ok(response) => response,
            Err(e) => Arc::new(SingleResponse::failed(e)),
        }
    }

    async fn attach(&self, stream: &str) -> Result<BoxResponse> {
        let heartbeat_subject = heartbeat::heartbeat_subject(stream);
        let delivery = self.broker.subscribe(stream).await?;
        let beats = self.broker.subscribe(&heartbeat_subject).await?;
        debug!(%stream, "attached to stream");

        let response = Arc::new(ChanResponse::with_capacity(self.config.buffer));
        let worker = StreamWorker {
            broker: self.broker.clone(),
            codec: self.codec.clone(),
            response: response.clone(),
            heartbeat_subject,
            interval: self.config.heartbeat_interval,
            timeout: self.config.request_timeout,
        };
        tokio::spawn(worker.run(delivery, beats));

        Ok(response)
    }
}

#[async_trait]
impl<B: Broker> Transport for BrokerTransport<B> {
    async fn request(&self, operation: Operation) -> BoxResponse {
        if operation.kind.is_streaming() {
            self.subscribe(operation).await
        } else {
            self.execute(operation).await
        }
    }
}

/// Client half of one broker stream.
struct StreamWorker<B> {
    broker: Arc<B>,
    codec: Arc<dyn Codec>,
    response: Arc<ChanResponse>,
    heartbeat_subject: String,
    interval: Duration,
    timeout: Duration,
}

impl<B: Broker> StreamWorker<B> {
    async fn run(self, mut delivery: Subscription, beats: Subscription) {
        // Heartbeats run in their own task so a consumer that stops reading
        // does not stop the client from answering the server.
        let mut keep_alive = tokio::spawn(keep_alive(
            self.broker.clone(),
            self.heartbeat_subject.clone(),
            beats,
            self.interval,
            self.timeout,
        ));
        self.pump(&mut delivery, &mut keep_alive).await;
        keep_alive.abort();
    }

    /// Moves results from the delivery subject into the response until the
    /// stream ends on either side.
    async fn pump(
        &self,
        delivery: &mut Subscription,
        keep_alive: &mut JoinHandle<KeepAliveEnd>,
    ) {
        let done = self.response.done();
        loop {
            tokio::select! {
                biased;
                () = done.cancelled() => {
                    debug!(subject = %self.heartbeat_subject, "consumer closed stream");
                    self.publish_close().await;
                    return;
                }
                message = delivery.next() => {
                    let Some(message) = message else {
                        self.response
                            .close_with_error(Error::closed("delivery subscription ended"));
                        return;
                    };
                    if !self.deliver(&message).await {
                        self.publish_close().await;
                        return;
                    }
                }
                ended = &mut *keep_alive => {
                    match ended {
                        Ok(KeepAliveEnd::ServerClosed) => {
                            debug!(subject = %self.heartbeat_subject, "server closed stream");
                            while let Some(message) = delivery.try_next() {
                                if !self.deliver(&message).await {
                                    break;
                                }
                            }
                            self.response.close_channel();
                        }
                        Ok(KeepAliveEnd::Failed(err)) => {
                            warn!(
                                subject = %self.heartbeat_subject,
                                error = %err,
                                "server heartbeat failed"
                            );
                            self.publish_close().await;
                            self.response.close_with_error(err);
                        }
                        Err(e) => {
                            self.publish_close().await;
                            let err = Error::internal(format!("heartbeat task failed: {e}"));
                            self.response.close_with_error(err);
                        }
                    }
                    return;
                }
            }
        }
    }

    async fn deliver(&self, message: &Message) -> bool {
        let result = match self.codec.decode_result(&message.payload) {
            Ok(result) => result,
            Err(e) => OperationResult::error((&e).into()),
        };
        self.response.send(result).await
    }

    async fn publish_close(&self) {
        if let Err(e) = self
            .broker
            .publish(&self.heartbeat_subject, heartbeat::close())
            .await
        {
            debug!(error = %e, "failed to publish close");
        }
    }
}

/// How the heartbeat side of a stream ended.
#[derive(Debug)]
enum KeepAliveEnd {
    ServerClosed,
    Failed(Error),
}

/// Answers the server's probes and probes it back until the server closes
/// the stream or either direction fails.
async fn keep_alive<B: Broker>(
    broker: Arc<B>,
    subject: String,
    mut beats: Subscription,
    interval: Duration,
    timeout: Duration,
) -> KeepAliveEnd {
    let probe = probe(broker.clone(), subject.clone(), interval, timeout);
    tokio::pin!(probe);

    loop {
        tokio::select! {
            biased;
            beat = beats.next() => {
                let Some(beat) = beat else {
                    return KeepAliveEnd::Failed(Error::closed("heartbeat subscription ended"));
                };
                match (&beat.payload[..], &beat.reply) {
                    (heartbeat::PING, Some(reply)) => {
                        trace!(%subject, "answering probe");
                        if let Err(e) = broker.publish(reply, heartbeat::pong()).await {
                            warn!(error = %e, "failed to answer probe");
                        }
                    }
                    (heartbeat::CLOSE, _) => return KeepAliveEnd::ServerClosed,
                    (other, _) => {
                        let payload = String::from_utf8_lossy(other);
                        warn!(%subject, %payload, "unexpected heartbeat payload");
                        return KeepAliveEnd::Failed(Error::protocol(format!(
                            "unexpected heartbeat payload: {payload}"
                        )));
                    }
                }
            }
            err = &mut probe => return KeepAliveEnd::Failed(err),
        }
    }
}

/// Probes the server until a probe fails. The first probe goes out
/// immediately and tells the server the client is listening.
async fn probe<B: Broker>(
    broker: Arc<B>,
    subject: String,
    interval: Duration,
    timeout: Duration,
) -> Error {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match broker.request(&subject, heartbeat::ping(), timeout).await {
            Ok(reply) if reply == heartbeat::PONG => {}
            Ok(reply) => {
                return Error::new(
                    ErrorCode::HeartbeatFailed,
                    format!("unexpected probe reply: {}", String::from_utf8_lossy(&reply)),
                )
            }
            Err(e) => {
                return Error::new(ErrorCode::HeartbeatFailed, e.message.clone())
                    .with_extension("cause", e.code.as_str())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gqlx_broker::MemoryBroker;

    fn config() -> BrokerTransportConfig {
        BrokerTransportConfig::new("graphql")
            .request_timeout(Duration::from_millis(200))
            .heartbeat_interval(Duration::from_millis(50))
    }

    /// Answers every request on `subject` with `reply`.
    async fn answer(broker: MemoryBroker, subject: &str, reply: OperationResult) {
        let mut sub = broker.subscribe(subject).await.unwrap();
        tokio::spawn(async move {
            while let Some(message) = sub.next().await {
                let body = JsonCodec.encode_result(&reply).unwrap();
                broker.publish(&message.reply.unwrap(), body).await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_query_round_trip() {
        let bus = MemoryBroker::new();
        answer(
            bus.connect(),
            "graphql",
            OperationResult::data(serde_json::json!({ "room": { "name": "test" } })),
        )
        .await;

        let transport = BrokerTransport::new(bus.connect(), config());
        let response = transport.request(Operation::query("{ room { name } }")).await;

        let result = response.next().await.unwrap();
        assert_eq!(result.data.unwrap()["room"]["name"], "test");
        assert!(response.next().await.is_none());
        assert!(response.err().is_none());
    }

    #[tokio::test]
    async fn test_empty_reply_is_an_error() {
        let bus = MemoryBroker::new();
        answer(bus.connect(), "graphql", OperationResult::default()).await;

        let transport = BrokerTransport::new(bus.connect(), config());
        let response = transport.request(Operation::query("{ x }")).await;

        assert!(response.next().await.is_none());
        assert_eq!(response.err().unwrap().code, ErrorCode::NoData);
    }

    #[tokio::test]
    async fn test_no_server() {
        let transport = BrokerTransport::new(MemoryBroker::new(), config());
        let response = transport.request(Operation::query("{ x }")).await;

        assert!(response.next().await.is_none());
        assert_eq!(response.err().unwrap().code, ErrorCode::NoResponders);
    }

    #[tokio::test]
    async fn test_refused_subscription_is_a_result() {
        let bus = MemoryBroker::new();
        answer(
            bus.connect(),
            "graphql.subscribe",
            OperationResult::error(gqlx_core::GraphQLError::new("no such field")),
        )
        .await;

        let transport = BrokerTransport::new(bus.connect(), config());
        let response = transport.request(Operation::subscription("subscription { x }")).await;

        let result = response.next().await.unwrap();
        assert_eq!(result.errors[0].message, "no such field");
        assert!(response.next().await.is_none());
    }

    #[tokio::test]
    async fn test_paused_consumer_still_answers_probes() {
        let bus = MemoryBroker::new();
        let server = bus.connect();
        let mut accepted = OperationResult::default();
        accepted.extensions.insert(
            heartbeat::STREAM_EXTENSION.to_string(),
            serde_json::json!("s1-stream"),
        );
        answer(server.clone(), "graphql.subscribe", accepted).await;

        let beats_subject = heartbeat::heartbeat_subject("s1-stream");
        let mut beats = server.subscribe(&beats_subject).await.unwrap();
        let responder = server.clone();
        tokio::spawn(async move {
            while let Some(beat) = beats.next().await {
                if let (heartbeat::PING, Some(reply)) = (&beat.payload[..], beat.reply) {
                    responder.publish(&reply, heartbeat::pong()).await.unwrap();
                }
            }
        });

        let transport = BrokerTransport::new(bus.connect(), config().buffer(1));
        let response = transport
            .request(Operation::subscription("subscription { tick }"))
            .await;

        for i in 1..=5 {
            let body = JsonCodec
                .encode_result(&OperationResult::data(serde_json::json!({ "n": i })))
                .unwrap();
            server.publish("s1-stream", body).await.unwrap();
        }

        // Nobody reads for longer than a probe timeout.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let pong = server
            .request(&beats_subject, heartbeat::ping(), Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(pong, heartbeat::pong());

        for i in 1..=5 {
            assert_eq!(response.next().await.unwrap().data.unwrap()["n"], i);
        }
        server
            .publish(&beats_subject, heartbeat::close())
            .await
            .unwrap();
        assert!(response.next().await.is_none());
        assert!(response.err().is_none());
    }
}
