//! Heartbeat-verified subscription streams.
//!
//! Every stream owns a delivery subject (`{id}-stream`) and a heartbeat
//! subject (`{id}-stream-heartbeat`). The stream stays idle until the client
//! sends its first probe, then three activities run under one close token:
//! - a responder answering the client's probes with `pong`
//! - a probe asking the client for `pong` every heartbeat interval
//! - the producer publishing executor results on the delivery subject
//!
//! Whichever ends first tears the others down. Teardown removes the stream
//! from the registry and publishes `close` on the heartbeat subject.

use crate::executor::ResultStream;
use bytes::Bytes;
use futures_util::stream::StreamExt;
use gqlx_broker::{heartbeat, Broker, Message, Subscription};
use gqlx_core::{Codec, Error, ErrorCode, GraphQLError, JsonCodec, OperationResult, Result};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Stream registry configuration.
#[derive(Debug, Clone)]
pub struct StreamsConfig {
    /// Interval between liveness probes sent to the client.
    pub heartbeat_interval: Duration,
    /// Timeout of a probe, and of the wait for the client's first probe.
    pub request_timeout: Duration,
    /// Streams without liveness for longer than this are force-closed.
    pub stale_after: Duration,
    /// Interval of the staleness sweep.
    pub sweep_interval: Duration,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            stale_after: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl StreamsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Last confirmed liveness of a stream.
#[derive(Debug, Clone)]
struct Liveness(Arc<Mutex<Instant>>);

impl Liveness {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    fn lock(&self) -> MutexGuard<'_, Instant> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self.lock() = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.lock().elapsed()
    }
}

struct Entry {
    close: CancellationToken,
    created_at: Instant,
    liveness: Liveness,
}

struct Inner<B> {
    broker: Arc<B>,
    codec: Arc<dyn Codec>,
    config: StreamsConfig,
    streams: Mutex<FxHashMap<String, Entry>>,
    shutdown: CancellationToken,
}

impl<B> Inner<B> {
    fn streams(&self) -> MutexGuard<'_, FxHashMap<String, Entry>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry of live subscription streams.
///
/// Clones share the registry. The staleness sweep runs until
/// [`Streams::shutdown`] or until the last clone is dropped.
pub struct Streams<B> {
    inner: Arc<Inner<B>>,
}

impl<B> Clone for Streams<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Broker> Streams<B> {
    /// Creates a registry and starts its sweep. Must be called within a
    /// tokio runtime.
    pub fn new(broker: Arc<B>, config: StreamsConfig) -> Self {
        Self::with_codec(broker, config, Arc::new(JsonCodec))
    }

    pub fn with_codec(broker: Arc<B>, config: StreamsConfig, codec: Arc<dyn Codec>) -> Self {
        let inner = Arc::new(Inner {
            broker,
            codec,
            config,
            streams: Mutex::new(FxHashMap::default()),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(sweep_loop(Arc::downgrade(&inner)));
        Self { inner }
    }

    pub fn config(&self) -> &StreamsConfig {
        &self.inner.config
    }

    /// Registers a stream fed by `results` and returns its delivery subject.
    ///
    /// The heartbeat subject is subscribed before this returns, so the
    /// client can probe as soon as it learns the name.
    pub async fn open(&self, results: ResultStream) -> Result<String> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::closed("stream registry is shut down"));
        }

        let name = heartbeat::stream_subject(&uuid::Uuid::new_v4().to_string());
        let beats = self
            .inner
            .broker
            .subscribe(&heartbeat::heartbeat_subject(&name))
            .await?;

        let close = self.inner.shutdown.child_token();
        let liveness = Liveness::new();
        self.inner.streams().insert(
            name.clone(),
            Entry {
                close: close.clone(),
                created_at: Instant::now(),
                liveness: liveness.clone(),
            },
        );
        debug!(stream = %name, "stream opened");

        let stream = Stream {
            inner: self.inner.clone(),
            heartbeat: heartbeat::heartbeat_subject(&name),
            name: name.clone(),
            close,
            liveness,
        };
        tokio::spawn(stream.run(beats, results));

        Ok(name)
    }

    /// Number of registered streams.
    pub fn len(&self) -> usize {
        self.inner.streams().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.streams().contains_key(name)
    }

    /// Age of a registered stream.
    pub fn age(&self, name: &str) -> Option<Duration> {
        self.inner
            .streams()
            .get(name)
            .map(|entry| entry.created_at.elapsed())
    }

    /// Signals a stream to close. Returns false for unknown names.
    pub fn close(&self, name: &str) -> bool {
        match self.inner.streams().get(name) {
            Some(entry) => {
                entry.close.cancel();
                true
            }
            None => false,
        }
    }

    /// Closes every stream idle for longer than `stale_after`. Returns how
    /// many were signalled.
    pub fn sweep(&self) -> usize {
        sweep(&self.inner)
    }

    /// Closes every stream and stops the sweep. Streams opened afterwards
    /// are refused.
    pub fn shutdown(&self) {
        debug!(streams = self.len(), "shutting down stream registry");
        self.inner.shutdown.cancel();
    }
}

fn sweep<B>(inner: &Inner<B>) -> usize {
    let stale_after = inner.config.stale_after;
    let streams = inner.streams();
    let mut closed = 0;
    for (name, entry) in streams.iter() {
        let idle = entry.liveness.idle();
        if idle > stale_after && !entry.close.is_cancelled() {
            warn!(stream = %name, idle_ms = idle.as_millis(), "closing stale stream");
            entry.close.cancel();
            closed += 1;
        }
    }
    closed
}

async fn sweep_loop<B>(inner: Weak<Inner<B>>) {
    let (interval, shutdown) = match inner.upgrade() {
        Some(inner) => (inner.config.sweep_interval, inner.shutdown.clone()),
        None => return,
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        sweep(&inner);
    }
}

/// Why a stream ended.
#[derive(Debug)]
enum Ending {
    Closed,
    ClientClosed,
    NotAttached,
    Heartbeat(Error),
    ProducerDone,
    ProducerPanicked(String),
}

/// One running stream.
struct Stream<B> {
    inner: Arc<Inner<B>>,
    name: String,
    heartbeat: String,
    close: CancellationToken,
    liveness: Liveness,
}

impl<B: Broker> Stream<B> {
    async fn run(self, mut beats: Subscription, results: ResultStream) {
        let ending = match self.attach(&mut beats).await {
            Ok(()) => self.serve(&mut beats, results).await,
            Err(ending) => ending,
        };
        self.teardown(ending).await;
    }

    /// Waits for the client's first probe.
    async fn attach(&self, beats: &mut Subscription) -> std::result::Result<(), Ending> {
        let first = tokio::select! {
            () = self.close.cancelled() => return Err(Ending::Closed),
            beat = tokio::time::timeout(self.inner.config.request_timeout, beats.next()) => beat,
        };
        match first {
            Ok(Some(beat)) => match self.on_beat(beat).await {
                None => {
                    debug!(stream = %self.name, "client attached");
                    Ok(())
                }
                Some(ending) => Err(ending),
            },
            Ok(None) => Err(Ending::Heartbeat(Error::closed(
                "heartbeat subscription ended",
            ))),
            Err(_) => Err(Ending::NotAttached),
        }
    }

    async fn serve(&self, beats: &mut Subscription, results: ResultStream) -> Ending {
        let mut producer = tokio::spawn(produce(
            self.inner.broker.clone(),
            self.inner.codec.clone(),
            self.name.clone(),
            results,
            self.close.clone(),
        ));
        let abort = producer.abort_handle();

        let ending = tokio::select! {
            () = self.close.cancelled() => Ending::Closed,
            ending = self.respond(beats) => ending,
            err = self.probe() => Ending::Heartbeat(err),
            joined = &mut producer => match joined {
                Ok(()) => Ending::ProducerDone,
                Err(e) => producer_failure(e),
            },
        };

        abort.abort();
        ending
    }

    /// Answers the client's probes until the heartbeat subject says otherwise.
    async fn respond(&self, beats: &mut Subscription) -> Ending {
        loop {
            let Some(beat) = beats.next().await else {
                return Ending::Heartbeat(Error::closed("heartbeat subscription ended"));
            };
            if let Some(ending) = self.on_beat(beat).await {
                return ending;
            }
        }
    }

    async fn on_beat(&self, beat: Message) -> Option<Ending> {
        match (&beat.payload[..], beat.reply) {
            (heartbeat::PING, Some(reply)) => {
                trace!(stream = %self.name, "answering probe");
                self.liveness.touch();
                if let Err(e) = self.inner.broker.publish(&reply, heartbeat::pong()).await {
                    warn!(stream = %self.name, error = %e, "failed to answer probe");
                }
                None
            }
            (heartbeat::CLOSE, _) => Some(Ending::ClientClosed),
            (other, _) => Some(Ending::Heartbeat(Error::protocol(format!(
                "unexpected heartbeat payload: {}",
                String::from_utf8_lossy(other)
            )))),
        }
    }

    /// Probes the client until a probe fails.
    async fn probe(&self) -> Error {
        let config = &self.inner.config;
        let mut ticker = tokio::time::interval(config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self
                .inner
                .broker
                .request(&self.heartbeat, heartbeat::ping(), config.request_timeout)
                .await
            {
                Ok(reply) if reply == heartbeat::PONG => self.liveness.touch(),
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

    async fn teardown(self, ending: Ending) {
        // Only the task that removes the entry publishes.
        if self.inner.streams().remove(&self.name).is_none() {
            return;
        }
        self.close.cancel();

        match &ending {
            Ending::ProducerPanicked(message) => {
                error!(stream = %self.name, %message, "subscription producer panicked");
                let result = OperationResult::error(
                    GraphQLError::new(format!("subscription failed: {message}"))
                        .with_code(ErrorCode::InternalError.as_str()),
                );
                match self.inner.codec.encode_result(&result) {
                    Ok(body) => self.publish(&self.name, body).await,
                    Err(e) => warn!(stream = %self.name, error = %e, "failed to encode panic"),
                }
            }
            Ending::Heartbeat(err) => {
                warn!(stream = %self.name, error = %err, "stream heartbeat failed");
            }
            ending => debug!(stream = %self.name, ?ending, "stream ended"),
        }

        self.publish(&self.heartbeat, heartbeat::close()).await;
    }

    async fn publish(&self, subject: &str, body: Bytes) {
        if let Err(e) = self.inner.broker.publish(subject, body).await {
            debug!(%subject, error = %e, "publish failed during teardown");
        }
    }
}

/// Publishes results until the executor stops or the stream closes.
async fn produce<B: Broker>(
    broker: Arc<B>,
    codec: Arc<dyn Codec>,
    subject: String,
    mut results: ResultStream,
    close: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            () = close.cancelled() => return,
            result = results.next() => result,
        };
        let Some(result) = result else {
            return;
        };
        let body = match codec.encode_result(&result) {
            Ok(body) => body,
            Err(e) => {
                warn!(stream = %subject, error = %e, "dropping unencodable result");
                continue;
            }
        };
        if let Err(e) = broker.publish(&subject, body).await {
            warn!(stream = %subject, error = %e, "failed to publish result");
            return;
        }
    }
}

fn producer_failure(err: JoinError) -> Ending {
    if err.is_panic() {
        Ending::ProducerPanicked(panic_message(&*err.into_panic()))
    } else {
        Ending::ProducerDone
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
