//! Message broker seam for gqlx.
//!
//! The broker transport and the server-side stream registry only need two
//! capabilities from a message broker:
//! - `request(subject, body) -> reply`, synchronous and timeout-bounded
//! - `publish(subject, body)` / `subscribe(subject)`, asynchronous and best-effort
//!
//! [`Broker`] captures exactly that. [`MemoryBroker`] is an in-process
//! implementation used by tests and the demo.

pub mod heartbeat;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::FutureExt;
use futures_util::stream::{BoxStream, StreamExt};
use gqlx_core::Result;
use std::time::Duration;

pub use memory::MemoryBroker;

/// A message delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub subject: String,
    pub payload: Bytes,
    /// Subject to publish a reply on, set for request/reply traffic.
    pub reply: Option<String>,
}

/// Request/reply and publish/subscribe primitives.
///
/// Implementations must not deliver a connection's own publishes back to
/// its own subscriptions (NATS `no_echo`). Both the client and the server
/// listen and probe on the same heartbeat subject, so echo would make every
/// peer answer its own liveness probes.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Publishes a message. Delivery is best-effort.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Sends a request and waits for the first reply.
    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<Bytes>;

    /// Subscribes to a subject. Dropping the subscription unsubscribes.
    async fn subscribe(&self, subject: &str) -> Result<Subscription>;
}

/// A live subscription.
pub struct Subscription {
    subject: String,
    messages: BoxStream<'static, Message>,
    _interest: Option<Box<dyn Send + Sync>>,
}

impl Subscription {
    /// Wraps a message stream. `interest` is dropped together with the
    /// subscription and can be used to release broker-side state.
    pub fn new(
        subject: impl Into<String>,
        messages: BoxStream<'static, Message>,
        interest: Option<Box<dyn Send + Sync>>,
    ) -> Self {
        Self {
            subject: subject.into(),
            messages,
            _interest: interest,
        }
    }

    /// Returns the subscribed subject.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Waits for the next message. Returns `None` once the broker closed the
    /// subscription.
    pub async fn next(&mut self) -> Option<Message> {
        self.messages.next().await
    }

    /// Returns a message that is already buffered, without waiting.
    pub fn try_next(&mut self) -> Option<Message> {
        self.messages.next().now_or_never().flatten()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}
