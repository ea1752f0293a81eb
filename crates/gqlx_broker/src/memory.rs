//! In-process broker.
//!
//! Every subject is a `broadcast` channel. Handles created with
//! [`MemoryBroker::connect`] share the same bus but have their own origin,
//! and never see their own publishes.

use crate::{Broker, Message, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use gqlx_core::{Error, ErrorCode, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{trace, warn};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Envelope {
    origin: u64,
    message: Message,
}

struct Topic {
    sender: broadcast::Sender<Envelope>,
    /// Live subscriptions per origin.
    interest: HashMap<u64, usize>,
}

impl Topic {
    fn responders_except(&self, origin: u64) -> usize {
        self.interest
            .iter()
            .filter(|(o, _)| **o != origin)
            .map(|(_, n)| *n)
            .sum()
    }
}

struct Bus {
    topics: Mutex<HashMap<String, Topic>>,
    capacity: usize,
    next_origin: AtomicU64,
}

impl Bus {
    fn topics(&self) -> std::sync::MutexGuard<'_, HashMap<String, Topic>> {
        self.topics.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// An in-process [`Broker`].
#[derive(Clone)]
pub struct MemoryBroker {
    bus: Arc<Bus>,
    origin: u64,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bus: Arc::new(Bus {
                topics: Mutex::new(HashMap::new()),
                capacity,
                next_origin: AtomicU64::new(1),
            }),
            origin: 0,
        }
    }

    /// Opens another connection to the same bus.
    pub fn connect(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            origin: self.bus.next_origin.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Number of subjects with at least one subscription.
    pub fn topic_count(&self) -> usize {
        self.bus.topics().len()
    }

    /// Returns true if a connection other than this one listens on `subject`.
    pub fn has_subscribers(&self, subject: &str) -> bool {
        self.bus
            .topics()
            .get(subject)
            .is_some_and(|topic| topic.responders_except(self.origin) > 0)
    }

    fn send(&self, message: Message) -> usize {
        let topics = self.bus.topics();
        let Some(topic) = topics.get(&message.subject) else {
            return 0;
        };
        let subject = message.subject.clone();
        match topic.sender.send(Envelope {
            origin: self.origin,
            message,
        }) {
            Ok(count) => {
                trace!(%subject, receivers = count, "published");
                count
            }
            Err(_) => 0,
        }
    }
}

/// Releases a subscription's interest when dropped.
struct Interest {
    bus: Weak<Bus>,
    subject: String,
    origin: u64,
}

impl Drop for Interest {
    fn drop(&mut self) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let mut topics = bus.topics();
        if let Some(topic) = topics.get_mut(&self.subject) {
            if let Some(count) = topic.interest.get_mut(&self.origin) {
                *count -= 1;
                if *count == 0 {
                    topic.interest.remove(&self.origin);
                }
            }
            if topic.interest.is_empty() {
                topics.remove(&self.subject);
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.send(Message {
            subject: subject.to_string(),
            payload,
            reply: None,
        });
        Ok(())
    }

    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<Bytes> {
        let no_responders = self
            .bus
            .topics()
            .get(subject)
            .map_or(true, |topic| topic.responders_except(self.origin) == 0);
        if no_responders {
            return Err(Error::new(
                ErrorCode::NoResponders,
                format!("No responders on {subject}"),
            ));
        }

        let inbox = format!("_INBOX.{}", uuid::Uuid::new_v4().simple());
        let mut replies = self.subscribe(&inbox).await?;
        self.send(Message {
            subject: subject.to_string(),
            payload,
            reply: Some(inbox),
        });

        match tokio::time::timeout(timeout, replies.next()).await {
            Ok(Some(reply)) => Ok(reply.payload),
            Ok(None) => Err(Error::broker(format!("Reply inbox for {subject} closed"))),
            Err(_) => Err(Error::timeout()),
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        let receiver = {
            let mut topics = self.bus.topics();
            let topic = topics.entry(subject.to_string()).or_insert_with(|| Topic {
                sender: broadcast::channel(self.bus.capacity).0,
                interest: HashMap::new(),
            });
            *topic.interest.entry(self.origin).or_insert(0) += 1;
            topic.sender.subscribe()
        };

        let origin = self.origin;
        let messages = stream::unfold(receiver, move |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) if envelope.origin == origin => continue,
                    Ok(envelope) => return Some((envelope.message, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed();

        let interest = Interest {
            bus: Arc::downgrade(&self.bus),
            subject: subject.to_string(),
            origin,
        };
        Ok(Subscription::new(subject, messages, Some(Box::new(interest))))
    }
}
