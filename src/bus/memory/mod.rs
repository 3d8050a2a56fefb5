//! In-memory broker for standalone mode.
//!
//! Topics and subscriptions live in process memory. Each subscription owns an
//! unbounded queue; publishing fans a message out to every subscription bound to
//! the topic. Nacked messages are requeued after `redelivery_delay`.
//!
//! Push subscriptions are recorded but never delivered over HTTP; their queues
//! only fill up. Ideal for local development and testing without external
//! dependencies.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AckDecision, Broker, BrokerConnection, BusError, InboundMessage, MessageHandler,
    OutboundMessage, Result, SubscriptionSpec,
};

/// Default delay before a nacked message is queued again.
const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_millis(50);

/// Ack/nack counters for one subscription.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    acked: AtomicUsize,
    nacked: AtomicUsize,
}

impl DeliveryStats {
    pub fn acked(&self) -> usize {
        self.acked.load(Ordering::SeqCst)
    }

    pub fn nacked(&self) -> usize {
        self.nacked.load(Ordering::SeqCst)
    }
}

struct MemorySubscription {
    spec: SubscriptionSpec,
    sender: mpsc::UnboundedSender<InboundMessage>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<InboundMessage>>>,
    stats: Arc<DeliveryStats>,
    /// Fired when the subscription is deleted out from under a receiver.
    deleted: CancellationToken,
}

#[derive(Default)]
struct Inner {
    topics: RwLock<HashSet<String>>,
    subscriptions: RwLock<HashMap<String, MemorySubscription>>,
    published: RwLock<Vec<(String, OutboundMessage)>>,
    fail_on_connect: AtomicBool,
    /// Nacked messages waiting out `redelivery_delay`.
    redeliveries: TaskTracker,
}

/// In-process broker.
///
/// Cloning shares the same topics and subscriptions, so every connection
/// opened from any clone sees the same state.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
    redelivery_delay: Duration,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        info!("Memory broker initialized");
        Self {
            inner: Arc::new(Inner::default()),
            redelivery_delay: DEFAULT_REDELIVERY_DELAY,
        }
    }

    /// Set how long a nacked message waits before being queued again.
    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    pub fn set_fail_on_connect(&self, fail: bool) {
        self.inner.fail_on_connect.store(fail, Ordering::SeqCst);
    }

    pub async fn topic_count(&self) -> usize {
        self.inner.topics.read().await.len()
    }

    pub async fn has_topic(&self, topic: &str) -> bool {
        self.inner.topics.read().await.contains(topic)
    }

    pub async fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().await.len()
    }

    /// Definition of subscription `name`, if it exists.
    pub async fn subscription(&self, name: &str) -> Option<SubscriptionSpec> {
        self.inner
            .subscriptions
            .read()
            .await
            .get(name)
            .map(|s| s.spec.clone())
    }

    /// Delivery counters for subscription `name`, if it exists.
    pub async fn stats(&self, name: &str) -> Option<Arc<DeliveryStats>> {
        self.inner
            .subscriptions
            .read()
            .await
            .get(name)
            .map(|s| s.stats.clone())
    }

    /// Payloads published to `topic`, in publish order.
    pub async fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.inner
            .published
            .read()
            .await
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, m)| m.data.clone())
            .collect()
    }

    /// Nacked messages not yet queued again.
    pub fn pending_redeliveries(&self) -> usize {
        self.inner.redeliveries.len()
    }

    /// Wait until every nacked message so far has been queued again.
    pub async fn settle(&self) {
        let redeliveries = &self.inner.redeliveries;
        redeliveries.close();
        redeliveries.wait().await;
        redeliveries.reopen();
    }

    /// Queue a raw message on subscription `name`, bypassing topics.
    pub async fn inject(&self, name: &str, data: Vec<u8>) -> Result<()> {
        let subscriptions = self.inner.subscriptions.read().await;
        let subscription = subscriptions
            .get(name)
            .ok_or_else(|| BusError::NotFound(format!("subscription {}", name)))?;
        subscription
            .sender
            .send(InboundMessage {
                id: Uuid::new_v4().to_string(),
                data,
                attributes: HashMap::new(),
            })
            .map_err(|_| BusError::Closed)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, project_id: &str) -> Result<Arc<dyn BrokerConnection>> {
        if self.inner.fail_on_connect.load(Ordering::SeqCst) {
            return Err(BusError::Connection("Mock connect failure".to_string()));
        }

        debug!(project_id = %project_id, "Opened memory broker connection");

        Ok(Arc::new(MemoryConnection {
            inner: self.inner.clone(),
            redelivery_delay: self.redelivery_delay,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    inner: Arc<Inner>,
    redelivery_delay: Duration,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_topic(&self, topic: &str) -> Result<()> {
        self.ensure_open()?;
        if self.inner.topics.write().await.insert(topic.to_string()) {
            Ok(())
        } else {
            Err(BusError::AlreadyExists(format!("topic {}", topic)))
        }
    }

    async fn create_subscription(&self, name: &str, spec: &SubscriptionSpec) -> Result<()> {
        self.ensure_open()?;
        if !self.inner.topics.read().await.contains(&spec.topic) {
            return Err(BusError::NotFound(format!("topic {}", spec.topic)));
        }

        let mut subscriptions = self.inner.subscriptions.write().await;
        if subscriptions.contains_key(name) {
            return Err(BusError::AlreadyExists(format!("subscription {}", name)));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        subscriptions.insert(
            name.to_string(),
            MemorySubscription {
                spec: spec.clone(),
                sender,
                receiver: Arc::new(Mutex::new(receiver)),
                stats: Arc::new(DeliveryStats::default()),
                deleted: CancellationToken::new(),
            },
        );
        Ok(())
    }

    async fn delete_subscription(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        match self.inner.subscriptions.write().await.remove(name) {
            Some(subscription) => {
                subscription.deleted.cancel();
                Ok(())
            }
            None => Err(BusError::NotFound(format!("subscription {}", name))),
        }
    }

    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<String> {
        self.ensure_open()?;
        if !self.inner.topics.read().await.contains(topic) {
            return Err(BusError::NotFound(format!("topic {}", topic)));
        }

        let id = Uuid::new_v4().to_string();
        let subscriptions = self.inner.subscriptions.read().await;
        let mut receivers = 0;
        for subscription in subscriptions.values().filter(|s| s.spec.topic == topic) {
            let inbound = InboundMessage {
                id: id.clone(),
                data: message.data.clone(),
                attributes: message.attributes.clone(),
            };
            if subscription.sender.send(inbound).is_ok() {
                receivers += 1;
            }
        }
        drop(subscriptions);

        debug!(topic = %topic, message_id = %id, receivers, "Published message");
        self.inner
            .published
            .write()
            .await
            .push((topic.to_string(), message));

        Ok(id)
    }

    async fn receive(
        &self,
        subscription: &str,
        max_concurrency: usize,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.ensure_open()?;

        let (sender, receiver, stats, deleted) = {
            let subscriptions = self.inner.subscriptions.read().await;
            let s = subscriptions
                .get(subscription)
                .ok_or_else(|| BusError::NotFound(format!("subscription {}", subscription)))?;
            (
                s.sender.clone(),
                s.receiver.clone(),
                s.stats.clone(),
                s.deleted.clone(),
            )
        };

        let mut receiver = receiver.try_lock().map_err(|_| {
            BusError::Receive(format!("subscription {} already has a receiver", subscription))
        })?;

        let permits = Arc::new(Semaphore::new(max_concurrency.max(1)));
        let in_flight = TaskTracker::new();
        let redelivery_delay = self.redelivery_delay;
        let redeliveries = self.inner.redeliveries.clone();

        let outcome = loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = deleted.cancelled() => {
                    break Err(BusError::Receive(format!("subscription {} was deleted", subscription)));
                }
                message = receiver.recv() => message,
            };

            let Some(message) = message else {
                break Err(BusError::Closed);
            };

            let permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break Err(BusError::Closed),
            };

            let handler = handler.clone();
            let stats = stats.clone();
            let sender = sender.clone();
            let redeliveries = redeliveries.clone();
            in_flight.spawn(async move {
                let decision = handler.handle(message.clone()).await;
                drop(permit);
                match decision {
                    AckDecision::Ack => {
                        stats.acked.fetch_add(1, Ordering::SeqCst);
                    }
                    AckDecision::Nack => {
                        stats.nacked.fetch_add(1, Ordering::SeqCst);
                        // Outlives this receive loop; the broker tracks it.
                        redeliveries.spawn(async move {
                            tokio::time::sleep(redelivery_delay).await;
                            if sender.send(message).is_err() {
                                warn!("Dropped nacked message, subscription is gone");
                            }
                        });
                    }
                }
            });
        };

        in_flight.close();
        in_flight.wait().await;
        outcome
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests;
