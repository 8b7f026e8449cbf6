use crate::backend::{BackendError, Delivery, PubSub, Subscription};
use async_trait::async_trait;
use sindri_console_core::topics::topic_matches;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 1024;

enum Filter {
    Topic(String),
    Pattern(String),
}

impl Filter {
    fn matches(&self, topic: &str) -> bool {
        match self {
            Filter::Topic(exact) => exact == topic,
            Filter::Pattern(pattern) => topic_matches(pattern, topic),
        }
    }
}

struct Subscriber {
    id: u64,
    filter: Filter,
    sender: mpsc::Sender<Delivery>,
}

/// In-process pub/sub medium shared by every gateway instance built on it.
pub struct MemoryPubSub {
    queue_capacity: usize,
    next_id: AtomicU64,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl MemoryPubSub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity: queue_capacity.max(1),
            next_id: AtomicU64::new(0),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Live subscribers; detached ones are pruned first.
    #[cfg(test)]
    pub async fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|sub| !sub.sender.is_closed());
        subscribers.len()
    }

    async fn attach(&self, filter: Filter) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.subscribers.write().await.push(Subscriber {
            id,
            filter,
            sender: tx,
        });
        Subscription::new(rx)
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_QUEUE)
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, topic: &str, payload: String) -> Result<usize, BackendError> {
        let mut delivered = 0;
        let mut detached = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for sub in subscribers.iter().filter(|sub| sub.filter.matches(topic)) {
                let delivery = Delivery {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                };
                match sub.sender.try_send(delivery) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Closed(_)) => detached.push(sub.id),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(event = "pubsub_slow_subscriber", subscriber = sub.id, topic = topic);
                    }
                }
            }
        }
        if !detached.is_empty() {
            self.subscribers
                .write()
                .await
                .retain(|sub| !detached.contains(&sub.id));
        }
        Ok(delivered)
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BackendError> {
        Ok(self.attach(Filter::Topic(topic.to_string())).await)
    }

    async fn psubscribe(&self, pattern: &str) -> Result<Subscription, BackendError> {
        Ok(self.attach(Filter::Pattern(pattern.to_string())).await)
    }
}
