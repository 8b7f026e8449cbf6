//! Redis-backed pub/sub medium and expiring key-value store. Every gateway node pointed at the
//! same server shares topics, liveness markers, command results and the active-agent set.

use crate::backend::{BackendError, Delivery, KvStore, PubSub, Subscription};
use crate::pubsub::DEFAULT_SUBSCRIBER_QUEUE;
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{Client, FromRedisValue};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

enum Filter<'a> {
    Topic(&'a str),
    Pattern(&'a str),
}

/// Commands share one multiplexed connection; each subscription holds its own pub/sub
/// connection for as long as its `Subscription` is alive.
#[derive(Clone)]
pub struct RedisBackend {
    client: Client,
    conn: MultiplexedConnection,
    queue_capacity: usize,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let client = Client::open(url).map_err(kv_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(kv_error)?;
        info!(event = "redis_connected");
        Ok(Self {
            client,
            conn,
            queue_capacity: DEFAULT_SUBSCRIBER_QUEUE,
        })
    }

    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, BackendError> {
        let mut conn = self.conn.clone();
        cmd.query_async::<_, T>(&mut conn).await.map_err(kv_error)
    }

    async fn attach(&self, filter: Filter<'_>) -> Result<Subscription, BackendError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(pubsub_error)?;
        let source = match filter {
            Filter::Topic(topic) => {
                pubsub.subscribe(topic).await.map_err(pubsub_error)?;
                topic.to_string()
            }
            Filter::Pattern(pattern) => {
                pubsub.psubscribe(pattern).await.map_err(pubsub_error)?;
                pattern.to_string()
            }
        };
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        tokio::spawn(forward(pubsub, tx, source));
        Ok(Subscription::new(rx))
    }
}

/// Pumps one pub/sub connection into a subscription queue until either side goes away.
async fn forward(pubsub: redis::aio::PubSub, tx: mpsc::Sender<Delivery>, source: String) {
    let mut messages = Box::pin(pubsub.into_on_message());
    loop {
        tokio::select! {
            _ = tx.closed() => break,
            msg = messages.next() => {
                let Some(msg) = msg else {
                    warn!(event = "redis_subscription_lost", source = %source);
                    break;
                };
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(event = "redis_payload_error", source = %source, error = %err);
                        continue;
                    }
                };
                let delivery = Delivery {
                    topic: msg.get_channel_name().to_string(),
                    payload,
                };
                match tx.try_send(delivery) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(event = "pubsub_slow_subscriber", source = %source);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        }
    }
    debug!(event = "redis_subscription_closed", source = %source);
}

fn kv_error(err: redis::RedisError) -> BackendError {
    BackendError::Kv(err.to_string())
}

fn pubsub_error(err: redis::RedisError) -> BackendError {
    BackendError::PubSub(err.to_string())
}

/// Expiry in whole milliseconds, rounded up so a sub-millisecond TTL still expires later.
fn ttl_millis(ttl: Duration) -> Option<u64> {
    if ttl.is_zero() {
        return None;
    }
    let nanos = ttl.as_nanos();
    let millis = nanos / 1_000_000 + u128::from(nanos % 1_000_000 != 0);
    Some(u64::try_from(millis).unwrap_or(u64::MAX))
}

#[async_trait]
impl PubSub for RedisBackend {
    async fn publish(&self, topic: &str, payload: String) -> Result<usize, BackendError> {
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async::<_, usize>(&mut conn)
            .await
            .map_err(pubsub_error)
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BackendError> {
        self.attach(Filter::Topic(topic)).await
    }

    async fn psubscribe(&self, pattern: &str) -> Result<Subscription, BackendError> {
        self.attach(Filter::Pattern(pattern)).await
    }
}

#[async_trait]
impl KvStore for RedisBackend {
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), BackendError> {
        let Some(millis) = ttl_millis(ttl) else {
            return Err(BackendError::Kv(format!("zero ttl for {key}")));
        };
        self.query::<()>(redis::cmd("SET").arg(key).arg(value).arg("PX").arg(millis))
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, BackendError> {
        let added: usize = self.query(redis::cmd("SADD").arg(key).arg(member)).await?;
        Ok(added > 0)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, BackendError> {
        let removed: usize = self.query(redis::cmd("SREM").arg(key).arg(member)).await?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, BackendError> {
        let mut members: Vec<String> = self.query(redis::cmd("SMEMBERS").arg(key)).await?;
        members.sort();
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sindri_console_core::topics::{instance_topic, InstanceTopic, INSTANCE_TOPIC_PATTERN};

    /// Live tests run only when `SINDRI_TEST_REDIS_URL` points at a disposable server.
    async fn live_backend() -> Option<RedisBackend> {
        let url = std::env::var("SINDRI_TEST_REDIS_URL").ok()?;
        Some(RedisBackend::connect(&url).await.expect("connect"))
    }

    #[test]
    fn ttl_rounds_up_to_whole_milliseconds() {
        assert_eq!(ttl_millis(Duration::ZERO), None);
        assert_eq!(ttl_millis(Duration::from_secs(30)), Some(30_000));
        assert_eq!(ttl_millis(Duration::from_micros(1500)), Some(2));
        assert_eq!(ttl_millis(Duration::from_nanos(1)), Some(1));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_kv_error() {
        let err = RedisBackend::connect("redis://127.0.0.1:1/")
            .await
            .err()
            .expect("connect must fail");
        assert!(matches!(err, BackendError::Kv(_)));
    }

    #[tokio::test]
    async fn bad_url_is_rejected() {
        let err = RedisBackend::connect("not a url").await.err().expect("rejected");
        assert!(matches!(err, BackendError::Kv(_)));
    }

    #[tokio::test]
    async fn two_nodes_share_topics_and_keys() {
        let Some(node_a) = live_backend().await else {
            return;
        };
        let Some(node_b) = live_backend().await else {
            return;
        };
        let topic = instance_topic("redis-test-i-1", InstanceTopic::Events);
        let mut pattern = node_b.psubscribe(INSTANCE_TOPIC_PATTERN).await.expect("psubscribe");
        let mut exact = node_b.subscribe(&topic).await.expect("subscribe");

        let delivered = node_a.publish(&topic, "{\"n\":1}".to_string()).await.expect("publish");
        assert!(delivered >= 2);
        let got = exact.recv().await.expect("delivery");
        assert_eq!(got.topic, topic);
        assert_eq!(got.payload, "{\"n\":1}");
        assert_eq!(pattern.recv().await.expect("delivery").topic, topic);

        let key = "sindri:test:redis-marker";
        node_a
            .set_with_ttl(key, "1".to_string(), Duration::from_millis(200))
            .await
            .expect("set");
        assert_eq!(node_b.get(key).await.expect("get").as_deref(), Some("1"));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(node_b.get(key).await.expect("get"), None);

        let set = "sindri:test:redis-active";
        assert!(node_a.set_add(set, "i-1").await.expect("sadd"));
        assert!(!node_a.set_add(set, "i-1").await.expect("sadd"));
        assert_eq!(node_b.set_members(set).await.expect("members"), vec!["i-1".to_string()]);
        assert!(node_b.set_remove(set, "i-1").await.expect("srem"));
        assert!(node_a.set_members(set).await.expect("members").is_empty());
    }
}
