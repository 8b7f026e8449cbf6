use crate::backend::{BackendError, Backends};
use crate::config::Config;
use crate::heartbeat::HeartbeatProcessor;
use crate::metrics_buffer::MetricBuffer;
use crate::registry::{ConnHandle, Registry};
use sindri_console_core::protocol::{encode_envelope, Envelope};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const FRAME_CAP_FACTOR: usize = 4;

/// Process-wide gateway state shared by every connection task.
pub struct Gateway {
    pub config: Config,
    pub registry: Registry,
    pub backends: Backends,
    pub heartbeat: HeartbeatProcessor,
    pub metrics: MetricBuffer,
    conn_counter: AtomicU64,
    closing: watch::Sender<bool>,
}

impl Gateway {
    pub fn new(config: Config, backends: Backends, metrics: MetricBuffer) -> Self {
        let heartbeat = HeartbeatProcessor::new(
            backends.telemetry.clone(),
            backends.kv.clone(),
            config.online_ttl,
        );
        Self {
            config,
            registry: Registry::new(),
            backends,
            heartbeat,
            metrics,
            conn_counter: AtomicU64::new(0),
            closing: watch::channel(false).0,
        }
    }

    /// Asks every open socket to close so graceful shutdown can complete.
    pub fn begin_shutdown(&self) {
        self.closing.send_replace(true);
        info!(event = "gateway_closing", sessions = self.closing.receiver_count());
    }

    /// Largest frame the transport will buffer before the codec sees it.
    pub fn frame_cap(&self) -> usize {
        self.config.max_message_bytes.saturating_mul(FRAME_CAP_FACTOR)
    }

    /// Receivers subscribed after `begin_shutdown` see the flag via `borrow`, not `changed`.
    pub fn closing(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    /// Disconnect cleanup for a connection that owned its instance. Skipped when a newer
    /// connection already holds the instance, and undone when one registers mid-cleanup.
    pub async fn agent_gone(&self, instance_id: &str) -> bool {
        if self.registry.find_agent(instance_id).await.is_some() {
            debug!(event = "disconnect_cleanup_skipped", instance_id = %instance_id);
            return true;
        }
        let cleaned = self.heartbeat.agent_disconnected(instance_id).await.all_ok();
        if self.registry.find_agent(instance_id).await.is_some() {
            info!(event = "agent_reclaimed", instance_id = %instance_id);
            return self.heartbeat.agent_reclaimed(instance_id).await.all_ok() && cleaned;
        }
        cleaned
    }

    pub fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    pub async fn publish_envelope(&self, topic: &str, envelope: &Envelope) -> Result<(), BackendError> {
        let payload = encode_envelope(envelope).map_err(|err| BackendError::Encode(err.to_string()))?;
        self.backends.pubsub.publish(topic, payload).await.map(|_| ())
    }

    pub fn send_envelope(&self, conn: &ConnHandle, envelope: &Envelope) -> bool {
        match encode_envelope(envelope) {
            Ok(text) => conn.send_text(text),
            Err(err) => {
                warn!(event = "encode_failed", conn_id = %conn.conn_id, error = %err);
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::tests::StaticCredentials;
    use crate::heartbeat::tests::RecordingTelemetry;
    use crate::kv::MemoryKv;
    use crate::metrics_buffer::{spawn_metric_buffer, MetricBufferConfig};
    use crate::pubsub::MemoryPubSub;
    use sindri_console_core::{hash_credential, Principal, UserRole};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::{watch, Mutex};
    use tokio::task::JoinHandle;

    /// Gateway wired to in-memory backends, with handles kept for assertions.
    pub(crate) struct TestGateway {
        pub(crate) gateway: Arc<Gateway>,
        pub(crate) pubsub: Arc<MemoryPubSub>,
        pub(crate) kv: Arc<MemoryKv>,
        pub(crate) telemetry: Arc<RecordingTelemetry>,
        shutdown: watch::Sender<bool>,
        flusher: Mutex<Option<JoinHandle<()>>>,
    }

    impl TestGateway {
        pub(crate) async fn new() -> Self {
            Self::build(
                Config::default(),
                Arc::new(MemoryPubSub::default()),
                RecordingTelemetry::default(),
            )
        }

        pub(crate) async fn with_failing_heartbeats() -> Self {
            Self::build(
                Config::default(),
                Arc::new(MemoryPubSub::default()),
                RecordingTelemetry {
                    fail_heartbeats: true,
                    ..RecordingTelemetry::default()
                },
            )
        }

        /// Second gateway node sharing the pub/sub medium of another.
        pub(crate) fn sharing(pubsub: Arc<MemoryPubSub>) -> Self {
            Self::build(Config::default(), pubsub, RecordingTelemetry::default())
        }

        pub(crate) fn build(config: Config, pubsub: Arc<MemoryPubSub>, telemetry: RecordingTelemetry) -> Self {
            let kv = Arc::new(MemoryKv::new());
            let telemetry = Arc::new(telemetry);
            let backends = Backends {
                pubsub: pubsub.clone(),
                kv: kv.clone(),
                credentials: Arc::new(test_credentials()),
                telemetry: telemetry.clone(),
            };
            let (shutdown, shutdown_rx) = watch::channel(false);
            let (metrics, flusher) =
                spawn_metric_buffer(telemetry.clone(), MetricBufferConfig::from(&config), shutdown_rx);
            Self {
                gateway: Arc::new(Gateway::new(config, backends, metrics)),
                pubsub,
                kv,
                telemetry,
                shutdown,
                flusher: Mutex::new(Some(flusher)),
            }
        }

        /// Stops the metric flusher and waits until every queued record is written.
        pub(crate) async fn flush_metrics(&self) {
            let _ = self.shutdown.send(true);
            if let Some(handle) = self.flusher.lock().await.take() {
                handle.await.expect("flusher");
            }
        }
    }

    fn principal(instance_id: Option<&str>) -> Principal {
        Principal {
            user_id: "u-1".to_string(),
            api_key_id: format!("k-{}", instance_id.unwrap_or("browser")),
            role: UserRole::Developer,
            expires_at: None,
            instance_id: instance_id.map(str::to_string),
        }
    }

    /// `sk-agent-1` / `sk-agent-2` are bound to `i-1` / `i-2`; `sk-browser` is unbound.
    pub(crate) fn test_credentials() -> StaticCredentials {
        let mut keys = HashMap::new();
        keys.insert(hash_credential("sk-agent-1"), principal(Some("i-1")));
        keys.insert(hash_credential("sk-agent-2"), principal(Some("i-2")));
        keys.insert(hash_credential("sk-browser"), principal(None));
        StaticCredentials { keys }
    }

    #[tokio::test]
    async fn connection_ids_are_unique_and_sequential() {
        let harness = TestGateway::new().await;
        assert_eq!(harness.gateway.next_conn_id(), "conn-1");
        assert_eq!(harness.gateway.next_conn_id(), "conn-2");
    }

    #[tokio::test]
    async fn publish_envelope_encodes_for_topic_subscribers() {
        use crate::backend::PubSub;
        use sindri_console_core::protocol::MessageType;

        let harness = TestGateway::new().await;
        let mut sub = harness.pubsub.subscribe("t").await.expect("subscribe");
        let envelope = Envelope::new(MessageType::Ack, serde_json::json!({"ok": true}));
        harness
            .gateway
            .publish_envelope("t", &envelope)
            .await
            .expect("publish");
        let delivery = sub.recv().await.expect("delivery");
        assert_eq!(delivery.payload, encode_envelope(&envelope).expect("encode"));
    }

    #[tokio::test]
    async fn cleanup_leaves_an_instance_claimed_by_a_newer_connection() {
        use crate::backend::{KvStore, TelemetryStore};
        use crate::registry::AgentConnection;
        use sindri_console_core::topics::ACTIVE_AGENTS_KEY;
        use sindri_console_core::InstanceStatus;
        use tokio::sync::mpsc;

        let harness = TestGateway::new().await;
        let gateway = harness.gateway.clone();
        harness.telemetry.set_status("i-1", InstanceStatus::Running).await;
        gateway.heartbeat.agent_connected("i-1").await;

        let (tx, _rx) = mpsc::channel(4);
        let (closer, _close_rx) = watch::channel(None);
        gateway
            .registry
            .register_agent(AgentConnection {
                handle: ConnHandle::new("conn-9".to_string(), tx, closer),
                instance_id: "i-1".to_string(),
                user_id: "u-1".to_string(),
                api_key_id: "k-i-1".to_string(),
                connected_at: chrono::Utc::now(),
            })
            .await;

        assert!(gateway.agent_gone("i-1").await);
        assert_eq!(
            harness.telemetry.instance_status("i-1").await.expect("status"),
            Some(InstanceStatus::Running)
        );
        assert_eq!(
            harness.kv.set_members(ACTIVE_AGENTS_KEY).await.expect("members"),
            vec!["i-1".to_string()]
        );

        assert!(gateway.registry.unregister_agent("i-1", "conn-9").await);
        assert!(gateway.agent_gone("i-1").await);
        assert_eq!(
            harness.telemetry.instance_status("i-1").await.expect("status"),
            Some(InstanceStatus::Error)
        );
        assert!(harness.kv.set_members(ACTIVE_AGENTS_KEY).await.expect("members").is_empty());
    }

    #[tokio::test]
    async fn reclaim_restores_membership_and_running_status() {
        use crate::backend::{KvStore, TelemetryStore};
        use sindri_console_core::topics::ACTIVE_AGENTS_KEY;
        use sindri_console_core::InstanceStatus;

        let harness = TestGateway::new().await;
        let gateway = harness.gateway.clone();
        harness.telemetry.set_status("i-1", InstanceStatus::Running).await;
        gateway.heartbeat.agent_connected("i-1").await;
        gateway.heartbeat.agent_disconnected("i-1").await;

        assert!(gateway.heartbeat.agent_reclaimed("i-1").await.all_ok());
        assert_eq!(
            harness.telemetry.instance_status("i-1").await.expect("status"),
            Some(InstanceStatus::Running)
        );
        assert_eq!(
            harness.kv.set_members(ACTIVE_AGENTS_KEY).await.expect("members"),
            vec!["i-1".to_string()]
        );
    }
}
