use crate::backend::{BackendError, KvStore, TelemetryStore};
use crate::effects::{EffectReport, Effects};
use chrono::Utc;
use sindri_console_core::telemetry::{HeartbeatRecord, HeartbeatSample};
use sindri_console_core::topics::{online_key, ACTIVE_AGENTS_KEY};
use sindri_console_core::InstanceStatus;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Liveness bookkeeping for agents: heartbeat side effects plus connect/disconnect transitions.
pub struct HeartbeatProcessor {
    telemetry: Arc<dyn TelemetryStore>,
    kv: Arc<dyn KvStore>,
    online_ttl: Duration,
}

impl HeartbeatProcessor {
    pub fn new(telemetry: Arc<dyn TelemetryStore>, kv: Arc<dyn KvStore>, online_ttl: Duration) -> Self {
        Self {
            telemetry,
            kv,
            online_ttl,
        }
    }

    /// Record, refresh the online marker and heal ERROR/UNKNOWN to RUNNING, all independently.
    pub async fn heartbeat(&self, instance_id: &str, sample: &HeartbeatSample) -> EffectReport {
        let record = HeartbeatRecord::from_sample(instance_id, sample, Utc::now());
        let marker = online_key(instance_id);
        let mut effects = Effects::new("heartbeat", instance_id);
        effects.push("insert_heartbeat", self.telemetry.insert_heartbeat(record));
        effects.push("refresh_online", async {
            let was_online = self.kv.get(&marker).await?.is_some();
            self.kv
                .set_with_ttl(&marker, "1".to_string(), self.online_ttl)
                .await?;
            if !was_online {
                info!(event = "instance_online", instance_id = %instance_id);
            }
            Ok::<(), BackendError>(())
        });
        effects.push("heal_status", async {
            let healed = self
                .telemetry
                .update_instance_status(instance_id, &InstanceStatus::HEALABLE, InstanceStatus::Running)
                .await?;
            if healed {
                info!(event = "instance_healed", instance_id = %instance_id);
            }
            Ok::<(), BackendError>(())
        });
        effects.run().await
    }

    pub async fn agent_connected(&self, instance_id: &str) -> EffectReport {
        let mut effects = Effects::new("agent_connected", instance_id);
        effects.push("add_active", async {
            self.kv.set_add(ACTIVE_AGENTS_KEY, instance_id).await.map(|_| ())
        });
        effects.run().await
    }

    /// Only a RUNNING instance is marked ERROR; any other status is left alone.
    pub async fn agent_disconnected(&self, instance_id: &str) -> EffectReport {
        let mut effects = Effects::new("agent_disconnected", instance_id);
        effects.push("remove_active", async {
            self.kv.set_remove(ACTIVE_AGENTS_KEY, instance_id).await.map(|_| ())
        });
        effects.push("mark_error", async {
            let marked = self
                .telemetry
                .update_instance_status(instance_id, &[InstanceStatus::Running], InstanceStatus::Error)
                .await?;
            if marked {
                info!(event = "instance_marked_error", instance_id = %instance_id);
            }
            Ok::<(), BackendError>(())
        });
        effects.run().await
    }

    /// A newer connection claimed the instance while disconnect cleanup was running: put it
    /// back in the active set and undo the ERROR demotion.
    pub async fn agent_reclaimed(&self, instance_id: &str) -> EffectReport {
        let mut effects = Effects::new("agent_reclaimed", instance_id);
        effects.push("add_active", async {
            self.kv.set_add(ACTIVE_AGENTS_KEY, instance_id).await.map(|_| ())
        });
        effects.push("restore_running", async {
            self.telemetry
                .update_instance_status(instance_id, &[InstanceStatus::Error], InstanceStatus::Running)
                .await
                .map(|_| ())
        });
        effects.run().await
    }
}
