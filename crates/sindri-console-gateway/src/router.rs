//! Per-envelope dispatch for agent and browser connections.

use crate::backend::BackendError;
use crate::effects::Effects;
use crate::fanout::RelayedCommand;
use crate::gateway::Gateway;
use crate::registry::ConnHandle;
use chrono::Utc;
use serde_json::json;
use sindri_console_core::protocol::{encode_envelope, Channel, Envelope, MessageType, Payload};
use sindri_console_core::telemetry::{
    EventRecord, HeartbeatSample, LogEntry, LogLine, MetricRecord, MetricsSample,
};
use sindri_console_core::topics::{command_result_key, instance_topic, InstanceTopic};
use tracing::{debug, warn};

impl Gateway {
    /// Routes one envelope from the agent registered as `instance_id`. The connection's instance
    /// id always wins over whatever the envelope claims.
    pub async fn route_agent(&self, agent: &ConnHandle, instance_id: &str, envelope: Envelope) {
        let payload = match envelope.payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    event = "protocol_error",
                    conn_id = %agent.conn_id,
                    instance_id = %instance_id,
                    error = %err
                );
                return;
            }
        };
        if let Some(claimed) = envelope.instance_id.as_deref() {
            if claimed != instance_id {
                debug!(
                    event = "instance_id_overridden",
                    conn_id = %agent.conn_id,
                    claimed = %claimed,
                    instance_id = %instance_id
                );
            }
        }
        let envelope = Envelope {
            instance_id: Some(instance_id.to_string()),
            ..envelope
        };

        match payload {
            Payload::Heartbeat(sample) => self.agent_heartbeat(agent, instance_id, &envelope, &sample).await,
            Payload::Metrics(sample) => self.agent_metrics(instance_id, &envelope, sample).await,
            Payload::LogLine(line) => self.agent_logs(instance_id, &envelope, vec![line], false).await,
            Payload::LogBatch(lines) => self.agent_logs(instance_id, &envelope, lines, true).await,
            Payload::Event(event) => {
                let record = EventRecord::from_payload(instance_id, event, Utc::now());
                let topic = instance_topic(instance_id, InstanceTopic::Events);
                let mut effects = Effects::new("event", instance_id);
                effects.push("publish_event", self.publish_envelope(&topic, &envelope));
                effects.push("insert_event", self.backends.telemetry.insert_event(record));
                effects.run().await;
            }
            Payload::Terminal => {
                let Some(text) = self.encode_or_log(&envelope) else {
                    return;
                };
                let delivered = self.registry.send_to_subscribers(instance_id, &text).await;
                debug!(event = "terminal_relayed", instance_id = %instance_id, delivered = delivered);
            }
            Payload::CommandResult(data) => self.agent_command_result(instance_id, &envelope, data).await,
            _ => {
                debug!(
                    event = "agent_message_ignored",
                    conn_id = %agent.conn_id,
                    kind = %envelope.kind
                );
            }
        }
    }

    async fn agent_heartbeat(
        &self,
        agent: &ConnHandle,
        instance_id: &str,
        envelope: &Envelope,
        sample: &HeartbeatSample,
    ) {
        let pong = envelope.to_pong(instance_id);
        let topic = instance_topic(instance_id, InstanceTopic::Heartbeat);
        let mut publish = Effects::new("heartbeat_publish", instance_id);
        publish.push("publish_pong", self.publish_envelope(&topic, &pong));
        tokio::join!(self.heartbeat.heartbeat(instance_id, sample), publish.run());

        let mut ack = Envelope::heartbeat_ack(instance_id);
        ack.correlation_id = envelope.correlation_id.clone();
        self.send_envelope(agent, &ack);
    }

    async fn agent_metrics(&self, instance_id: &str, envelope: &Envelope, sample: MetricsSample) {
        let record = MetricRecord::from_sample(instance_id, sample, Utc::now());
        let topic = instance_topic(instance_id, InstanceTopic::Metrics);
        let mut effects = Effects::new("metrics", instance_id);
        effects.push("enqueue_metric", std::future::ready(self.metrics.enqueue(record)));
        effects.push("publish_metrics", self.publish_envelope(&topic, envelope));
        effects.run().await;
    }

    async fn agent_logs(&self, instance_id: &str, envelope: &Envelope, lines: Vec<LogLine>, batch: bool) {
        let received_at = Utc::now();
        let mut entries: Vec<LogEntry> = lines
            .into_iter()
            .map(|line| LogEntry::from_line(instance_id, line, received_at))
            .collect();
        let topic = instance_topic(instance_id, InstanceTopic::Logs);
        let mut effects = Effects::new("logs", instance_id);
        if batch {
            if !entries.is_empty() {
                let telemetry = self.backends.telemetry.clone();
                effects.push("ingest_batch", async move {
                    telemetry.ingest_batch(entries).await.map(|_| ())
                });
            }
        } else if let Some(entry) = entries.pop() {
            effects.push("ingest_log", self.backends.telemetry.ingest_log(entry));
        }
        effects.push("publish_logs", self.publish_envelope(&topic, envelope));
        effects.run().await;
    }

    async fn agent_command_result(&self, instance_id: &str, envelope: &Envelope, data: serde_json::Value) {
        let result_key = envelope.correlation_id.as_deref().map(command_result_key);
        let mut effects = Effects::new("command_result", instance_id);
        if let Some(key) = result_key.as_deref() {
            effects.push(
                "store_command_result",
                self.backends
                    .kv
                    .set_with_ttl(key, data.to_string(), self.config.command_result_ttl),
            );
        }
        effects.run().await;

        let Some(text) = self.encode_or_log(envelope) else {
            return;
        };
        let delivered = self.registry.send_to_subscribers(instance_id, &text).await;
        debug!(
            event = "command_result_forwarded",
            instance_id = %instance_id,
            correlation_id = envelope.correlation_id.as_deref().unwrap_or_default(),
            delivered = delivered
        );
    }

    /// Routes one envelope from a browser. Without an instance id it is a subscription control
    /// message; with one, commands and terminal input go to the target agent.
    pub async fn route_browser(&self, browser: &ConnHandle, envelope: Envelope, raw: &str) {
        let Some(instance_id) = envelope.instance_id.clone() else {
            self.browser_control(browser, &envelope).await;
            return;
        };
        match envelope.channel {
            Channel::Commands | Channel::Terminal => {
                self.browser_command(browser, &instance_id, raw).await;
            }
            other => {
                debug!(
                    event = "browser_message_ignored",
                    conn_id = %browser.conn_id,
                    channel = %other,
                    kind = %envelope.kind
                );
            }
        }
    }

    async fn browser_control(&self, browser: &ConnHandle, envelope: &Envelope) {
        let (action, instance_id, changed) = match envelope.payload() {
            Ok(Payload::Subscribe { instance_id }) => {
                let changed = self.registry.subscribe(&browser.conn_id, &instance_id).await;
                ("subscribe", instance_id, changed)
            }
            Ok(Payload::Unsubscribe { instance_id }) => {
                let changed = self.registry.unsubscribe(&browser.conn_id, &instance_id).await;
                ("unsubscribe", instance_id, changed)
            }
            Ok(_) => {
                debug!(
                    event = "browser_message_ignored",
                    conn_id = %browser.conn_id,
                    kind = %envelope.kind
                );
                return;
            }
            Err(err) => {
                warn!(event = "protocol_error", conn_id = %browser.conn_id, error = %err);
                return;
            }
        };
        debug!(
            event = "browser_subscription",
            conn_id = %browser.conn_id,
            action = action,
            instance_id = %instance_id,
            changed = changed
        );
        let mut ack = Envelope::new(
            MessageType::Ack,
            json!({ "action": action, "instanceId": instance_id }),
        );
        ack.correlation_id = envelope.correlation_id.clone();
        self.send_envelope(browser, &ack);
    }

    async fn browser_command(&self, browser: &ConnHandle, instance_id: &str, raw: &str) {
        let delivered_locally = match self.registry.find_agent(instance_id).await {
            Some(agent) => agent.send_text(raw),
            None => false,
        };

        let topic = instance_topic(instance_id, InstanceTopic::Commands);
        let relayed = RelayedCommand {
            origin: self.config.node_id.clone(),
            message: raw.to_string(),
        };
        let mut effects = Effects::new("browser_command", instance_id);
        effects.push("publish_command", async {
            let payload =
                serde_json::to_string(&relayed).map_err(|err| BackendError::Encode(err.to_string()))?;
            self.backends.pubsub.publish(&topic, payload).await.map(|_| ())
        });
        effects.run().await;
        debug!(
            event = "command_forwarded",
            conn_id = %browser.conn_id,
            instance_id = %instance_id,
            local = delivered_locally
        );
    }

    fn encode_or_log(&self, envelope: &Envelope) -> Option<String> {
        match encode_envelope(envelope) {
            Ok(text) => Some(text),
            Err(err) => {
                warn!(event = "encode_failed", error = %err);
                None
            }
        }
    }
}
