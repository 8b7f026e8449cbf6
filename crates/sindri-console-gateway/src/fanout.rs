//! Pub/sub consumers: instance-topic fan-out to local browsers and the cross-node command relay.

use crate::backend::{BackendError, Delivery, Subscription};
use crate::gateway::Gateway;
use serde::{Deserialize, Serialize};
use sindri_console_core::topics::{
    parse_instance_topic, InstanceTopic, COMMAND_TOPIC_PATTERN, INSTANCE_TOPIC_PATTERN,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A browser command published for whichever gateway node holds the target agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayedCommand {
    pub origin: String,
    pub message: String,
}

impl Gateway {
    /// Forwards one instance-topic delivery verbatim to the local browsers subscribed to that
    /// instance. Command topics are not fanned out to browsers.
    pub async fn fan_out(&self, delivery: &Delivery) -> usize {
        let Some((instance_id, topic)) = parse_instance_topic(&delivery.topic) else {
            debug!(event = "fanout_topic_ignored", topic = %delivery.topic);
            return 0;
        };
        if topic == InstanceTopic::Commands {
            return 0;
        }
        self.registry
            .send_to_subscribers(instance_id, &delivery.payload)
            .await
    }

    /// Hands a command published by another node to the agent, if it is connected here.
    pub async fn relay_command(&self, delivery: &Delivery) -> bool {
        let Some((instance_id, InstanceTopic::Commands)) = parse_instance_topic(&delivery.topic) else {
            return false;
        };
        let relayed: RelayedCommand = match serde_json::from_str(&delivery.payload) {
            Ok(relayed) => relayed,
            Err(err) => {
                warn!(event = "relay_decode_failed", topic = %delivery.topic, error = %err);
                return false;
            }
        };
        if relayed.origin == self.config.node_id {
            return false;
        }
        let Some(agent) = self.registry.find_agent(instance_id).await else {
            return false;
        };
        let delivered = agent.send_text(relayed.message);
        debug!(
            event = "command_relayed",
            instance_id = %instance_id,
            origin = %relayed.origin,
            delivered = delivered
        );
        delivered
    }
}

/// Subscribes to every instance topic before returning, so nothing published after startup is
/// missed, then fans deliveries out until shutdown.
pub async fn spawn_fanout(
    gateway: Arc<Gateway>,
    shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>, BackendError> {
    let subscription = gateway.backends.pubsub.psubscribe(INSTANCE_TOPIC_PATTERN).await?;
    info!(event = "fanout_start", pattern = INSTANCE_TOPIC_PATTERN);
    Ok(spawn_consumer("fanout", subscription, shutdown, move |delivery| {
        let gateway = gateway.clone();
        async move {
            gateway.fan_out(&delivery).await;
        }
    }))
}

pub async fn spawn_command_relay(
    gateway: Arc<Gateway>,
    shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>, BackendError> {
    let subscription = gateway.backends.pubsub.psubscribe(COMMAND_TOPIC_PATTERN).await?;
    info!(event = "command_relay_start", pattern = COMMAND_TOPIC_PATTERN);
    Ok(spawn_consumer("command_relay", subscription, shutdown, move |delivery| {
        let gateway = gateway.clone();
        async move {
            gateway.relay_command(&delivery).await;
        }
    }))
}

fn spawn_consumer<F, Fut>(
    name: &'static str,
    mut subscription: Subscription,
    mut shutdown: watch::Receiver<bool>,
    handle: F,
) -> JoinHandle<()>
where
    F: Fn(Delivery) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = subscription.recv() => match maybe {
                    Some(delivery) => handle(delivery).await,
                    None => {
                        warn!(event = "consumer_closed", consumer = name);
                        return;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(event = "consumer_stopped", consumer = name);
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PubSub;
    use crate::gateway::tests::TestGateway;
    use crate::registry::tests::test_handle;
    use crate::registry::{AgentConnection, BrowserConnection};
    use axum::extract::ws::Message;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn add_browser(harness: &TestGateway, conn_id: &str, instance_id: &str) -> mpsc::Receiver<Message> {
        let (handle, rx) = test_handle(conn_id);
        harness
            .gateway
            .registry
            .register_browser(BrowserConnection {
                handle,
                user_id: "u-b".to_string(),
                api_key_id: "k-b".to_string(),
                connected_at: Utc::now(),
                subscriptions: HashSet::from([instance_id.to_string()]),
            })
            .await;
        rx
    }

    async fn add_agent(harness: &TestGateway, conn_id: &str, instance_id: &str) -> mpsc::Receiver<Message> {
        let (handle, rx) = test_handle(conn_id);
        harness
            .gateway
            .registry
            .register_agent(AgentConnection {
                handle,
                instance_id: instance_id.to_string(),
                user_id: "u-a".to_string(),
                api_key_id: "k-a".to_string(),
                connected_at: Utc::now(),
            })
            .await;
        rx
    }

    async fn next_text(rx: &mut mpsc::Receiver<Message>) -> Option<String> {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(Message::Text(text))) => Some(text),
            _ => None,
        }
    }

    fn delivery(topic: &str, payload: &str) -> Delivery {
        Delivery {
            topic: topic.to_string(),
            payload: payload.to_string(),
        }
    }

    #[tokio::test]
    async fn fan_out_reaches_only_matching_subscribers() {
        let harness = TestGateway::new().await;
        let mut rx1 = add_browser(&harness, "b-1", "i-1").await;
        let mut rx2 = add_browser(&harness, "b-2", "i-2").await;

        let sent = harness
            .gateway
            .fan_out(&delivery("sindri:instance:i-1:metrics", "{\"m\":1}"))
            .await;
        assert_eq!(sent, 1);
        assert!(matches!(rx1.try_recv(), Ok(Message::Text(text)) if text == "{\"m\":1}"));
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn commands_and_foreign_topics_are_not_fanned_out() {
        let harness = TestGateway::new().await;
        let mut rx = add_browser(&harness, "b-1", "i-1").await;
        assert_eq!(
            harness
                .gateway
                .fan_out(&delivery("sindri:instance:i-1:commands", "{}"))
                .await,
            0
        );
        assert_eq!(harness.gateway.fan_out(&delivery("other:topic", "{}")).await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn relay_skips_own_node_and_unknown_agents() {
        let harness = TestGateway::new().await;
        let mut agent_rx = add_agent(&harness, "conn-a", "i-1").await;
        let own = serde_json::to_string(&RelayedCommand {
            origin: harness.gateway.config.node_id.clone(),
            message: "x".to_string(),
        })
        .expect("encode");
        assert!(
            !harness
                .gateway
                .relay_command(&delivery("sindri:instance:i-1:commands", &own))
                .await
        );

        let foreign = serde_json::to_string(&RelayedCommand {
            origin: "gw-other".to_string(),
            message: "y".to_string(),
        })
        .expect("encode");
        assert!(
            !harness
                .gateway
                .relay_command(&delivery("sindri:instance:i-9:commands", &foreign))
                .await
        );
        assert!(
            harness
                .gateway
                .relay_command(&delivery("sindri:instance:i-1:commands", &foreign))
                .await
        );
        assert!(matches!(agent_rx.try_recv(), Ok(Message::Text(text)) if text == "y"));
        assert!(!harness.gateway.relay_command(&delivery("sindri:instance:i-1:commands", "nope")).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn published_telemetry_reaches_browsers_on_every_node() {
        let node_a = TestGateway::new().await;
        let node_b = TestGateway::sharing(node_a.pubsub.clone());
        let (_stop_tx, stop_rx) = watch::channel(false);
        spawn_fanout(node_a.gateway.clone(), stop_rx.clone())
            .await
            .expect("fanout a");
        spawn_fanout(node_b.gateway.clone(), stop_rx)
            .await
            .expect("fanout b");

        let mut on_a = add_browser(&node_a, "b-a", "i-1").await;
        let mut on_b = add_browser(&node_b, "b-b", "i-1").await;
        node_a
            .pubsub
            .publish("sindri:instance:i-1:events", "{\"e\":1}".to_string())
            .await
            .expect("publish");

        assert_eq!(next_text(&mut on_a).await.as_deref(), Some("{\"e\":1}"));
        assert_eq!(next_text(&mut on_b).await.as_deref(), Some("{\"e\":1}"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn browser_command_crosses_nodes_to_remote_agent() {
        let node_a = TestGateway::new().await;
        let node_b = TestGateway::sharing(node_a.pubsub.clone());
        let (_stop_tx, stop_rx) = watch::channel(false);
        spawn_command_relay(node_a.gateway.clone(), stop_rx.clone())
            .await
            .expect("relay a");
        spawn_command_relay(node_b.gateway.clone(), stop_rx)
            .await
            .expect("relay b");

        let mut agent_rx = add_agent(&node_b, "conn-a", "i-1").await;
        let (browser, _browser_rx) = test_handle("b-1");
        let raw = r#"{"channel":"commands","type":"command_dispatch","data":{"command":"id"},"instanceId":"i-1"}"#;
        let envelope =
            sindri_console_core::protocol::decode_envelope(raw.as_bytes(), 1 << 16).expect("decode");
        node_a.gateway.route_browser(&browser, envelope, raw).await;

        assert_eq!(next_text(&mut agent_rx).await.as_deref(), Some(raw));
    }

    #[tokio::test]
    async fn consumer_stops_on_shutdown() {
        let harness = TestGateway::new().await;
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = spawn_fanout(harness.gateway.clone(), stop_rx)
            .await
            .expect("fanout");
        stop_tx.send(true).expect("signal");
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("stopped")
            .expect("join");
    }
}
