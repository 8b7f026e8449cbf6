//! Single-purpose stream sockets: a multiplexed per-instance metrics feed and a deployment
//! progress feed. Both forward pub/sub payloads verbatim.

use crate::auth::authenticate;
use crate::backend::Subscription;
use crate::gateway::Gateway;
use crate::registry::ConnHandle;
use crate::server::{limit_upgrade, reject, Session};
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use chrono::Utc;
use serde::Deserialize;
use sindri_console_core::topics::{deployment_progress_topic, instance_topic, InstanceTopic};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Control frame on the metrics stream.
#[derive(Debug, Default, Deserialize)]
pub struct StreamControl {
    #[serde(default)]
    pub subscribe: Vec<String>,
    #[serde(default)]
    pub unsubscribe: Vec<String>,
}

pub async fn metrics_stream_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let ws = limit_upgrade(ws, &gateway);
    match authenticate(gateway.backends.credentials.as_ref(), &headers, &query, Utc::now()).await {
        Ok(admission) => ws.on_upgrade(move |socket| async move {
            info!(
                event = "metrics_stream_open",
                user_id = %admission.principal.user_id,
                remote = %remote
            );
            metrics_stream(gateway, socket).await;
        }),
        Err(err) => reject(ws, "/ws/metrics/stream", remote, err),
    }
}

pub async fn deployment_stream_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(gateway): State<Arc<Gateway>>,
    Path(deployment_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let ws = limit_upgrade(ws, &gateway);
    match authenticate(gateway.backends.credentials.as_ref(), &headers, &query, Utc::now()).await {
        Ok(admission) => ws.on_upgrade(move |socket| async move {
            info!(
                event = "deployment_stream_open",
                deployment_id = %deployment_id,
                user_id = %admission.principal.user_id,
                remote = %remote
            );
            deployment_stream(gateway, socket, deployment_id).await;
        }),
        Err(err) => reject(ws, "/ws/deployments", remote, err),
    }
}

async fn metrics_stream(gateway: Arc<Gateway>, socket: WebSocket) {
    let conn_id = gateway.next_conn_id();
    let mut session = Session::start(&gateway, socket, conn_id.clone());
    let mut forwards: HashMap<String, JoinHandle<()>> = HashMap::new();

    while let Some(raw) = session.next_frame().await {
        let control: StreamControl = match serde_json::from_str(&raw) {
            Ok(control) => control,
            Err(err) => {
                warn!(event = "protocol_error", conn_id = %conn_id, error = %err);
                continue;
            }
        };
        for instance_id in control.unsubscribe {
            if let Some(task) = forwards.remove(instance_id.trim()) {
                task.abort();
                debug!(event = "metrics_stream_unsubscribed", conn_id = %conn_id, instance_id = %instance_id);
            }
        }
        for instance_id in control.subscribe {
            let instance_id = instance_id.trim().to_string();
            if instance_id.is_empty() || forwards.contains_key(&instance_id) {
                continue;
            }
            let topic = instance_topic(&instance_id, InstanceTopic::Metrics);
            match gateway.backends.pubsub.subscribe(&topic).await {
                Ok(subscription) => {
                    debug!(event = "metrics_stream_subscribed", conn_id = %conn_id, instance_id = %instance_id);
                    forwards.insert(instance_id, spawn_forward(subscription, session.handle.clone()));
                }
                Err(err) => {
                    warn!(event = "metrics_stream_subscribe_failed", conn_id = %conn_id, instance_id = %instance_id, error = %err);
                }
            }
        }
    }

    let released = forwards.len();
    for (_, task) in forwards.drain() {
        task.abort();
        let _ = task.await;
    }
    info!(event = "metrics_stream_closed", conn_id = %conn_id, released = released);
    session.finish().await;
}

async fn deployment_stream(gateway: Arc<Gateway>, socket: WebSocket, deployment_id: String) {
    let conn_id = gateway.next_conn_id();
    let mut session = Session::start(&gateway, socket, conn_id.clone());
    let topic = deployment_progress_topic(&deployment_id);
    let forward = match gateway.backends.pubsub.subscribe(&topic).await {
        Ok(subscription) => Some(spawn_forward(subscription, session.handle.clone())),
        Err(err) => {
            warn!(event = "deployment_stream_subscribe_failed", conn_id = %conn_id, topic = %topic, error = %err);
            None
        }
    };

    // inbound frames carry nothing; read until the peer goes away
    while session.next_frame().await.is_some() {}

    if let Some(task) = forward {
        task.abort();
        let _ = task.await;
    }
    info!(event = "deployment_stream_closed", conn_id = %conn_id, deployment_id = %deployment_id);
    session.finish().await;
}

fn spawn_forward(mut subscription: Subscription, handle: ConnHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(delivery) = subscription.recv().await {
            if handle.is_closed() {
                return;
            }
            handle.send_text(delivery.payload);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PubSub;
    use crate::gateway::tests::TestGateway;
    use crate::server::tests::{close_code, connect, eventually, next_text, next_text_within, send, spawn_server};
    use std::time::Duration;

    #[test]
    fn control_frame_fields_default_to_empty() {
        let control: StreamControl = serde_json::from_str(r#"{"subscribe":["i-1"]}"#).expect("control");
        assert_eq!(control.subscribe, vec!["i-1".to_string()]);
        assert!(control.unsubscribe.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn metrics_stream_forwards_only_requested_instances() {
        let harness = TestGateway::new().await;
        let addr = spawn_server(&harness).await;
        let pubsub = harness.pubsub.clone();

        let mut client = connect(addr, "/ws/metrics/stream?token=sk-browser").await;
        send(&mut client, r#"{"subscribe":["i-1"]}"#).await;
        assert!(eventually(|| async { pubsub.subscriber_count().await == 1 }).await);

        pubsub
            .publish("sindri:instance:i-2:metrics", "{\"n\":2}".to_string())
            .await
            .expect("publish");
        pubsub
            .publish("sindri:instance:i-1:metrics", "{\"n\":1}".to_string())
            .await
            .expect("publish");
        assert_eq!(next_text(&mut client).await.as_deref(), Some("{\"n\":1}"));

        send(&mut client, r#"{"unsubscribe":["i-1"]}"#).await;
        assert!(eventually(|| async { pubsub.subscriber_count().await == 0 }).await);
        pubsub
            .publish("sindri:instance:i-1:metrics", "{\"n\":3}".to_string())
            .await
            .expect("publish");
        assert!(next_text_within(&mut client, Duration::from_millis(300)).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn metrics_stream_releases_subscriptions_on_close() {
        let harness = TestGateway::new().await;
        let addr = spawn_server(&harness).await;
        let pubsub = harness.pubsub.clone();

        let mut client = connect(addr, "/ws/metrics/stream?token=sk-browser").await;
        send(&mut client, r#"{"subscribe":["i-1","i-2"," "]}"#).await;
        assert!(eventually(|| async { pubsub.subscriber_count().await == 2 }).await);
        client.close(None).await.expect("close");
        assert!(eventually(|| async { pubsub.subscriber_count().await == 0 }).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deployment_stream_relays_progress_verbatim() {
        let harness = TestGateway::new().await;
        let addr = spawn_server(&harness).await;
        let pubsub = harness.pubsub.clone();

        let mut client = connect(addr, "/ws/deployments/d-9?token=sk-browser").await;
        assert!(eventually(|| async { pubsub.subscriber_count().await == 1 }).await);
        pubsub
            .publish("sindri:deployment:d-9:progress", r#"{"step":"pull","pct":40}"#.to_string())
            .await
            .expect("publish");
        assert_eq!(
            next_text(&mut client).await.as_deref(),
            Some(r#"{"step":"pull","pct":40}"#)
        );

        client.close(None).await.expect("close");
        assert!(eventually(|| async { pubsub.subscriber_count().await == 0 }).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stream_endpoints_require_a_credential() {
        let harness = TestGateway::new().await;
        let addr = spawn_server(&harness).await;
        let mut metrics = connect(addr, "/ws/metrics/stream").await;
        assert_eq!(close_code(&mut metrics).await, Some(4001));
        let mut deployment = connect(addr, "/ws/deployments/d-1?token=wrong").await;
        assert_eq!(close_code(&mut deployment).await, Some(4001));
    }
}
