use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{info, warn};

pub const SUPERSEDED_CLOSE_CODE: u16 = 4000;
pub const UNAUTHORIZED_CLOSE_CODE: u16 = 4001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseSignal {
    pub code: u16,
    pub reason: String,
}

/// Outbound side of one live connection: a bounded frame queue drained by the writer task and
/// a close signal the writer honours ahead of queued frames.
#[derive(Clone)]
pub struct ConnHandle {
    pub conn_id: String,
    sender: mpsc::Sender<Message>,
    closer: Arc<watch::Sender<Option<CloseSignal>>>,
}

impl ConnHandle {
    pub fn new(
        conn_id: impl Into<String>,
        sender: mpsc::Sender<Message>,
        closer: watch::Sender<Option<CloseSignal>>,
    ) -> Self {
        Self {
            conn_id: conn_id.into(),
            sender,
            closer: Arc::new(closer),
        }
    }

    /// Queues a text frame without waiting. A full queue drops the frame.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send_message(Message::Text(text.into()))
    }

    pub fn send_message(&self, message: Message) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = "slow_consumer", conn_id = %self.conn_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn close(&self, code: u16, reason: &str) {
        self.closer.send_replace(Some(CloseSignal {
            code,
            reason: reason.to_string(),
        }));
    }

    /// True once the writer side has gone away.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    #[cfg(test)]
    pub fn close_requested(&self) -> Option<CloseSignal> {
        self.closer.borrow().clone()
    }
}

#[derive(Clone)]
pub struct AgentConnection {
    pub handle: ConnHandle,
    pub instance_id: String,
    pub user_id: String,
    pub api_key_id: String,
    pub connected_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct BrowserConnection {
    pub handle: ConnHandle,
    pub user_id: String,
    pub api_key_id: String,
    pub connected_at: DateTime<Utc>,
    pub subscriptions: HashSet<String>,
}

/// Live connections on this process: agents keyed by instance id, browsers keyed by conn id.
#[derive(Default)]
pub struct Registry {
    agents: RwLock<HashMap<String, AgentConnection>>,
    browsers: RwLock<HashMap<String, BrowserConnection>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the agent, closing any previous connection for the same instance with 4000.
    pub async fn register_agent(&self, agent: AgentConnection) -> Option<AgentConnection> {
        let instance_id = agent.instance_id.clone();
        let conn_id = agent.handle.conn_id.clone();
        let previous = self
            .agents
            .write()
            .await
            .insert(instance_id.clone(), agent);
        if let Some(previous) = &previous {
            previous.handle.close(SUPERSEDED_CLOSE_CODE, "superseded");
            info!(
                event = "agent_superseded",
                instance_id = %instance_id,
                previous_conn_id = %previous.handle.conn_id,
                conn_id = %conn_id
            );
        }
        info!(event = "agent_registered", instance_id = %instance_id, conn_id = %conn_id);
        previous
    }

    pub async fn register_browser(&self, browser: BrowserConnection) {
        let conn_id = browser.handle.conn_id.clone();
        info!(event = "browser_registered", conn_id = %conn_id, user_id = %browser.user_id);
        self.browsers.write().await.insert(conn_id, browser);
    }

    /// Removes the entry only while it still belongs to `conn_id`.
    pub async fn unregister_agent(&self, instance_id: &str, conn_id: &str) -> bool {
        let mut agents = self.agents.write().await;
        let owned = agents
            .get(instance_id)
            .is_some_and(|agent| agent.handle.conn_id == conn_id);
        if owned {
            agents.remove(instance_id);
            info!(event = "agent_unregistered", instance_id = %instance_id, conn_id = %conn_id);
        }
        owned
    }

    pub async fn unregister_browser(&self, conn_id: &str) -> bool {
        let removed = self.browsers.write().await.remove(conn_id);
        if let Some(browser) = &removed {
            info!(
                event = "browser_unregistered",
                conn_id = %conn_id,
                subscriptions = browser.subscriptions.len()
            );
        }
        removed.is_some()
    }

    pub async fn subscribe(&self, conn_id: &str, instance_id: &str) -> bool {
        let mut browsers = self.browsers.write().await;
        let Some(browser) = browsers.get_mut(conn_id) else {
            return false;
        };
        browser.subscriptions.insert(instance_id.to_string());
        true
    }

    pub async fn unsubscribe(&self, conn_id: &str, instance_id: &str) -> bool {
        let mut browsers = self.browsers.write().await;
        let Some(browser) = browsers.get_mut(conn_id) else {
            return false;
        };
        browser.subscriptions.remove(instance_id)
    }

    pub async fn find_agent(&self, instance_id: &str) -> Option<ConnHandle> {
        self.agents
            .read()
            .await
            .get(instance_id)
            .map(|agent| agent.handle.clone())
    }

    pub async fn browsers_subscribed_to(&self, instance_id: &str) -> Vec<ConnHandle> {
        self.browsers
            .read()
            .await
            .values()
            .filter(|browser| browser.subscriptions.contains(instance_id))
            .map(|browser| browser.handle.clone())
            .collect()
    }

    /// Sends `text` to every browser subscribed to `instance_id`; returns how many accepted it.
    pub async fn send_to_subscribers(&self, instance_id: &str, text: &str) -> usize {
        self.browsers_subscribed_to(instance_id)
            .await
            .into_iter()
            .filter(|browser| browser.send_text(text))
            .count()
    }

    #[cfg(test)]
    pub async fn subscriptions(&self, conn_id: &str) -> Option<HashSet<String>> {
        self.browsers
            .read()
            .await
            .get(conn_id)
            .map(|browser| browser.subscriptions.clone())
    }

    pub async fn counts(&self) -> (usize, usize) {
        let agents = self.agents.read().await.len();
        let browsers = self.browsers.read().await.len();
        (agents, browsers)
    }
}
