//! Narrow interfaces to the collaborators the gateway depends on: the pub/sub medium, the
//! expiring key-value store, credential lookup and durable telemetry storage.

use async_trait::async_trait;
use sindri_console_core::telemetry::{EventRecord, HeartbeatRecord, LogEntry, MetricRecord};
use sindri_console_core::{InstanceStatus, Principal};
use sindri_console_storage::StorageError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("storage lock poisoned")]
    Poisoned,
    #[error("blocking task failed: {0}")]
    Join(String),
    #[error("pubsub error: {0}")]
    PubSub(String),
    #[error("kv error: {0}")]
    Kv(String),
    #[error("metric buffer full")]
    BufferFull,
    #[error("metric buffer closed")]
    BufferClosed,
    #[error("encode error: {0}")]
    Encode(String),
}

/// One message delivered by the pub/sub medium.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: String,
}

/// Receiving end of a topic or pattern subscription. Dropping it detaches the subscriber.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<Delivery>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<Delivery>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}

#[async_trait]
pub trait PubSub: Send + Sync {
    /// Returns the number of subscribers the message was handed to.
    async fn publish(&self, topic: &str, payload: String) -> Result<usize, BackendError>;
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BackendError>;
    async fn psubscribe(&self, pattern: &str) -> Result<Subscription, BackendError>;
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), BackendError>;
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, BackendError>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, BackendError>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>, BackendError>;
}

#[async_trait]
pub trait CredentialLookup: Send + Sync {
    async fn find_principal_by_credential(
        &self,
        credential_hash: &str,
    ) -> Result<Option<Principal>, BackendError>;
}

#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn insert_heartbeat(&self, record: HeartbeatRecord) -> Result<(), BackendError>;
    async fn insert_metrics(&self, records: Vec<MetricRecord>) -> Result<usize, BackendError>;
    async fn ingest_log(&self, entry: LogEntry) -> Result<(), BackendError>;
    async fn ingest_batch(&self, entries: Vec<LogEntry>) -> Result<usize, BackendError>;
    async fn insert_event(&self, record: EventRecord) -> Result<(), BackendError>;
    /// Sets `to` only when the current status is one of `from`.
    async fn update_instance_status(
        &self,
        instance_id: &str,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> Result<bool, BackendError>;
    async fn instance_status(&self, instance_id: &str) -> Result<Option<InstanceStatus>, BackendError>;
}

#[derive(Clone)]
pub struct Backends {
    pub pubsub: Arc<dyn PubSub>,
    pub kv: Arc<dyn KvStore>,
    pub credentials: Arc<dyn CredentialLookup>,
    pub telemetry: Arc<dyn TelemetryStore>,
}
