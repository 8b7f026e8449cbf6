use crate::backend::{BackendError, CredentialLookup, TelemetryStore};
use async_trait::async_trait;
use sindri_console_core::telemetry::{EventRecord, HeartbeatRecord, LogEntry, MetricRecord};
use sindri_console_core::{InstanceStatus, Principal};
use sindri_console_storage::{ConsoleStore, StorageError};
use std::sync::{Arc, Mutex};

/// Runs store calls on the blocking pool so the connection never stalls the runtime.
#[derive(Clone)]
pub struct SqliteBackend {
    store: Arc<Mutex<ConsoleStore>>,
}

impl SqliteBackend {
    pub fn new(store: ConsoleStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    pub async fn run<T, F>(&self, job: F) -> Result<T, BackendError>
    where
        F: FnOnce(&ConsoleStore) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store.lock().map_err(|_| BackendError::Poisoned)?;
            job(&*guard).map_err(BackendError::from)
        })
        .await
        .map_err(|err| BackendError::Join(err.to_string()))?
    }
}

#[async_trait]
impl CredentialLookup for SqliteBackend {
    async fn find_principal_by_credential(
        &self,
        credential_hash: &str,
    ) -> Result<Option<Principal>, BackendError> {
        let hash = credential_hash.to_string();
        self.run(move |store| store.find_principal_by_hash(&hash)).await
    }
}

#[async_trait]
impl TelemetryStore for SqliteBackend {
    async fn insert_heartbeat(&self, record: HeartbeatRecord) -> Result<(), BackendError> {
        self.run(move |store| store.insert_heartbeat(&record)).await
    }

    async fn insert_metrics(&self, records: Vec<MetricRecord>) -> Result<usize, BackendError> {
        self.run(move |store| store.insert_metrics(&records)).await
    }

    async fn ingest_log(&self, entry: LogEntry) -> Result<(), BackendError> {
        self.run(move |store| store.insert_logs(std::slice::from_ref(&entry)).map(|_| ()))
            .await
    }

    async fn ingest_batch(&self, entries: Vec<LogEntry>) -> Result<usize, BackendError> {
        self.run(move |store| store.insert_logs(&entries)).await
    }

    async fn insert_event(&self, record: EventRecord) -> Result<(), BackendError> {
        self.run(move |store| store.insert_event(&record)).await
    }

    async fn update_instance_status(
        &self,
        instance_id: &str,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> Result<bool, BackendError> {
        let instance_id = instance_id.to_string();
        let from = from.to_vec();
        self.run(move |store| store.update_instance_status(&instance_id, &from, to))
            .await
    }

    async fn instance_status(&self, instance_id: &str) -> Result<Option<InstanceStatus>, BackendError> {
        let instance_id = instance_id.to_string();
        self.run(move |store| store.instance_status(&instance_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sindri_console_core::hash_credential;
    use sindri_console_core::UserRole;
    use sindri_console_storage::NewApiKey;
    use tempfile::TempDir;

    #[tokio::test]
    async fn adapter_reaches_the_store() {
        let dir = TempDir::new().expect("tempdir");
        let store = ConsoleStore::open(dir.path().join("console.db")).expect("store");
        store
            .insert_api_key(&NewApiKey {
                id: "k-1".to_string(),
                user_id: "u-1".to_string(),
                key_hash: hash_credential("sk-1"),
                role: UserRole::Admin,
                instance_id: Some("i-1".to_string()),
                expires_at: None,
            })
            .expect("key");
        store
            .upsert_instance("i-1", "box", InstanceStatus::Unknown)
            .expect("instance");
        let backend = SqliteBackend::new(store);

        let principal = backend
            .find_principal_by_credential(&hash_credential("sk-1"))
            .await
            .expect("lookup")
            .expect("principal");
        assert_eq!(principal.instance_id.as_deref(), Some("i-1"));

        assert!(backend
            .update_instance_status("i-1", &InstanceStatus::HEALABLE, InstanceStatus::Running)
            .await
            .expect("update"));
        assert_eq!(
            backend.instance_status("i-1").await.expect("status"),
            Some(InstanceStatus::Running)
        );

        backend
            .insert_heartbeat(HeartbeatRecord {
                instance_id: "i-1".to_string(),
                timestamp: Utc::now(),
                cpu_percent: 1.0,
                memory_used: 1,
                memory_total: 2,
                disk_used: 3,
                disk_total: 4,
                uptime: 5,
            })
            .await
            .expect("heartbeat");
        let count = backend
            .run(|store| store.recent_heartbeats("i-1", 10).map(|rows| rows.len()))
            .await
            .expect("count");
        assert_eq!(count, 1);
    }
}
