use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use sindri_console_core::telemetry::{
    EventRecord, HeartbeatRecord, LogEntry, LogLevel, LogSource, MetricRecord,
};
use sindri_console_core::{InstanceStatus, Principal, UserRole};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

pub const CONSOLE_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewApiKey {
    pub id: String,
    pub user_id: String,
    pub key_hash: String,
    pub role: UserRole,
    pub instance_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredLog {
    pub instance_id: String,
    pub deployment_id: Option<String>,
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub instance_id: String,
    pub event_type: String,
    pub metadata: serde_json::Value,
    pub ts: DateTime<Utc>,
}

/// SQLite-backed durable store for the console's instance telemetry.
pub struct ConsoleStore {
    conn: Connection,
}

impl ConsoleStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let version = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(version)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > CONSOLE_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: CONSOLE_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_console_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn insert_api_key(&self, key: &NewApiKey) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO api_keys (id, user_id, key_hash, role, instance_id, expires_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                key.id,
                key.user_id,
                key.key_hash,
                key.role.as_str(),
                key.instance_id,
                key.expires_at.map(|ts| ts.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn find_principal_by_hash(&self, key_hash: &str) -> Result<Option<Principal>, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT id, user_id, role, instance_id, expires_at
                FROM api_keys
                WHERE key_hash = ?1
                ",
                params![key_hash],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((api_key_id, user_id, role, instance_id, expires_at)) = row else {
            return Ok(None);
        };
        let role = UserRole::from_str(&role).map_err(StorageError::InvalidValue)?;
        let expires_at = expires_at.as_deref().map(parse_ts).transpose()?;
        Ok(Some(Principal {
            user_id,
            api_key_id,
            role,
            expires_at,
            instance_id: instance_id.filter(|id| !id.is_empty()),
        }))
    }

    pub fn upsert_instance(
        &self,
        id: &str,
        name: &str,
        status: InstanceStatus,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO instances (id, name, status, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                updated_at = excluded.updated_at
            ",
            params![id, name, status.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn instance_status(&self, id: &str) -> Result<Option<InstanceStatus>, StorageError> {
        let status: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM instances WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        status
            .map(|value| InstanceStatus::from_str(&value).map_err(StorageError::InvalidValue))
            .transpose()
    }

    /// Sets `to` only when the current status is one of `from`. Returns whether a row changed.
    pub fn update_instance_status(
        &self,
        id: &str,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> Result<bool, StorageError> {
        if from.is_empty() {
            return Ok(false);
        }
        let placeholders = (0..from.len())
            .map(|idx| format!("?{}", idx + 4))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE instances SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status IN ({placeholders})"
        );
        let mut values = vec![
            to.as_str().to_string(),
            Utc::now().to_rfc3339(),
            id.to_string(),
        ];
        values.extend(from.iter().map(|status| status.as_str().to_string()));
        let changes = self.conn.execute(&sql, params_from_iter(values.iter()))?;
        Ok(changes > 0)
    }

    pub fn insert_heartbeat(&self, record: &HeartbeatRecord) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO heartbeats (
                instance_id,
                ts,
                cpu_percent,
                memory_used,
                memory_total,
                disk_used,
                disk_total,
                uptime
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
            params![
                record.instance_id,
                record.timestamp.to_rfc3339(),
                record.cpu_percent,
                record.memory_used.to_string(),
                record.memory_total.to_string(),
                record.disk_used.to_string(),
                record.disk_total.to_string(),
                record.uptime.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn recent_heartbeats(
        &self,
        instance_id: &str,
        limit: usize,
    ) -> Result<Vec<HeartbeatRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT instance_id, ts, cpu_percent, memory_used, memory_total, disk_used, disk_total, uptime
            FROM heartbeats
            WHERE instance_id = ?1
            ORDER BY id DESC
            LIMIT ?2
            ",
        )?;
        let rows = stmt.query_map(params![instance_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (instance_id, ts, cpu_percent, mem_used, mem_total, disk_used, disk_total, uptime) =
                row?;
            out.push(HeartbeatRecord {
                instance_id,
                timestamp: parse_ts(&ts)?,
                cpu_percent,
                memory_used: parse_counter(&mem_used)?,
                memory_total: parse_counter(&mem_total)?,
                disk_used: parse_counter(&disk_used)?,
                disk_total: parse_counter(&disk_total)?,
                uptime: parse_counter(&uptime)?,
            });
        }
        Ok(out)
    }

    /// Writes a batch of metric samples in one transaction.
    pub fn insert_metrics(&self, records: &[MetricRecord]) -> Result<usize, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO metrics (
                    instance_id,
                    ts,
                    cpu_percent,
                    load_avg_1,
                    load_avg_5,
                    load_avg_15,
                    mem_used,
                    mem_total,
                    disk_used,
                    disk_total,
                    net_bytes_sent,
                    net_bytes_recv,
                    sample_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ",
            )?;
            for record in records {
                let sample = &record.sample;
                let sample_json = serde_json::to_string(sample)
                    .map_err(|err| StorageError::Serialization(err.to_string()))?;
                stmt.execute(params![
                    record.instance_id,
                    record.timestamp.to_rfc3339(),
                    sample.cpu_percent,
                    sample.load_avg_1,
                    sample.load_avg_5,
                    sample.load_avg_15,
                    sample.mem_used.map(|v| v.to_string()),
                    sample.mem_total.map(|v| v.to_string()),
                    sample.disk_used.map(|v| v.to_string()),
                    sample.disk_total.map(|v| v.to_string()),
                    sample.net_bytes_sent.map(|v| v.to_string()),
                    sample.net_bytes_recv.map(|v| v.to_string()),
                    sample_json,
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    pub fn count_metrics(&self, instance_id: &str) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM metrics WHERE instance_id = ?1",
            params![instance_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn insert_logs(&self, entries: &[LogEntry]) -> Result<usize, StorageError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO logs (instance_id, deployment_id, ts, level, source, message, metadata_json)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
            )?;
            for entry in entries {
                let metadata_json = entry
                    .metadata
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .map_err(|err| StorageError::Serialization(err.to_string()))?;
                stmt.execute(params![
                    entry.instance_id,
                    entry.deployment_id,
                    entry.timestamp.to_rfc3339(),
                    entry.level.as_str(),
                    entry.source.as_str(),
                    entry.message,
                    metadata_json,
                ])?;
            }
        }
        tx.commit()?;
        Ok(entries.len())
    }

    pub fn recent_logs(&self, instance_id: &str, limit: usize) -> Result<Vec<StoredLog>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT instance_id, deployment_id, ts, level, source, message
            FROM logs
            WHERE instance_id = ?1
            ORDER BY id DESC
            LIMIT ?2
            ",
        )?;
        let rows = stmt.query_map(params![instance_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (instance_id, deployment_id, ts, level, source, message) = row?;
            out.push(StoredLog {
                instance_id,
                deployment_id,
                ts: parse_ts(&ts)?,
                level: LogLevel::normalize(&level),
                source: LogSource::normalize(&source),
                message,
            });
        }
        Ok(out)
    }

    pub fn insert_event(&self, record: &EventRecord) -> Result<(), StorageError> {
        let metadata_json = serde_json::to_string(&record.metadata)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.conn.execute(
            "
            INSERT INTO events (instance_id, event_type, metadata_json, ts)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![
                record.instance_id,
                record.event_type.as_str(),
                metadata_json,
                record.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn recent_events(
        &self,
        instance_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT instance_id, event_type, metadata_json, ts
            FROM events
            WHERE instance_id = ?1
            ORDER BY id DESC
            LIMIT ?2
            ",
        )?;
        let rows = stmt.query_map(params![instance_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (instance_id, event_type, metadata_json, ts) = row?;
            out.push(StoredEvent {
                instance_id,
                event_type,
                metadata: serde_json::from_str(&metadata_json)
                    .map_err(|err| StorageError::Serialization(err.to_string()))?,
                ts: parse_ts(&ts)?,
            });
        }
        Ok(out)
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(format!("{raw}: {err}")))
}

fn parse_counter(raw: &str) -> Result<u64, StorageError> {
    raw.parse::<u64>()
        .map_err(|err| StorageError::InvalidValue(format!("{raw}: {err}")))
}
