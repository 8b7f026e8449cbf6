//! Telemetry payloads carried by agent envelopes and the records derived from them.
//!
//! Counters (bytes, packets, uptime) are unsigned 64-bit and accepted either as JSON integers or
//! decimal strings so that values above 2^53 survive the trip from the agent.

use crate::{counter_from_value, deserialize_counter, deserialize_float, float_from_value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatSample {
    #[serde(default, deserialize_with = "deserialize_float")]
    pub cpu_percent: f64,
    #[serde(default, deserialize_with = "deserialize_counter")]
    pub memory_used: u64,
    #[serde(default, deserialize_with = "deserialize_counter")]
    pub memory_total: u64,
    #[serde(default, deserialize_with = "deserialize_counter")]
    pub disk_used: u64,
    #[serde(default, deserialize_with = "deserialize_counter")]
    pub disk_total: u64,
    #[serde(
        default,
        alias = "uptimeSeconds",
        alias = "uptime_seconds",
        deserialize_with = "deserialize_counter"
    )]
    pub uptime: u64,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRecord {
    pub instance_id: String,
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub disk_used: u64,
    pub disk_total: u64,
    pub uptime: u64,
}

impl HeartbeatRecord {
    pub fn from_sample(instance_id: &str, sample: &HeartbeatSample, received_at: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            timestamp: parse_timestamp(sample.timestamp.as_deref()).unwrap_or(received_at),
            cpu_percent: sample.cpu_percent,
            memory_used: sample.memory_used,
            memory_total: sample.memory_total,
            disk_used: sample.disk_used,
            disk_total: sample.disk_total,
            uptime: sample.uptime,
        }
    }
}

/// Metrics snapshot; every field is optional because agents report what they can collect.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSample {
    pub cpu_percent: Option<f64>,
    pub load_avg_1: Option<f64>,
    pub load_avg_5: Option<f64>,
    pub load_avg_15: Option<f64>,
    pub cpu_steal: Option<f64>,
    pub core_count: Option<u64>,
    pub mem_used: Option<u64>,
    pub mem_total: Option<u64>,
    pub mem_cached: Option<u64>,
    pub swap_used: Option<u64>,
    pub swap_total: Option<u64>,
    pub disk_used: Option<u64>,
    pub disk_total: Option<u64>,
    pub disk_read_bps: Option<f64>,
    pub disk_write_bps: Option<f64>,
    pub net_bytes_sent: Option<u64>,
    pub net_bytes_recv: Option<u64>,
    pub net_packets_sent: Option<u64>,
    pub net_packets_recv: Option<u64>,
    #[serde(skip)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl MetricsSample {
    /// Accepts the flat camelCase shape as well as the agent's nested
    /// `cpu` / `memory` / `disk[]` / `network` shape. Flat fields win.
    pub fn from_value(data: &Value) -> Result<Self, String> {
        let Some(obj) = data.as_object() else {
            return Err("metrics payload must be an object".to_string());
        };
        let cpu = obj.get("cpu").and_then(Value::as_object);
        let memory = obj.get("memory").and_then(Value::as_object);
        let network = obj.get("network").and_then(Value::as_object);
        let disks = obj.get("disk").and_then(Value::as_array);

        let mut sample = MetricsSample {
            cpu_percent: float_field(obj, &["cpuPercent", "cpu_percent"])
                .or_else(|| cpu.and_then(|c| float_field(c, &["usage_percent", "usagePercent"]))),
            load_avg_1: float_field(obj, &["loadAvg1", "load_avg_1"])
                .or_else(|| cpu.and_then(|c| float_field(c, &["load_avg_1", "loadAvg1"]))),
            load_avg_5: float_field(obj, &["loadAvg5", "load_avg_5"])
                .or_else(|| cpu.and_then(|c| float_field(c, &["load_avg_5", "loadAvg5"]))),
            load_avg_15: float_field(obj, &["loadAvg15", "load_avg_15"])
                .or_else(|| cpu.and_then(|c| float_field(c, &["load_avg_15", "loadAvg15"]))),
            cpu_steal: float_field(obj, &["cpuSteal", "cpu_steal"]),
            core_count: counter_field(obj, &["coreCount", "core_count"])
                .or_else(|| cpu.and_then(|c| counter_field(c, &["core_count", "coreCount"]))),
            mem_used: counter_field(obj, &["memUsed", "memoryUsed", "mem_used"])
                .or_else(|| memory.and_then(|m| counter_field(m, &["used_bytes", "usedBytes"]))),
            mem_total: counter_field(obj, &["memTotal", "memoryTotal", "mem_total"])
                .or_else(|| memory.and_then(|m| counter_field(m, &["total_bytes", "totalBytes"]))),
            mem_cached: counter_field(obj, &["memCached", "mem_cached"]).or_else(|| {
                memory.and_then(|m| counter_field(m, &["cached_bytes", "cachedBytes"]))
            }),
            swap_used: counter_field(obj, &["swapUsed", "swap_used"]).or_else(|| {
                memory.and_then(|m| counter_field(m, &["swap_used_bytes", "swapUsedBytes"]))
            }),
            swap_total: counter_field(obj, &["swapTotal", "swap_total"]).or_else(|| {
                memory.and_then(|m| counter_field(m, &["swap_total_bytes", "swapTotalBytes"]))
            }),
            disk_used: counter_field(obj, &["diskUsed", "disk_used"]),
            disk_total: counter_field(obj, &["diskTotal", "disk_total"]),
            disk_read_bps: float_field(obj, &["diskReadBps", "disk_read_bps"]),
            disk_write_bps: float_field(obj, &["diskWriteBps", "disk_write_bps"]),
            net_bytes_sent: counter_field(obj, &["netBytesSent", "net_bytes_sent"])
                .or_else(|| network.and_then(|n| counter_field(n, &["bytes_sent", "bytesSent"]))),
            net_bytes_recv: counter_field(obj, &["netBytesRecv", "net_bytes_recv"])
                .or_else(|| network.and_then(|n| counter_field(n, &["bytes_recv", "bytesRecv"]))),
            net_packets_sent: counter_field(obj, &["netPacketsSent", "net_packets_sent"]).or_else(
                || network.and_then(|n| counter_field(n, &["packets_sent", "packetsSent"])),
            ),
            net_packets_recv: counter_field(obj, &["netPacketsRecv", "net_packets_recv"]).or_else(
                || network.and_then(|n| counter_field(n, &["packets_recv", "packetsRecv"])),
            ),
            timestamp: obj
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(|ts| parse_timestamp(Some(ts))),
        };

        if let Some(disks) = disks {
            let mut used = 0u64;
            let mut total = 0u64;
            for disk in disks.iter().filter_map(Value::as_object) {
                used = used.saturating_add(counter_field(disk, &["used_bytes", "usedBytes"]).unwrap_or(0));
                total =
                    total.saturating_add(counter_field(disk, &["total_bytes", "totalBytes"]).unwrap_or(0));
            }
            if !disks.is_empty() {
                sample.disk_used = sample.disk_used.or(Some(used));
                sample.disk_total = sample.disk_total.or(Some(total));
            }
        }

        Ok(sample)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub instance_id: String,
    pub timestamp: DateTime<Utc>,
    pub sample: MetricsSample,
}

impl MetricRecord {
    pub fn from_sample(instance_id: &str, sample: MetricsSample, received_at: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            timestamp: sample.timestamp.unwrap_or(received_at),
            sample,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    /// Case-insensitive; anything unrecognised is `Info`.
    pub fn normalize(input: &str) -> Self {
        match input.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" | "err" | "fatal" | "critical" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogSource {
    Agent,
    Extension,
    Build,
    App,
    System,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::Agent => "AGENT",
            LogSource::Extension => "EXTENSION",
            LogSource::Build => "BUILD",
            LogSource::App => "APP",
            LogSource::System => "SYSTEM",
        }
    }

    /// Uses the text before the first `:`; anything unrecognised is `System`.
    pub fn normalize(input: &str) -> Self {
        let head = input.split(':').next().unwrap_or_default();
        match head.trim().to_ascii_lowercase().as_str() {
            "agent" => LogSource::Agent,
            "extension" => LogSource::Extension,
            "build" => LogSource::Build,
            "app" => LogSource::App,
            _ => LogSource::System,
        }
    }
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One log line as sent by an agent, before normalisation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub source: String,
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default, alias = "deployment_id")]
    pub deployment_id: Option<String>,
}

impl LogLine {
    /// Batches arrive as `{lines:[...]}`, `{entries:[...]}` or a bare array.
    pub fn batch_from_value(data: &Value) -> Result<Vec<LogLine>, String> {
        let lines = match data {
            Value::Array(items) => items,
            Value::Object(obj) => obj
                .get("lines")
                .or_else(|| obj.get("entries"))
                .and_then(Value::as_array)
                .ok_or_else(|| "log batch requires a lines array".to_string())?,
            _ => return Err("log batch must be an array or object".to_string()),
        };
        lines
            .iter()
            .map(|line| serde_json::from_value(line.clone()).map_err(|err| err.to_string()))
            .collect()
    }
}

/// Normalised log record handed to the ingest interface.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub instance_id: String,
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
    pub metadata: Option<Value>,
    pub deployment_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn from_line(instance_id: &str, line: LogLine, received_at: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            level: LogLevel::normalize(&line.level),
            source: LogSource::normalize(&line.source),
            timestamp: parse_timestamp(line.timestamp.as_deref()).unwrap_or(received_at),
            message: line.message,
            metadata: line.metadata,
            deployment_id: line.deployment_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Deploy,
    Redeploy,
    Connect,
    Disconnect,
    Backup,
    Restore,
    Start,
    Stop,
    Suspend,
    Resume,
    Destroy,
    Error,
    HeartbeatLost,
    HeartbeatRecovered,
    ExtensionInstalled,
    ExtensionRemoved,
    Custom,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Deploy => "DEPLOY",
            EventType::Redeploy => "REDEPLOY",
            EventType::Connect => "CONNECT",
            EventType::Disconnect => "DISCONNECT",
            EventType::Backup => "BACKUP",
            EventType::Restore => "RESTORE",
            EventType::Start => "START",
            EventType::Stop => "STOP",
            EventType::Suspend => "SUSPEND",
            EventType::Resume => "RESUME",
            EventType::Destroy => "DESTROY",
            EventType::Error => "ERROR",
            EventType::HeartbeatLost => "HEARTBEAT_LOST",
            EventType::HeartbeatRecovered => "HEARTBEAT_RECOVERED",
            EventType::ExtensionInstalled => "EXTENSION_INSTALLED",
            EventType::ExtensionRemoved => "EXTENSION_REMOVED",
            EventType::Custom => "CUSTOM",
        }
    }

    pub fn from_label(label: &str) -> Self {
        let normalized = label
            .trim()
            .to_ascii_lowercase()
            .replace(|c: char| matches!(c, '-' | ' ' | '.' | ':'), "_");
        match normalized.as_str() {
            "deploy" | "deployed" => EventType::Deploy,
            "redeploy" | "redeployed" => EventType::Redeploy,
            "connect" | "connected" => EventType::Connect,
            "disconnect" | "disconnected" => EventType::Disconnect,
            "backup" => EventType::Backup,
            "restore" => EventType::Restore,
            "start" | "started" => EventType::Start,
            "stop" | "stopped" => EventType::Stop,
            "suspend" | "suspended" => EventType::Suspend,
            "resume" | "resumed" => EventType::Resume,
            "destroy" | "destroyed" => EventType::Destroy,
            "error" | "failed" => EventType::Error,
            "heartbeat_lost" => EventType::HeartbeatLost,
            "heartbeat_recovered" => EventType::HeartbeatRecovered,
            "extension_installed" | "extension_install" => EventType::ExtensionInstalled,
            "extension_removed" | "extension_remove" => EventType::ExtensionRemoved,
            _ => EventType::Custom,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default, rename = "event_type")]
    pub event_type_snake: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub instance_id: String,
    pub event_type: EventType,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

impl EventPayload {
    /// `eventType` wins over `event_type`, which wins over `type`.
    pub fn label(&self) -> Option<&str> {
        self.event_type
            .as_deref()
            .or(self.event_type_snake.as_deref())
            .or(self.kind.as_deref())
    }
}

impl EventRecord {
    /// Unmapped labels become `Custom` with the label kept as `metadata.rawEventType`.
    pub fn from_payload(instance_id: &str, payload: EventPayload, received_at: DateTime<Utc>) -> Self {
        let label = payload.label().unwrap_or_default().to_string();
        let event_type = EventType::from_label(&label);
        let mut metadata = payload.metadata.unwrap_or_default();
        if let Some(message) = payload.message {
            metadata.entry("message").or_insert(Value::String(message));
        }
        if event_type == EventType::Custom && !label.trim().is_empty() {
            metadata.insert("rawEventType".to_string(), Value::String(label));
        }
        Self {
            instance_id: instance_id.to_string(),
            event_type,
            metadata: Value::Object(metadata),
            timestamp: parse_timestamp(payload.timestamp.as_deref()).unwrap_or(received_at),
        }
    }
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|ts| DateTime::parse_from_rfc3339(ts.trim()).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

fn float_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| obj.get(*key).and_then(float_from_value))
}

fn counter_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| obj.get(*key).and_then(counter_from_value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn level_normalization() {
        assert_eq!(LogLevel::normalize("WARNING"), LogLevel::Warn);
        assert_eq!(LogLevel::normalize("warn"), LogLevel::Warn);
        assert_eq!(LogLevel::normalize("Err"), LogLevel::Error);
        assert_eq!(LogLevel::normalize("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::normalize("bogus"), LogLevel::Info);
        assert_eq!(LogLevel::normalize(""), LogLevel::Info);
    }

    #[test]
    fn source_normalization_uses_prefix() {
        assert_eq!(LogSource::normalize("agent:shell"), LogSource::Agent);
        assert_eq!(LogSource::normalize("AGENT"), LogSource::Agent);
        assert_eq!(LogSource::normalize("extension:docker:pull"), LogSource::Extension);
        assert_eq!(LogSource::normalize("??"), LogSource::System);
        assert_eq!(LogSource::normalize(""), LogSource::System);
    }

    #[test]
    fn heartbeat_sample_defaults_and_string_counters() {
        let sample: HeartbeatSample = serde_json::from_value(json!({
            "cpuPercent": 42,
            "memoryUsed": "18446744073709551000",
            "memoryTotal": 2048,
            "uptime_seconds": 17
        }))
        .expect("sample");
        assert_eq!(sample.cpu_percent, 42.0);
        assert_eq!(sample.memory_used, 18_446_744_073_709_551_000);
        assert_eq!(sample.memory_total, 2048);
        assert_eq!(sample.disk_used, 0);
        assert_eq!(sample.uptime, 17);
    }

    #[test]
    fn heartbeat_sample_rejects_fractional_counter() {
        let result = serde_json::from_value::<HeartbeatSample>(json!({"memoryUsed": 10.5}));
        assert!(result.is_err());
    }

    #[test]
    fn metrics_flat_shape() {
        let sample = MetricsSample::from_value(&json!({
            "cpuPercent": 12.5,
            "loadAvg1": 0.4,
            "memUsed": 1000,
            "memTotal": "4000",
            "diskReadBps": 512.0,
            "netBytesRecv": 77
        }))
        .expect("sample");
        assert_eq!(sample.cpu_percent, Some(12.5));
        assert_eq!(sample.load_avg_1, Some(0.4));
        assert_eq!(sample.mem_total, Some(4000));
        assert_eq!(sample.disk_read_bps, Some(512.0));
        assert_eq!(sample.net_bytes_recv, Some(77));
        assert_eq!(sample.swap_used, None);
    }

    #[test]
    fn metrics_nested_agent_shape() {
        let sample = MetricsSample::from_value(&json!({
            "cpu": {"usage_percent": 33.0, "load_avg_5": 1.5, "core_count": 4},
            "memory": {"used_bytes": 10, "total_bytes": 20, "swap_used_bytes": 1},
            "disk": [
                {"mount_point": "/", "used_bytes": 5, "total_bytes": 50},
                {"mount_point": "/data", "used_bytes": 7, "total_bytes": 70}
            ],
            "network": {"bytes_sent": 9, "packets_recv": 3},
            "timestamp": "2026-03-01T10:00:00Z"
        }))
        .expect("sample");
        assert_eq!(sample.cpu_percent, Some(33.0));
        assert_eq!(sample.load_avg_5, Some(1.5));
        assert_eq!(sample.core_count, Some(4));
        assert_eq!(sample.mem_used, Some(10));
        assert_eq!(sample.swap_used, Some(1));
        assert_eq!(sample.disk_used, Some(12));
        assert_eq!(sample.disk_total, Some(120));
        assert_eq!(sample.net_bytes_sent, Some(9));
        assert_eq!(sample.net_packets_recv, Some(3));
        assert!(sample.timestamp.is_some());
    }

    #[test]
    fn metrics_requires_object() {
        assert!(MetricsSample::from_value(&json!([1, 2])).is_err());
    }

    #[test]
    fn log_batch_shapes() {
        let lines = LogLine::batch_from_value(&json!({
            "lines": [
                {"level": "warning", "source": "agent:shell", "message": "a"},
                {"level": "bogus", "source": "??", "message": "b"}
            ]
        }))
        .expect("batch");
        assert_eq!(lines.len(), 2);

        let bare = LogLine::batch_from_value(&json!([{"message": "c"}])).expect("bare");
        assert_eq!(bare.len(), 1);

        assert!(LogLine::batch_from_value(&json!({"lines": "nope"})).is_err());
    }

    #[test]
    fn log_entry_is_normalized() {
        let now = Utc::now();
        let line: LogLine = serde_json::from_value(json!({
            "level": "WARNING",
            "source": "agent:shell",
            "message": "disk almost full"
        }))
        .expect("line");
        let entry = LogEntry::from_line("i-1", line, now);
        assert_eq!(entry.level, LogLevel::Warn);
        assert_eq!(entry.source, LogSource::Agent);
        assert_eq!(entry.timestamp, now);
    }

    #[test]
    fn event_type_mapping() {
        assert_eq!(EventType::from_label("deploy"), EventType::Deploy);
        assert_eq!(EventType::from_label("Heartbeat-Lost"), EventType::HeartbeatLost);
        assert_eq!(EventType::from_label("extension.installed"), EventType::ExtensionInstalled);
        assert_eq!(EventType::from_label("weird"), EventType::Custom);
    }

    #[test]
    fn custom_event_keeps_raw_label() {
        let payload: EventPayload = serde_json::from_value(json!({
            "event_type": "snapshot_taken",
            "message": "nightly",
            "metadata": {"size": "12G"}
        }))
        .expect("payload");
        let record = EventRecord::from_payload("i-1", payload, Utc::now());
        assert_eq!(record.event_type, EventType::Custom);
        assert_eq!(record.metadata["rawEventType"], "snapshot_taken");
        assert_eq!(record.metadata["message"], "nightly");
        assert_eq!(record.metadata["size"], "12G");
    }

    #[test]
    fn event_label_tolerates_every_spelling_at_once() {
        let payload: EventPayload = serde_json::from_value(json!({
            "eventType": "deploy",
            "event_type": "backup",
            "type": "lifecycle",
            "message": "m"
        }))
        .expect("payload");
        assert_eq!(payload.label(), Some("deploy"));
        let record = EventRecord::from_payload("i-1", payload, Utc::now());
        assert_eq!(record.event_type, EventType::Deploy);
        assert!(record.metadata.get("rawEventType").is_none());

        let payload: EventPayload =
            serde_json::from_value(json!({"type": "STOP"})).expect("payload");
        assert_eq!(
            EventRecord::from_payload("i-1", payload, Utc::now()).event_type,
            EventType::Stop
        );
    }
}
