pub mod protocol;
pub mod telemetry;
pub mod topics;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Durable lifecycle status of a provisioned instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Deploying,
    Running,
    Stopped,
    Suspended,
    Error,
    Unknown,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Deploying => "DEPLOYING",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Stopped => "STOPPED",
            InstanceStatus::Suspended => "SUSPENDED",
            InstanceStatus::Error => "ERROR",
            InstanceStatus::Unknown => "UNKNOWN",
        }
    }

    /// Statuses a heartbeat is allowed to heal back to `Running`.
    pub const HEALABLE: [InstanceStatus; 2] = [InstanceStatus::Error, InstanceStatus::Unknown];
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_ascii_uppercase();
        match normalized.as_str() {
            "DEPLOYING" => Ok(InstanceStatus::Deploying),
            "RUNNING" => Ok(InstanceStatus::Running),
            "STOPPED" => Ok(InstanceStatus::Stopped),
            "SUSPENDED" => Ok(InstanceStatus::Suspended),
            "ERROR" => Ok(InstanceStatus::Error),
            "UNKNOWN" => Ok(InstanceStatus::Unknown),
            other => Err(format!("Unknown instance status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    Admin,
    Operator,
    Developer,
    Viewer,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "ADMIN",
            UserRole::Operator => "OPERATOR",
            UserRole::Developer => "DEVELOPER",
            UserRole::Viewer => "VIEWER",
        }
    }
}

impl Default for UserRole {
    fn default() -> Self {
        Self::Viewer
    }
}

impl FromStr for UserRole {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_ascii_uppercase();
        match normalized.as_str() {
            "ADMIN" => Ok(UserRole::Admin),
            "OPERATOR" => Ok(UserRole::Operator),
            "DEVELOPER" => Ok(UserRole::Developer),
            "VIEWER" => Ok(UserRole::Viewer),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

/// Identity resolved from an API key at upgrade time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub api_key_id: String,
    pub role: UserRole,
    pub expires_at: Option<DateTime<Utc>>,
    pub instance_id: Option<String>,
}

impl Principal {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// Lowercase hex SHA-256 of a raw API key, the form credentials are looked up by.
pub fn hash_credential(raw: &str) -> String {
    format!("{:x}", Sha256::digest(raw.trim().as_bytes()))
}

/// Reads a 64-bit counter sent either as a JSON integer or a decimal string.
pub fn counter_from_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64().or_else(|| {
            number
                .as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0 && *f < 9.0e15)
                .map(|f| f as u64)
        }),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    }
}

/// Reads a float sent either as a JSON number or a numeric string.
pub fn float_from_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

pub(crate) fn deserialize_counter<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    if val.is_null() {
        return Ok(0);
    }
    counter_from_value(&val)
        .ok_or_else(|| serde::de::Error::custom("expected unsigned integer or decimal string"))
}

pub(crate) fn deserialize_float<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    if val.is_null() {
        return Ok(0.0);
    }
    float_from_value(&val).ok_or_else(|| serde::de::Error::custom("expected number"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("running".parse::<InstanceStatus>(), Ok(InstanceStatus::Running));
        assert_eq!(" Error ".parse::<InstanceStatus>(), Ok(InstanceStatus::Error));
        assert!("exploded".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn credential_hash_is_lowercase_hex() {
        let hash = hash_credential("sk-test");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(hash, hash_credential("  sk-test\n"));
    }

    #[test]
    fn principal_expiry_is_inclusive() {
        let now = Utc::now();
        let mut principal = Principal {
            user_id: "u-1".to_string(),
            api_key_id: "k-1".to_string(),
            role: UserRole::Developer,
            expires_at: None,
            instance_id: None,
        };
        assert!(!principal.is_expired(now));
        principal.expires_at = Some(now);
        assert!(principal.is_expired(now));
        principal.expires_at = Some(now + Duration::seconds(5));
        assert!(!principal.is_expired(now));
    }

    #[test]
    fn counters_accept_strings_and_integers_but_not_fractions() {
        assert_eq!(counter_from_value(&serde_json::json!(1024)), Some(1024));
        assert_eq!(
            counter_from_value(&serde_json::json!("18446744073709551615")),
            Some(u64::MAX)
        );
        assert_eq!(counter_from_value(&serde_json::json!(12.5)), None);
        assert_eq!(counter_from_value(&serde_json::json!(-3)), None);
        assert_eq!(counter_from_value(&serde_json::json!(null)), None);
    }
}
