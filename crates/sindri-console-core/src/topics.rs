//! Pub/sub topic and key-value key naming shared with every other console process.

use std::time::Duration;

pub const ONLINE_TTL: Duration = Duration::from_secs(30);
pub const COMMAND_RESULT_TTL: Duration = Duration::from_secs(120);

pub const ACTIVE_AGENTS_KEY: &str = "sindri:agents:active";
pub const INSTANCE_TOPIC_PATTERN: &str = "sindri:instance:*";
pub const COMMAND_TOPIC_PATTERN: &str = "sindri:instance:*:commands";

const INSTANCE_PREFIX: &str = "sindri:instance:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceTopic {
    Heartbeat,
    Metrics,
    Logs,
    Events,
    Commands,
}

impl InstanceTopic {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceTopic::Heartbeat => "heartbeat",
            InstanceTopic::Metrics => "metrics",
            InstanceTopic::Logs => "logs",
            InstanceTopic::Events => "events",
            InstanceTopic::Commands => "commands",
        }
    }

    fn parse(suffix: &str) -> Option<Self> {
        match suffix {
            "heartbeat" => Some(InstanceTopic::Heartbeat),
            "metrics" => Some(InstanceTopic::Metrics),
            "logs" => Some(InstanceTopic::Logs),
            "events" => Some(InstanceTopic::Events),
            "commands" => Some(InstanceTopic::Commands),
            _ => None,
        }
    }
}

pub fn instance_topic(instance_id: &str, topic: InstanceTopic) -> String {
    format!("{INSTANCE_PREFIX}{instance_id}:{}", topic.as_str())
}

pub fn deployment_progress_topic(deployment_id: &str) -> String {
    format!("sindri:deployment:{deployment_id}:progress")
}

pub fn online_key(instance_id: &str) -> String {
    format!("{INSTANCE_PREFIX}online:{instance_id}")
}

pub fn command_result_key(correlation_id: &str) -> String {
    format!("sindri:cmd:result:{correlation_id}")
}

/// Splits `sindri:instance:<id>:<kind>` into its instance id and kind.
pub fn parse_instance_topic(topic: &str) -> Option<(&str, InstanceTopic)> {
    let rest = topic.strip_prefix(INSTANCE_PREFIX)?;
    let (instance_id, suffix) = rest.rsplit_once(':')?;
    if instance_id.is_empty() {
        return None;
    }
    Some((instance_id, InstanceTopic::parse(suffix)?))
}

/// Glob match where `*` spans any run of characters, `:` included.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == topic;
    }
    let mut rest = topic;
    for (idx, part) in parts.iter().enumerate() {
        if idx == 0 {
            let Some(stripped) = rest.strip_prefix(part) else {
                return false;
            };
            rest = stripped;
        } else if idx == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            let Some(pos) = rest.find(part) else {
                return false;
            };
            rest = &rest[pos + part.len()..];
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_match_console_conventions() {
        assert_eq!(
            instance_topic("i-1", InstanceTopic::Heartbeat),
            "sindri:instance:i-1:heartbeat"
        );
        assert_eq!(
            deployment_progress_topic("d-9"),
            "sindri:deployment:d-9:progress"
        );
        assert_eq!(online_key("i-1"), "sindri:instance:online:i-1");
        assert_eq!(command_result_key("abc123"), "sindri:cmd:result:abc123");
    }

    #[test]
    fn parses_instance_topics() {
        assert_eq!(
            parse_instance_topic("sindri:instance:i-1:metrics"),
            Some(("i-1", InstanceTopic::Metrics))
        );
        assert_eq!(
            parse_instance_topic("sindri:instance:fly:sea:7:events"),
            Some(("fly:sea:7", InstanceTopic::Events))
        );
        assert_eq!(parse_instance_topic("sindri:instance:i-1:bogus"), None);
        assert_eq!(parse_instance_topic("sindri:deployment:d-1:progress"), None);
        assert_eq!(parse_instance_topic("sindri:instance::logs"), None);
    }

    #[test]
    fn glob_matching() {
        assert!(topic_matches(INSTANCE_TOPIC_PATTERN, "sindri:instance:i-1:heartbeat"));
        assert!(topic_matches(COMMAND_TOPIC_PATTERN, "sindri:instance:i-1:commands"));
        assert!(!topic_matches(COMMAND_TOPIC_PATTERN, "sindri:instance:i-1:metrics"));
        assert!(!topic_matches(INSTANCE_TOPIC_PATTERN, "sindri:deployment:d-1:progress"));
        assert!(topic_matches("exact", "exact"));
        assert!(!topic_matches("exact", "exactly"));
    }
}
