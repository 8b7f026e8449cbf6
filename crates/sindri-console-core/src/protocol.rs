use crate::telemetry::{EventPayload, HeartbeatSample, LogLine, MetricsSample};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Heartbeat,
    Metrics,
    Logs,
    Events,
    Terminal,
    Commands,
    System,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Heartbeat => "heartbeat",
            Channel::Metrics => "metrics",
            Channel::Logs => "logs",
            Channel::Events => "events",
            Channel::Terminal => "terminal",
            Channel::Commands => "commands",
            Channel::System => "system",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ProtocolError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "heartbeat" => Ok(Channel::Heartbeat),
            "metrics" => Ok(Channel::Metrics),
            "logs" => Ok(Channel::Logs),
            "events" => Ok(Channel::Events),
            "terminal" => Ok(Channel::Terminal),
            "commands" => Ok(Channel::Commands),
            "system" => Ok(Channel::System),
            other => Err(ProtocolError::UnknownChannel(other.to_string())),
        }
    }
}

/// Message type; every variant belongs to exactly one [`Channel`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    HeartbeatPing,
    HeartbeatPong,
    MetricsUpdate,
    LogLine,
    LogBatch,
    Event,
    TerminalCreate,
    TerminalCreated,
    TerminalInput,
    TerminalOutput,
    TerminalResize,
    TerminalClose,
    TerminalClosed,
    CommandDispatch,
    CommandResult,
    Subscribe,
    Unsubscribe,
    Ack,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::HeartbeatPing => "heartbeat_ping",
            MessageType::HeartbeatPong => "heartbeat_pong",
            MessageType::MetricsUpdate => "metrics_update",
            MessageType::LogLine => "log_line",
            MessageType::LogBatch => "log_batch",
            MessageType::Event => "event",
            MessageType::TerminalCreate => "terminal_create",
            MessageType::TerminalCreated => "terminal_created",
            MessageType::TerminalInput => "terminal_input",
            MessageType::TerminalOutput => "terminal_output",
            MessageType::TerminalResize => "terminal_resize",
            MessageType::TerminalClose => "terminal_close",
            MessageType::TerminalClosed => "terminal_closed",
            MessageType::CommandDispatch => "command_dispatch",
            MessageType::CommandResult => "command_result",
            MessageType::Subscribe => "subscribe",
            MessageType::Unsubscribe => "unsubscribe",
            MessageType::Ack => "ack",
            MessageType::Error => "error",
        }
    }

    pub fn channel(&self) -> Channel {
        match self {
            MessageType::HeartbeatPing | MessageType::HeartbeatPong => Channel::Heartbeat,
            MessageType::MetricsUpdate => Channel::Metrics,
            MessageType::LogLine | MessageType::LogBatch => Channel::Logs,
            MessageType::Event => Channel::Events,
            MessageType::TerminalCreate
            | MessageType::TerminalCreated
            | MessageType::TerminalInput
            | MessageType::TerminalOutput
            | MessageType::TerminalResize
            | MessageType::TerminalClose
            | MessageType::TerminalClosed => Channel::Terminal,
            MessageType::CommandDispatch | MessageType::CommandResult => Channel::Commands,
            MessageType::Subscribe
            | MessageType::Unsubscribe
            | MessageType::Ack
            | MessageType::Error => Channel::System,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(input.to_string()))
            .map_err(|_| ProtocolError::UnknownType(input.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("message type {kind} does not belong to channel {channel}")]
    ChannelMismatch { channel: Channel, kind: MessageType },
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: MessageType, reason: String },
    #[error("envelope encode failed: {0}")]
    Encode(String),
}

/// The unit of wire communication on every gateway connection.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub channel: Channel,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    channel: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    instance_id: Option<String>,
    #[serde(default)]
    correlation_id: Option<String>,
}

impl Envelope {
    pub fn new(kind: MessageType, data: Value) -> Self {
        Self {
            channel: kind.channel(),
            kind,
            data,
            instance_id: None,
            correlation_id: None,
        }
    }

    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Direct acknowledgement sent back to an agent after a heartbeat.
    pub fn heartbeat_ack(instance_id: &str) -> Self {
        Self::new(MessageType::HeartbeatPong, serde_json::json!({ "ok": true }))
            .with_instance(instance_id)
    }

    /// Same payload re-labelled as a pong, as published for live viewers.
    pub fn to_pong(&self, instance_id: &str) -> Self {
        Self {
            channel: Channel::Heartbeat,
            kind: MessageType::HeartbeatPong,
            data: self.data.clone(),
            instance_id: Some(instance_id.to_string()),
            correlation_id: self.correlation_id.clone(),
        }
    }

    /// Validates `data` against the shape implied by `(channel, type)`.
    pub fn payload(&self) -> Result<Payload, ProtocolError> {
        let invalid = |reason: String| ProtocolError::InvalidPayload {
            kind: self.kind,
            reason,
        };
        match self.kind {
            MessageType::HeartbeatPing | MessageType::HeartbeatPong => {
                let sample = if self.data.is_null() {
                    HeartbeatSample::default()
                } else {
                    serde_json::from_value(self.data.clone())
                        .map_err(|err| invalid(err.to_string()))?
                };
                Ok(Payload::Heartbeat(sample))
            }
            MessageType::MetricsUpdate => MetricsSample::from_value(&self.data)
                .map(Payload::Metrics)
                .map_err(invalid),
            MessageType::LogLine => {
                let line: LogLine = serde_json::from_value(self.data.clone())
                    .map_err(|err| invalid(err.to_string()))?;
                Ok(Payload::LogLine(line))
            }
            MessageType::LogBatch => LogLine::batch_from_value(&self.data)
                .map(Payload::LogBatch)
                .map_err(invalid),
            MessageType::Event => {
                let event: EventPayload = serde_json::from_value(self.data.clone())
                    .map_err(|err| invalid(err.to_string()))?;
                Ok(Payload::Event(event))
            }
            MessageType::TerminalCreate
            | MessageType::TerminalCreated
            | MessageType::TerminalInput
            | MessageType::TerminalOutput
            | MessageType::TerminalResize
            | MessageType::TerminalClose
            | MessageType::TerminalClosed => Ok(Payload::Terminal),
            MessageType::CommandDispatch => Ok(Payload::CommandDispatch),
            MessageType::CommandResult => Ok(Payload::CommandResult(self.data.clone())),
            MessageType::Subscribe | MessageType::Unsubscribe => {
                let instance_id = self
                    .data
                    .get("instanceId")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| invalid("missing instanceId".to_string()))?;
                let instance_id = instance_id.to_string();
                if self.kind == MessageType::Subscribe {
                    Ok(Payload::Subscribe { instance_id })
                } else {
                    Ok(Payload::Unsubscribe { instance_id })
                }
            }
            MessageType::Ack => Ok(Payload::Ack),
            MessageType::Error => Ok(Payload::Error),
        }
    }
}

/// Typed view of an envelope's `data`, keyed by `(channel, type)`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Heartbeat(HeartbeatSample),
    Metrics(MetricsSample),
    LogLine(LogLine),
    LogBatch(Vec<LogLine>),
    Event(EventPayload),
    Terminal,
    CommandDispatch,
    CommandResult(Value),
    Subscribe { instance_id: String },
    Unsubscribe { instance_id: String },
    Ack,
    Error,
}

pub fn encode_envelope(envelope: &Envelope) -> Result<String, ProtocolError> {
    serde_json::to_string(envelope).map_err(|err| ProtocolError::Encode(err.to_string()))
}

pub fn decode_envelope(bytes: &[u8], max_message_bytes: usize) -> Result<Envelope, ProtocolError> {
    if bytes.len() > max_message_bytes {
        return Err(ProtocolError::Oversized {
            size: bytes.len(),
            max: max_message_bytes,
        });
    }
    let raw: RawEnvelope =
        serde_json::from_slice(bytes).map_err(|err| ProtocolError::Malformed(err.to_string()))?;
    let channel = raw.channel.parse::<Channel>()?;
    let kind = raw.kind.parse::<MessageType>()?;
    if kind.channel() != channel {
        return Err(ProtocolError::ChannelMismatch { channel, kind });
    }
    Ok(Envelope {
        channel,
        kind,
        data: raw.data,
        instance_id: non_empty(raw.instance_id),
        correlation_id: non_empty(raw.correlation_id),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
