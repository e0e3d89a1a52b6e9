//! Message envelope: the unit of communication between nodes.
//!
//! A [`Message`] is addressed (sender, optional recipient), prioritized,
//! uniquely identified and timestamped. The payload is opaque JSON; the
//! `metadata` map carries protocol tags such as `coordination_type`,
//! `session_id` and the backpressure `backpressure_signal` marker.
//!
//! Messages are never mutated after dispatch. Protocol wrappers only enrich
//! metadata while building a message.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Metadata key for the coordination protocol type tag.
pub const META_COORDINATION_TYPE: &str = "coordination_type";
/// Metadata key for the session a message belongs to.
pub const META_SESSION_ID: &str = "session_id";
/// Metadata key marking flow-control (PAUSE/RESUME) messages.
pub const META_BACKPRESSURE_SIGNAL: &str = "backpressure_signal";
/// Metadata key for the requested reliability level on the receive path.
pub const META_RELIABILITY: &str = "reliability";

/// Default hop budget for a new message.
pub const DEFAULT_TTL: u32 = 10;

/// Kind of message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Ping,
    Pong,
    Data,
    Request,
    Response,
    Command,
    Status,
    Event,
    Query,
    Heartbeat,
    Error,
    Join,
    Leave,
    Restructure,
    Broadcast,
    Multicast,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Data => "data",
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Command => "command",
            MessageType::Status => "status",
            MessageType::Event => "event",
            MessageType::Query => "query",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Error => "error",
            MessageType::Join => "join",
            MessageType::Leave => "leave",
            MessageType::Restructure => "restructure",
            MessageType::Broadcast => "broadcast",
            MessageType::Multicast => "multicast",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message priority. Higher values are more urgent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

/// An addressed, prioritized unit of inter-node communication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id (UUID v4).
    pub id: String,
    pub message_type: MessageType,
    pub payload: Value,
    pub sender_id: String,
    /// `None` means broadcast / unaddressed.
    pub recipient_id: Option<String>,
    pub priority: MessagePriority,
    /// Creation time, Unix epoch milliseconds.
    pub timestamp_ms: u64,
    /// Remaining hop budget.
    pub ttl: u32,
    pub requires_ack: bool,
    /// Id of the message this one answers (acks, error responses).
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Message {
    /// Create a message with a fresh id and the current timestamp.
    pub fn new(message_type: MessageType, sender_id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            payload,
            sender_id: sender_id.into(),
            recipient_id: None,
            priority: MessagePriority::Normal,
            timestamp_ms: epoch_millis(),
            ttl: DEFAULT_TTL,
            requires_ack: false,
            correlation_id: None,
            metadata: HashMap::new(),
        }
    }

    /// Address the message to a recipient.
    #[must_use]
    pub fn to(mut self, recipient_id: impl Into<String>) -> Self {
        self.recipient_id = Some(recipient_id.into());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_ack(mut self, requires_ack: bool) -> Self {
        self.requires_ack = requires_ack;
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Recipient id, or `"*"` for unaddressed messages. Used for logging.
    pub fn recipient_label(&self) -> &str {
        self.recipient_id.as_deref().unwrap_or("*")
    }

    /// String metadata value, if present.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Boolean metadata value; missing or non-boolean reads as `false`.
    pub fn metadata_flag(&self, key: &str) -> bool {
        self.metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// The `coordination_type` protocol tag.
    pub fn coordination_type(&self) -> Option<&str> {
        self.metadata_str(META_COORDINATION_TYPE)
    }

    /// The `session_id` protocol tag.
    pub fn session_id(&self) -> Option<&str> {
        self.metadata_str(META_SESSION_ID)
    }

    /// Age of the message relative to now.
    pub fn age(&self) -> Duration {
        Duration::from_millis(epoch_millis().saturating_sub(self.timestamp_ms))
    }

    /// True if the message is older than `max_age`.
    pub fn is_expired(&self, max_age: Duration) -> bool {
        self.age() > max_age
    }

    /// Spend one hop. Returns `false` once the budget is exhausted.
    pub fn decrement_ttl(&mut self) -> bool {
        if self.ttl == 0 {
            return false;
        }
        self.ttl -= 1;
        self.ttl > 0
    }

    /// Build the acknowledgment for this message.
    ///
    /// The ack is a high-priority RESPONSE addressed back to the sender with
    /// `correlation_id` set to this message's id.
    pub fn create_ack(&self, sender_id: impl Into<String>) -> Message {
        Message::new(
            MessageType::Response,
            sender_id,
            json!({ "ack": true, "original_message_id": self.id }),
        )
        .to(self.sender_id.clone())
        .with_priority(MessagePriority::High)
        .with_correlation_id(self.id.clone())
    }

    /// True if this message is an acknowledgment produced by [`create_ack`](Self::create_ack).
    pub fn is_ack(&self) -> bool {
        self.message_type == MessageType::Response
            && self.correlation_id.is_some()
            && self.payload.get("ack").and_then(Value::as_bool).unwrap_or(false)
    }

    /// Build an error response to this message.
    pub fn create_error_response(
        &self,
        sender_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Message {
        Message::new(
            MessageType::Error,
            sender_id,
            json!({ "error": error.into(), "original_message_id": self.id }),
        )
        .to(self.sender_id.clone())
        .with_priority(MessagePriority::High)
        .with_correlation_id(self.id.clone())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short_id: String = self.id.chars().take(8).collect();
        write!(
            f,
            "Message({}, {}->{}, id={})",
            self.message_type,
            self.sender_id,
            self.recipient_label(),
            short_id
        )
    }
}

/// Current time as Unix epoch milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
