//! Coordination protocol vocabulary.
//!
//! Coordination messages are ordinary [`Message`]s of type `command` whose
//! metadata carries two tags:
//!
//! - `coordination_type`: the wire name, e.g. `coord_ready`
//! - `session_id`: the coordination session the message belongs to
//!
//! Wire names are parsed case-insensitively and the `coord_` prefix is
//! optional, so `COORD_READY`, `coord_ready` and `ready` are equivalent.

use crate::error::{CoordinationError, Result};
use crate::message::{
    epoch_millis, Message, MessagePriority, MessageType, META_COORDINATION_TYPE, META_SESSION_ID,
};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default per-message timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default retry budget for coordination sends.
pub const MAX_RETRIES: u32 = 3;
/// Default heartbeat cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Coordination message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinationMessageType {
    // Parent → child
    Init,
    Command,
    Sync,
    Heartbeat,
    Shutdown,
    // Child → parent
    Ack,
    Status,
    Error,
    Ready,
    Complete,
}

/// Which way a coordination message travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ParentToChild,
    ChildToParent,
}

impl CoordinationMessageType {
    pub const ALL: [CoordinationMessageType; 10] = [
        CoordinationMessageType::Init,
        CoordinationMessageType::Command,
        CoordinationMessageType::Sync,
        CoordinationMessageType::Heartbeat,
        CoordinationMessageType::Shutdown,
        CoordinationMessageType::Ack,
        CoordinationMessageType::Status,
        CoordinationMessageType::Error,
        CoordinationMessageType::Ready,
        CoordinationMessageType::Complete,
    ];

    /// Wire name carried in the `coordination_type` metadata tag.
    pub fn wire_name(&self) -> &'static str {
        match self {
            CoordinationMessageType::Init => "coord_init",
            CoordinationMessageType::Command => "coord_command",
            CoordinationMessageType::Sync => "coord_sync",
            CoordinationMessageType::Heartbeat => "coord_heartbeat",
            CoordinationMessageType::Shutdown => "coord_shutdown",
            CoordinationMessageType::Ack => "coord_ack",
            CoordinationMessageType::Status => "coord_status",
            CoordinationMessageType::Error => "coord_error",
            CoordinationMessageType::Ready => "coord_ready",
            CoordinationMessageType::Complete => "coord_complete",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            CoordinationMessageType::Init
            | CoordinationMessageType::Command
            | CoordinationMessageType::Sync
            | CoordinationMessageType::Heartbeat
            | CoordinationMessageType::Shutdown => Direction::ParentToChild,
            _ => Direction::ChildToParent,
        }
    }

    /// How long to wait for the exchange this message starts.
    pub fn timeout(&self) -> Duration {
        match self {
            CoordinationMessageType::Init => Duration::from_secs(60),
            CoordinationMessageType::Command => Duration::from_secs(120),
            CoordinationMessageType::Sync => Duration::from_secs(30),
            CoordinationMessageType::Heartbeat => Duration::from_secs(10),
            CoordinationMessageType::Shutdown => Duration::from_secs(30),
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Types allowed to follow this one, or `None` if the table has no
    /// entry for it.
    pub fn allowed_successors(&self) -> Option<&'static [CoordinationMessageType]> {
        use CoordinationMessageType::*;
        match self {
            Init => Some(&[Ready, Error]),
            Ready => Some(&[Command, Sync, Heartbeat, Shutdown]),
            Command => Some(&[Complete, Error]),
            Complete => Some(&[Command, Sync, Heartbeat, Shutdown]),
            _ => None,
        }
    }
}

impl fmt::Display for CoordinationMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl FromStr for CoordinationMessageType {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().to_ascii_lowercase();
        let bare = lowered.strip_prefix("coord_").unwrap_or(&lowered);
        Self::ALL
            .into_iter()
            .find(|t| t.wire_name().strip_prefix("coord_") == Some(bare))
            .ok_or_else(|| CoordinationError::UnknownMessageType(s.to_string()))
    }
}

/// A [`Message`] viewed through the coordination protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinationMessage {
    pub coord_type: CoordinationMessageType,
    pub session_id: String,
    pub payload: Value,
    pub sender_id: String,
    pub recipient_id: Option<String>,
    pub priority: MessagePriority,
    pub requires_ack: bool,
}

impl CoordinationMessage {
    pub fn new(
        coord_type: CoordinationMessageType,
        session_id: impl Into<String>,
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            coord_type,
            session_id: session_id.into(),
            payload,
            sender_id: sender_id.into(),
            recipient_id: Some(recipient_id.into()),
            priority: MessagePriority::Normal,
            requires_ack: true,
        }
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

    /// Build the envelope, stamping the protocol tags.
    pub fn to_message(&self) -> Message {
        let mut message = Message::new(MessageType::Command, self.sender_id.as_str(), self.payload.clone())
            .with_priority(self.priority)
            .with_ack(self.requires_ack)
            .with_metadata(META_COORDINATION_TYPE, self.coord_type.wire_name())
            .with_metadata(META_SESSION_ID, self.session_id.as_str());
        message.recipient_id = self.recipient_id.clone();
        message
    }

    /// Read the protocol tags back out of an envelope.
    ///
    /// Fails with `MalformedMessage` if either tag is missing and with
    /// `UnknownMessageType` if the type tag is not recognized.
    pub fn from_message(message: &Message) -> Result<Self> {
        let raw_type = message.coordination_type().ok_or_else(|| {
            CoordinationError::MalformedMessage(format!("{} has no coordination_type", message))
        })?;
        let session_id = message.session_id().ok_or_else(|| {
            CoordinationError::MalformedMessage(format!("{} has no session_id", message))
        })?;
        Ok(Self {
            coord_type: raw_type.parse()?,
            session_id: session_id.to_string(),
            payload: message.payload.clone(),
            sender_id: message.sender_id.clone(),
            recipient_id: message.recipient_id.clone(),
            priority: message.priority,
            requires_ack: message.requires_ack,
        })
    }
}

/// Message factories and sequencing rules.
pub struct CoordinationProtocol;

impl CoordinationProtocol {
    pub fn create_init_message(
        session_id: &str,
        sender_id: &str,
        recipient_id: &str,
        config: Value,
    ) -> CoordinationMessage {
        CoordinationMessage::new(
            CoordinationMessageType::Init,
            session_id,
            sender_id,
            recipient_id,
            json!({ "config": config }),
        )
        .with_priority(MessagePriority::High)
    }

    pub fn create_command_message(
        session_id: &str,
        sender_id: &str,
        recipient_id: &str,
        command: &str,
        params: Value,
    ) -> CoordinationMessage {
        CoordinationMessage::new(
            CoordinationMessageType::Command,
            session_id,
            sender_id,
            recipient_id,
            json!({ "command": command, "params": params }),
        )
    }

    pub fn create_sync_message(
        session_id: &str,
        sender_id: &str,
        recipient_id: &str,
        state: Value,
    ) -> CoordinationMessage {
        CoordinationMessage::new(
            CoordinationMessageType::Sync,
            session_id,
            sender_id,
            recipient_id,
            json!({ "state": state }),
        )
    }

    /// Heartbeats are low priority and never acknowledged.
    pub fn create_heartbeat_message(
        session_id: &str,
        sender_id: &str,
        recipient_id: &str,
    ) -> CoordinationMessage {
        CoordinationMessage::new(
            CoordinationMessageType::Heartbeat,
            session_id,
            sender_id,
            recipient_id,
            json!({ "timestamp": epoch_millis() }),
        )
        .with_priority(MessagePriority::Low)
        .with_ack(false)
    }

    pub fn create_shutdown_message(
        session_id: &str,
        sender_id: &str,
        recipient_id: &str,
        reason: &str,
    ) -> CoordinationMessage {
        CoordinationMessage::new(
            CoordinationMessageType::Shutdown,
            session_id,
            sender_id,
            recipient_id,
            json!({ "reason": reason }),
        )
        .with_priority(MessagePriority::High)
    }

    pub fn create_ack_message(
        session_id: &str,
        sender_id: &str,
        recipient_id: &str,
        acked_message_id: &str,
    ) -> CoordinationMessage {
        CoordinationMessage::new(
            CoordinationMessageType::Ack,
            session_id,
            sender_id,
            recipient_id,
            json!({ "ack": true, "original_message_id": acked_message_id }),
        )
        .with_ack(false)
    }

    pub fn create_status_message(
        session_id: &str,
        sender_id: &str,
        recipient_id: &str,
        status: Value,
    ) -> CoordinationMessage {
        CoordinationMessage::new(
            CoordinationMessageType::Status,
            session_id,
            sender_id,
            recipient_id,
            json!({ "status": status }),
        )
    }

    pub fn create_ready_message(
        session_id: &str,
        sender_id: &str,
        recipient_id: &str,
    ) -> CoordinationMessage {
        CoordinationMessage::new(
            CoordinationMessageType::Ready,
            session_id,
            sender_id,
            recipient_id,
            json!({ "status": "ready" }),
        )
        .with_priority(MessagePriority::High)
    }

    pub fn create_error_message(
        session_id: &str,
        sender_id: &str,
        recipient_id: &str,
        error: &str,
        details: Option<Value>,
    ) -> CoordinationMessage {
        let mut payload = Map::new();
        payload.insert("error".into(), Value::from(error));
        if let Some(details) = details {
            payload.insert("details".into(), details);
        }
        CoordinationMessage::new(
            CoordinationMessageType::Error,
            session_id,
            sender_id,
            recipient_id,
            Value::Object(payload),
        )
        .with_priority(MessagePriority::High)
    }

    pub fn create_complete_message(
        session_id: &str,
        sender_id: &str,
        recipient_id: &str,
        result: Value,
    ) -> CoordinationMessage {
        CoordinationMessage::new(
            CoordinationMessageType::Complete,
            session_id,
            sender_id,
            recipient_id,
            json!({ "result": result }),
        )
    }

    /// Whether `curr` may follow `prev`.
    ///
    /// Types without a table entry allow nothing after them; callers that
    /// only want to police the constrained exchanges check
    /// [`CoordinationMessageType::allowed_successors`] first.
    pub fn validate_message_sequence(
        prev: CoordinationMessageType,
        curr: CoordinationMessageType,
    ) -> bool {
        prev.allowed_successors()
            .is_some_and(|allowed| allowed.contains(&curr))
    }

    pub fn timeout_for(message_type: CoordinationMessageType) -> Duration {
        message_type.timeout()
    }
}
