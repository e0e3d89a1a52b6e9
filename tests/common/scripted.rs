//! Topologies and scripted child replies.

use coordination_engine::coordination::CoordinationProtocol;
use coordination_engine::{Message, StaticTopology};
use serde_json::Value;

/// A parent named `root` with the given children.
pub fn parent_with_children(children: &[&str]) -> StaticTopology {
    StaticTopology::new("root").with_children(children.iter().copied())
}

/// Replies a child sends back to its parent for one session.
pub struct ScriptedChild {
    pub child_id: String,
    pub parent_id: String,
    pub session_id: String,
}

impl ScriptedChild {
    pub fn new(child_id: &str, parent_id: &str, session_id: &str) -> Self {
        Self {
            child_id: child_id.to_string(),
            parent_id: parent_id.to_string(),
            session_id: session_id.to_string(),
        }
    }

    pub fn ready(&self) -> Message {
        CoordinationProtocol::create_ready_message(&self.session_id, &self.child_id, &self.parent_id)
            .to_message()
    }

    pub fn error(&self, error: &str) -> Message {
        CoordinationProtocol::create_error_message(
            &self.session_id,
            &self.child_id,
            &self.parent_id,
            error,
            None,
        )
        .to_message()
    }

    pub fn complete(&self, result: Value) -> Message {
        CoordinationProtocol::create_complete_message(
            &self.session_id,
            &self.child_id,
            &self.parent_id,
            result,
        )
        .to_message()
    }

    pub fn heartbeat(&self) -> Message {
        CoordinationProtocol::create_heartbeat_message(
            &self.session_id,
            &self.child_id,
            &self.parent_id,
        )
        .to_message()
    }
}
