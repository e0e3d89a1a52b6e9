//! Fuzz target for coordination message parsing.
//!
//! This tests that reading protocol tags out of an arbitrary envelope never
//! panics, and that anything that parses survives a rebuild unchanged.

#![no_main]

use coordination_engine::coordination::{CoordinationMessage, CoordinationMessageType};
use coordination_engine::message::{META_COORDINATION_TYPE, META_SESSION_ID};
use coordination_engine::{Message, MessageType};
use libfuzzer_sys::fuzz_target;
use serde_json::json;

fuzz_target!(|data: (&str, &str, &str)| {
    let (coord_type, session_id, body) = data;

    // Should never panic
    let _ = coord_type.parse::<CoordinationMessageType>();

    let message = Message::new(MessageType::Command, "fuzz", json!({ "body": body }))
        .with_metadata(META_COORDINATION_TYPE, coord_type)
        .with_metadata(META_SESSION_ID, session_id);

    if let Ok(parsed) = CoordinationMessage::from_message(&message) {
        let rebuilt = CoordinationMessage::from_message(&parsed.to_message())
            .expect("rebuilt message must parse");
        assert_eq!(rebuilt.coord_type, parsed.coord_type);
        assert_eq!(rebuilt.session_id, session_id);
    }
});
