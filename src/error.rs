// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the coordination engine.
//!
//! Errors are categorized by the taxonomy the coordination layer reports to
//! its callers: protocol violations, capacity violations, transient delivery
//! failures and lifecycle problems.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `InvalidTransition` | No | State machine table violation |
//! | `UnknownMessageType` | No | Unrecognized coordination message type |
//! | `MalformedMessage` | No | Coordination message missing required metadata |
//! | `OutOfSequence` | No | Message type not allowed after the previous one |
//! | `SessionNotFound` | No | Unknown session id |
//! | `SessionLimit` | Yes | Too many concurrent sessions (capacity may free up) |
//! | `RejoinExhausted` | No | Session used all its rejoin attempts |
//! | `Transport` | Yes | Underlying send primitive failed |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Operation attempted in the wrong state |
//! | `Shutdown` | No | Component is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`CoordinationError::is_retryable()`] to determine if an operation
//! should be retried with backoff. Protocol violations never succeed on
//! retry; they indicate a misbehaving peer or a caller bug.

use crate::coordination::CoordinationState;
use thiserror::Error;

/// Result type alias for coordination operations.
pub type Result<T> = std::result::Result<T, CoordinationError>;

/// Errors that can occur during coordination and messaging.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordinationError {
    /// Requested state transition is not in the legal transition table.
    ///
    /// The state machine is left unchanged.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: CoordinationState,
        to: CoordinationState,
    },

    /// Coordination message carried an unknown `coordination_type`.
    #[error("Unknown coordination message type: {0}")]
    UnknownMessageType(String),

    /// Coordination message is missing required metadata.
    #[error("Malformed coordination message: {0}")]
    MalformedMessage(String),

    /// Coordination message arrived out of protocol order.
    #[error("Out-of-sequence message: {curr} after {prev}")]
    OutOfSequence { prev: String, curr: String },

    /// No session with the given id.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Maximum number of concurrent sessions reached.
    #[error("Session limit reached: max {max} concurrent sessions")]
    SessionLimit { max: usize },

    /// Session has used up its rejoin attempts.
    #[error("Rejoin attempts exhausted for {session_id} after {attempts} attempts")]
    RejoinExhausted { session_id: String, attempts: u32 },

    /// Underlying transport refused or lost the message.
    #[error("Transport error ({recipient}): {message}")]
    Transport { recipient: String, message: String },

    /// Invalid or inconsistent configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong state.
    ///
    /// E.g. executing a command on a session that is not synchronized.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinationError {
    /// Create a transport error for a recipient.
    pub fn transport(recipient: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            recipient: recipient.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    ///
    /// Returns `true` for transient failures (transport errors, capacity that
    /// may free up). Returns `false` for protocol violations, configuration
    /// errors and lifecycle errors.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::Transport { .. } | CoordinationError::SessionLimit { .. }
        )
    }

    /// Protocol violations: rejected locally, no state change.
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            CoordinationError::InvalidTransition { .. }
                | CoordinationError::UnknownMessageType(_)
                | CoordinationError::MalformedMessage(_)
                | CoordinationError::OutOfSequence { .. }
        )
    }
}
