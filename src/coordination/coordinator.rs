// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Parent-side coordinator.
//!
//! The orchestrator for the sessions this node runs over its children:
//! - Session creation and INIT fan-out via [`Transport`]
//! - Per-session state machines ([`StateManager`])
//! - Ready-quorum tracking and command dispatch
//! - Heartbeats to every live session
//!
//! # Architecture
//!
//! ```text
//!             initiate_coordination()            execute_command()
//!                     │                                 │
//!                     ↓                                 ↓
//!  children ←── INIT ── Coordinator ── COMMAND ──→ children
//!      │                    ↑   │
//!      └─ READY/ERROR/ ─────┘   └── heartbeat loop ──→ live sessions
//!         COMPLETE/HEARTBEAT
//! ```
//!
//! The overall coordinator state is derived from the session states: any
//! synchronized session makes the coordinator synchronized, otherwise any
//! degraded, then connecting, then failed, else disconnected. It only ever
//! moves along legal transitions, routing through intermediate states when
//! the target is not directly reachable.

use super::protocol::{CoordinationMessage, CoordinationMessageType, CoordinationProtocol};
use super::state::{StateManager, StateTransition};
use super::types::{CoordinationSession, CoordinationState};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinationError, Result};
use crate::lifecycle::{guard_listener, shutdown_signalled, TaskSet};
use crate::message::Message;
use crate::metrics;
use crate::topology::NodeTopology;
use crate::transport::Transport;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};

/// Observer for coordinator and session state changes.
pub trait CoordinatorListener: Send + Sync {
    fn on_state_change(&self, _old: CoordinationState, _new: CoordinationState) {}
    fn on_session_state_change(
        &self,
        _session_id: &str,
        _old: CoordinationState,
        _new: CoordinationState,
    ) {
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorStats {
    pub sessions_created: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub commands_executed: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_received: u64,
    pub completions_received: u64,
    pub errors_received: u64,
    pub sequence_violations: u64,
    pub send_failures: u64,
    pub active_sessions: usize,
    pub current_state: CoordinationState,
    pub heartbeat_interval: Duration,
}

struct SessionRecord {
    session: CoordinationSession,
    machine: StateManager,
    ready_children: BTreeSet<String>,
    /// Last protocol message exchanged with each child, heartbeats excluded.
    last_exchange: HashMap<String, CoordinationMessageType>,
    commands_executed: u64,
    completions: u64,
}

impl SessionRecord {
    /// Apply a validated transition and mirror it onto the session record.
    fn transition(
        &mut self,
        to: CoordinationState,
        trigger: &str,
    ) -> Result<(CoordinationState, CoordinationState)> {
        let t = self.machine.transition_to(to, trigger, None)?;
        self.session.state = t.to;
        Ok((t.from, t.to))
    }
}

#[derive(Default)]
struct Counters {
    sessions_created: AtomicU64,
    sessions_completed: AtomicU64,
    sessions_failed: AtomicU64,
    commands_executed: AtomicU64,
    heartbeats_sent: AtomicU64,
    heartbeats_received: AtomicU64,
    completions_received: AtomicU64,
    errors_received: AtomicU64,
    sequence_violations: AtomicU64,
    send_failures: AtomicU64,
}

struct CoordinatorInner<N: NodeTopology, T: Transport> {
    topology: N,
    transport: T,
    config: CoordinatorConfig,
    sessions: RwLock<HashMap<String, SessionRecord>>,
    /// Overall state machine. Taken before `sessions` when both are needed.
    overall: Mutex<StateManager>,
    state_tx: watch::Sender<CoordinationState>,
    next_session: AtomicU64,
    listeners: parking_lot::RwLock<Vec<Arc<dyn CoordinatorListener>>>,
    counters: Counters,
}

/// Parent-side coordinator over this node's children.
pub struct Coordinator<N: NodeTopology, T: Transport> {
    inner: Arc<CoordinatorInner<N, T>>,

    /// Overall state receiver (for watchers)
    state_rx: watch::Receiver<CoordinationState>,

    tasks: TaskSet,
}

impl<N: NodeTopology, T: Transport> Coordinator<N, T> {
    pub fn new(topology: N, transport: T, config: CoordinatorConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(CoordinationState::Disconnected);
        let overall = StateManager::new(format!("coordinator-{}", topology.node_id()));
        Self {
            inner: Arc::new(CoordinatorInner {
                topology,
                transport,
                config,
                sessions: RwLock::new(HashMap::new()),
                overall: Mutex::new(overall),
                state_tx,
                next_session: AtomicU64::new(0),
                listeners: parking_lot::RwLock::new(Vec::new()),
                counters: Counters::default(),
            }),
            state_rx,
            tasks: TaskSet::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        self.inner.topology.node_id()
    }

    pub fn topology(&self) -> &N {
        &self.inner.topology
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Get current overall state.
    pub fn state(&self) -> CoordinationState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch overall state changes.
    pub fn state_receiver(&self) -> watch::Receiver<CoordinationState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.tasks.is_running()
    }

    pub fn add_listener(&self, listener: Arc<dyn CoordinatorListener>) {
        self.inner.listeners.write().push(listener);
    }

    /// Spawn the heartbeat loop. No-op if already running.
    pub fn start(&self) {
        let Some(mut shutdown_rx) = self.tasks.begin() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let span = info_span!("coordinator_heartbeat", node_id = %inner.topology.node_id());
        self.tasks.push(tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(inner.config.heartbeat_interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_signalled(&mut shutdown_rx) => break,
                        _ = ticker.tick() => {
                            inner.send_heartbeats().await;
                        }
                    }
                }
                debug!("Coordinator heartbeat loop exiting");
            }
            .instrument(span),
        ));
        info!(
            node_id = %self.node_id(),
            heartbeat_interval_ms = self.inner.config.heartbeat_interval_ms,
            "Coordinator started"
        );
    }

    /// Stop the heartbeat loop and clean up every session.
    ///
    /// Failed sessions count as failed, all others as completed. Idempotent.
    pub async fn stop(&self) {
        self.tasks.stop("coordinator").await;

        let drained: Vec<SessionRecord> = {
            let mut sessions = self.inner.sessions.write().await;
            sessions.drain().map(|(_, record)| record).collect()
        };
        if drained.is_empty() {
            return;
        }
        for record in &drained {
            self.inner.count_ended(&record.session);
            info!(session_id = %record.session.session_id, "Cleaned up coordination session");
        }
        self.inner.recompute_overall().await;
        info!(node_id = %self.node_id(), sessions = drained.len(), "Coordinator stopped");
    }

    /// Open a session with `child_ids`, or with every current child.
    ///
    /// The session starts `Connecting` and an INIT goes to each child.
    pub async fn initiate_coordination(&self, child_ids: Option<Vec<String>>) -> Result<String> {
        let inner = &self.inner;
        let node_id = inner.topology.node_id().to_string();
        let children = child_ids.unwrap_or_else(|| inner.topology.children());

        let n = inner.next_session.fetch_add(1, Ordering::Relaxed);
        let session_id = format!("coord-{}-{}", node_id, n);

        let mut record = SessionRecord {
            session: CoordinationSession::new(session_id.clone(), node_id.clone(), children),
            machine: StateManager::new(session_id.clone()),
            ready_children: BTreeSet::new(),
            last_exchange: HashMap::new(),
            commands_executed: 0,
            completions: 0,
        };
        let change = record.transition(CoordinationState::Connecting, "initiate")?;
        if record.session.child_ids.is_empty() {
            warn!(session_id = %session_id, "Initiating coordination with no children");
        }

        let targets: Vec<String> = record.session.child_ids.iter().cloned().collect();
        for child in &targets {
            record
                .last_exchange
                .insert(child.clone(), CoordinationMessageType::Init);
        }
        inner.sessions.write().await.insert(session_id.clone(), record);
        inner.counters.sessions_created.fetch_add(1, Ordering::Relaxed);
        metrics::record_coordination_session("created");
        inner.notify_session(&session_id, change);
        inner.recompute_overall().await;

        let config = json!({
            "heartbeat_interval_ms": inner.config.heartbeat_interval_ms,
            "children": targets,
        });
        for child in &targets {
            let init = CoordinationProtocol::create_init_message(
                &session_id,
                &node_id,
                child,
                config.clone(),
            );
            inner.send(init).await;
        }

        info!(
            session_id = %session_id,
            children = targets.len(),
            "Initiated coordination session"
        );
        Ok(session_id)
    }

    /// Send a command to every child of a synchronized session.
    ///
    /// Fails with [`CoordinationError::InvalidState`] unless the session is
    /// `Synchronized`.
    pub async fn execute_command(&self, session_id: &str, command: &str, params: Value) -> Result<()> {
        let inner = &self.inner;
        let targets: Vec<String> = {
            let mut sessions = inner.sessions.write().await;
            let record = sessions
                .get_mut(session_id)
                .ok_or_else(|| CoordinationError::SessionNotFound(session_id.to_string()))?;
            let state = record.session.state;
            if state != CoordinationState::Synchronized {
                warn!(session_id, command, state = %state, "Session not in synchronized state");
                return Err(CoordinationError::InvalidState {
                    expected: CoordinationState::Synchronized.to_string(),
                    actual: state.to_string(),
                });
            }
            record.commands_executed += 1;
            let targets: Vec<String> = record.session.child_ids.iter().cloned().collect();
            for child in &targets {
                record
                    .last_exchange
                    .insert(child.clone(), CoordinationMessageType::Command);
            }
            targets
        };

        inner.counters.commands_executed.fetch_add(1, Ordering::Relaxed);
        metrics::record_command(command);
        info!(session_id, command, children = targets.len(), "Executing command");

        let node_id = inner.topology.node_id();
        for child in &targets {
            let msg = CoordinationProtocol::create_command_message(
                session_id,
                node_id,
                child,
                command,
                params.clone(),
            );
            inner.send(msg).await;
        }
        Ok(())
    }

    /// Dispatch an incoming coordination message.
    ///
    /// READY, COMPLETE, ERROR and HEARTBEAT drive the session. Other known
    /// types are accepted and ignored. Malformed messages, unknown types and
    /// unknown sessions are rejected without any state change.
    pub async fn handle_coordination_message(&self, message: &Message) -> Result<()> {
        let inner = &self.inner;
        let parsed = CoordinationMessage::from_message(message).inspect_err(|e| {
            warn!(message_id = %message.id, sender = %message.sender_id, error = %e, "Invalid coordination message");
        })?;
        let coord_type = parsed.coord_type;
        let session_id = parsed.session_id.as_str();
        let sender = parsed.sender_id.as_str();

        let change = {
            let mut sessions = inner.sessions.write().await;
            let Some(record) = sessions.get_mut(session_id) else {
                warn!(session_id, sender, "Received message for unknown session");
                return Err(CoordinationError::SessionNotFound(session_id.to_string()));
            };

            match coord_type {
                CoordinationMessageType::Heartbeat => {
                    record.session.touch();
                    inner.counters.heartbeats_received.fetch_add(1, Ordering::Relaxed);
                    metrics::record_heartbeats("received", 1);
                    debug!(session_id, sender, "Received heartbeat");
                    return Ok(());
                }
                CoordinationMessageType::Ready
                | CoordinationMessageType::Complete
                | CoordinationMessageType::Error => {}
                other => {
                    debug!(session_id, sender, coordination_type = %other, "Ignoring coordination message");
                    return Ok(());
                }
            }

            if !record.session.has_child(sender) {
                warn!(session_id, sender, "Coordination message from a non-member");
                return Err(CoordinationError::InvalidState {
                    expected: format!("child of {session_id}"),
                    actual: sender.to_string(),
                });
            }
            inner.check_sequence(record, sender, coord_type)?;

            match coord_type {
                CoordinationMessageType::Ready => inner.on_ready(record, sender)?,
                CoordinationMessageType::Complete => {
                    record.completions += 1;
                    inner.counters.completions_received.fetch_add(1, Ordering::Relaxed);
                    debug!(session_id, sender, "Child completed command");
                    None
                }
                _ => inner.on_error(record, sender, message)?,
            }
        };

        if let Some(change) = change {
            inner.notify_session(session_id, change);
            inner.recompute_overall().await;
        }
        Ok(())
    }

    /// Heartbeat every synchronized or degraded session now.
    ///
    /// Returns the number of heartbeats sent.
    pub async fn send_heartbeats(&self) -> usize {
        self.inner.send_heartbeats().await
    }

    /// End a session normally, telling its children to shut down.
    pub async fn complete_session(&self, session_id: &str) -> Result<()> {
        let inner = &self.inner;
        let (record, change) = {
            let mut sessions = inner.sessions.write().await;
            let mut record = sessions
                .remove(session_id)
                .ok_or_else(|| CoordinationError::SessionNotFound(session_id.to_string()))?;
            let change = record.transition(CoordinationState::Disconnected, "complete").ok();
            (record, change)
        };
        if let Some(change) = change {
            inner.notify_session(session_id, change);
        }
        inner.counters.sessions_completed.fetch_add(1, Ordering::Relaxed);
        metrics::record_coordination_session("completed");
        inner.recompute_overall().await;

        let node_id = inner.topology.node_id();
        for child in &record.session.child_ids {
            let msg = CoordinationProtocol::create_shutdown_message(session_id, node_id, child, "complete");
            inner.send(msg).await;
        }
        info!(
            session_id,
            commands = record.commands_executed,
            completions = record.completions,
            "Coordination session completed"
        );
        Ok(())
    }

    /// End a session as failed.
    pub async fn fail_session(&self, session_id: &str, reason: &str) -> Result<()> {
        let inner = &self.inner;
        let change = {
            let mut sessions = inner.sessions.write().await;
            let mut record = sessions
                .remove(session_id)
                .ok_or_else(|| CoordinationError::SessionNotFound(session_id.to_string()))?;
            record.transition(CoordinationState::Failed, reason).ok()
        };
        if let Some(change) = change {
            inner.notify_session(session_id, change);
        }
        inner.counters.sessions_failed.fetch_add(1, Ordering::Relaxed);
        metrics::record_coordination_session("failed");
        inner.recompute_overall().await;
        warn!(session_id, reason, "Coordination session failed");
        Ok(())
    }

    pub async fn session(&self, session_id: &str) -> Option<CoordinationSession> {
        self.inner
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|r| r.session.clone())
    }

    pub async fn session_state(&self, session_id: &str) -> Option<CoordinationState> {
        self.inner
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|r| r.session.state)
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.inner.sessions.read().await.keys().cloned().collect()
    }

    /// Children that reported READY and have not errored since.
    pub async fn ready_children(&self, session_id: &str) -> Option<BTreeSet<String>> {
        self.inner
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|r| r.ready_children.clone())
    }

    pub async fn session_history(&self, session_id: &str) -> Option<Vec<StateTransition>> {
        self.inner
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|r| r.machine.history().cloned().collect())
    }

    /// Commands executed and completions received for one session.
    pub async fn session_counts(&self, session_id: &str) -> Option<(u64, u64)> {
        self.inner
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|r| (r.commands_executed, r.completions))
    }

    pub async fn statistics(&self) -> CoordinatorStats {
        let c = &self.inner.counters;
        CoordinatorStats {
            sessions_created: c.sessions_created.load(Ordering::Relaxed),
            sessions_completed: c.sessions_completed.load(Ordering::Relaxed),
            sessions_failed: c.sessions_failed.load(Ordering::Relaxed),
            commands_executed: c.commands_executed.load(Ordering::Relaxed),
            heartbeats_sent: c.heartbeats_sent.load(Ordering::Relaxed),
            heartbeats_received: c.heartbeats_received.load(Ordering::Relaxed),
            completions_received: c.completions_received.load(Ordering::Relaxed),
            errors_received: c.errors_received.load(Ordering::Relaxed),
            sequence_violations: c.sequence_violations.load(Ordering::Relaxed),
            send_failures: c.send_failures.load(Ordering::Relaxed),
            active_sessions: self.inner.sessions.read().await.len(),
            current_state: self.state(),
            heartbeat_interval: self.inner.config.heartbeat_interval(),
        }
    }
}

type SessionChange = (CoordinationState, CoordinationState);

impl<N: NodeTopology, T: Transport> CoordinatorInner<N, T> {
    async fn send(&self, message: CoordinationMessage) -> bool {
        let accepted = self.transport.send(message.to_message()).await;
        if !accepted {
            self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                recipient = message.recipient_id.as_deref().unwrap_or("-"),
                coordination_type = %message.coord_type,
                "Transport refused coordination message"
            );
        }
        accepted
    }

    fn check_sequence(
        &self,
        record: &mut SessionRecord,
        sender: &str,
        curr: CoordinationMessageType,
    ) -> Result<()> {
        if let Some(&prev) = record.last_exchange.get(sender) {
            if prev.allowed_successors().is_some()
                && !CoordinationProtocol::validate_message_sequence(prev, curr)
            {
                self.counters.sequence_violations.fetch_add(1, Ordering::Relaxed);
                warn!(
                    session_id = %record.session.session_id,
                    sender,
                    prev = %prev,
                    curr = %curr,
                    "Out-of-sequence coordination message"
                );
                if self.config.strict_sequencing {
                    return Err(CoordinationError::OutOfSequence {
                        prev: prev.wire_name().to_string(),
                        curr: curr.wire_name().to_string(),
                    });
                }
            }
        }
        record.last_exchange.insert(sender.to_string(), curr);
        Ok(())
    }

    fn on_ready(&self, record: &mut SessionRecord, sender: &str) -> Result<Option<SessionChange>> {
        record.ready_children.insert(sender.to_string());
        let session_id = record.session.session_id.clone();
        debug!(session_id = %session_id, sender, "Child ready");

        match record.session.state {
            CoordinationState::Connecting => {
                let required = self
                    .config
                    .ready_quorum
                    .required(record.session.child_ids.len());
                let ready = record.ready_children.len();
                if ready < required {
                    debug!(session_id = %session_id, ready, required, "Waiting for ready quorum");
                    return Ok(None);
                }
                let change = record.transition(CoordinationState::Synchronized, "ready")?;
                info!(session_id = %session_id, ready, required, "Session synchronized");
                Ok(Some(change))
            }
            CoordinationState::Degraded => {
                let change = record.transition(CoordinationState::Synchronized, "ready")?;
                info!(session_id = %session_id, sender, "Session recovered");
                Ok(Some(change))
            }
            _ => Ok(None),
        }
    }

    fn on_error(
        &self,
        record: &mut SessionRecord,
        sender: &str,
        message: &Message,
    ) -> Result<Option<SessionChange>> {
        self.counters.errors_received.fetch_add(1, Ordering::Relaxed);
        record.ready_children.remove(sender);
        let error = message
            .payload
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error");
        warn!(
            session_id = %record.session.session_id,
            sender,
            error,
            "Child reported error"
        );

        if record.session.state == CoordinationState::Synchronized {
            Ok(Some(record.transition(CoordinationState::Degraded, "error")?))
        } else {
            Ok(None)
        }
    }

    async fn send_heartbeats(&self) -> usize {
        let targets: Vec<(String, Vec<String>)> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|r| r.session.state.is_active())
            .map(|r| {
                (
                    r.session.session_id.clone(),
                    r.session.child_ids.iter().cloned().collect(),
                )
            })
            .collect();

        let node_id = self.topology.node_id();
        let mut sent = 0;
        for (session_id, children) in &targets {
            for child in children {
                let hb = CoordinationProtocol::create_heartbeat_message(session_id, node_id, child);
                if self.send(hb).await {
                    sent += 1;
                }
            }
            debug!(session_id = %session_id, children = children.len(), "Sent heartbeats");
        }
        self.counters.heartbeats_sent.fetch_add(sent as u64, Ordering::Relaxed);
        metrics::record_heartbeats("sent", sent);
        sent
    }

    fn count_ended(&self, session: &CoordinationSession) {
        if session.state == CoordinationState::Failed {
            self.counters.sessions_failed.fetch_add(1, Ordering::Relaxed);
            metrics::record_coordination_session("failed");
        } else {
            self.counters.sessions_completed.fetch_add(1, Ordering::Relaxed);
            metrics::record_coordination_session("completed");
        }
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn CoordinatorListener>> {
        self.listeners.read().clone()
    }

    fn notify_session(&self, session_id: &str, (old, new): SessionChange) {
        info!(session_id, from = %old, to = %new, "Session state transition");
        for listener in self.listeners_snapshot() {
            guard_listener("coordinator_session_state", || {
                listener.on_session_state_change(session_id, old, new)
            });
        }
    }

    /// Re-derive the overall state from the sessions and apply it.
    async fn recompute_overall(&self) {
        let applied = {
            let mut overall = self.overall.lock().await;
            let target = derive_overall(self.sessions.read().await.values().map(|r| r.session.state));
            let mut applied = Vec::new();
            for step in route(overall.current_state(), target) {
                match overall.transition_to(step, "derived", None) {
                    Ok(t) => applied.push((t.from, t.to)),
                    Err(e) => {
                        warn!(error = %e, "Overall state transition rejected");
                        break;
                    }
                }
            }
            applied
        };

        for (old, new) in applied {
            self.state_tx.send_replace(new);
            metrics::set_coordination_state(self.topology.node_id(), new.as_str());
            info!(from = %old, to = %new, "Coordinator state transition");
            for listener in self.listeners_snapshot() {
                guard_listener("coordinator_state", || listener.on_state_change(old, new));
            }
        }
    }
}

/// Overall state for a set of session states.
fn derive_overall(states: impl Iterator<Item = CoordinationState>) -> CoordinationState {
    let present: BTreeSet<CoordinationState> = states.collect();
    [
        CoordinationState::Synchronized,
        CoordinationState::Degraded,
        CoordinationState::Connecting,
        CoordinationState::Failed,
    ]
    .into_iter()
    .find(|s| present.contains(s))
    .unwrap_or(CoordinationState::Disconnected)
}

/// Shortest chain of legal transitions from `from` to `to`, excluding `from`.
fn route(from: CoordinationState, to: CoordinationState) -> Vec<CoordinationState> {
    if from == to {
        return Vec::new();
    }
    let mut previous: HashMap<CoordinationState, CoordinationState> = HashMap::new();
    let mut queue = VecDeque::from([from]);
    while let Some(state) = queue.pop_front() {
        for &next in state.valid_transitions() {
            if next == from || previous.contains_key(&next) {
                continue;
            }
            previous.insert(next, state);
            if next == to {
                let mut path = vec![to];
                let mut cursor = to;
                while let Some(&prev) = previous.get(&cursor) {
                    if prev == from {
                        break;
                    }
                    path.push(prev);
                    cursor = prev;
                }
                path.reverse();
                return path;
            }
            queue.push_back(next);
        }
    }
    Vec::new()
}

impl<N: NodeTopology, T: Transport> fmt::Display for Coordinator<N, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Coordinator(node={}, state={})",
            self.node_id(),
            self.state()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadyQuorum;
    use crate::topology::StaticTopology;
    use crate::transport::RecordingTransport;
    use CoordinationState::*;

    type TestCoordinator = Coordinator<StaticTopology, Arc<RecordingTransport>>;

    fn coordinator(config: CoordinatorConfig) -> (TestCoordinator, Arc<RecordingTransport>) {
        let topology = StaticTopology::new("root").with_children(["c1", "c2"]);
        let transport = Arc::new(RecordingTransport::new());
        (
            Coordinator::new(topology, Arc::clone(&transport), config),
            transport,
        )
    }

    fn ready(session_id: &str, child: &str) -> Message {
        CoordinationProtocol::create_ready_message(session_id, child, "root").to_message()
    }

    fn error(session_id: &str, child: &str) -> Message {
        CoordinationProtocol::create_error_message(session_id, child, "root", "disk full", None)
            .to_message()
    }

    #[derive(Default)]
    struct Recorder {
        overall: parking_lot::Mutex<Vec<(CoordinationState, CoordinationState)>>,
        sessions: parking_lot::Mutex<Vec<(String, CoordinationState)>>,
    }

    impl CoordinatorListener for Recorder {
        fn on_state_change(&self, old: CoordinationState, new: CoordinationState) {
            self.overall.lock().push((old, new));
        }
        fn on_session_state_change(&self, session_id: &str, _old: CoordinationState, new: CoordinationState) {
            self.sessions.lock().push((session_id.to_string(), new));
        }
    }

    #[test]
    fn test_derive_overall_priority() {
        assert_eq!(derive_overall([].into_iter()), Disconnected);
        assert_eq!(derive_overall([Failed, Connecting].into_iter()), Connecting);
        assert_eq!(derive_overall([Degraded, Connecting].into_iter()), Degraded);
        assert_eq!(derive_overall([Degraded, Synchronized].into_iter()), Synchronized);
        assert_eq!(derive_overall([Failed].into_iter()), Failed);
    }

    #[test]
    fn test_route_uses_legal_steps() {
        assert_eq!(route(Connecting, Synchronized), vec![Synchronized]);
        assert_eq!(route(Disconnected, Synchronized), vec![Connecting, Synchronized]);
        assert_eq!(route(Synchronized, Connecting), vec![Disconnected, Connecting]);
        assert_eq!(route(Failed, Degraded), vec![Connecting, Synchronized, Degraded]);
        assert!(route(Degraded, Degraded).is_empty());
    }

    #[tokio::test]
    async fn test_initiate_sends_init_to_all_children() {
        let (coord, transport) = coordinator(CoordinatorConfig::for_testing());
        let id = coord.initiate_coordination(None).await.unwrap();
        assert_eq!(id, "coord-root-0");
        assert_eq!(coord.state(), Connecting);
        assert_eq!(coord.session_state(&id).await, Some(Connecting));

        for child in ["c1", "c2"] {
            let sent = transport.sent_to(child);
            assert_eq!(sent.len(), 1);
            assert_eq!(
                sent[0].coordination_type(),
                Some(CoordinationMessageType::Init.wire_name())
            );
            assert_eq!(sent[0].session_id(), Some(id.as_str()));
        }

        let explicit = coord
            .initiate_coordination(Some(vec!["c2".to_string()]))
            .await
            .unwrap();
        assert_eq!(explicit, "coord-root-1");
        assert_eq!(coord.session(&explicit).await.unwrap().child_ids.len(), 1);
        assert_eq!(coord.statistics().await.sessions_created, 2);
    }

    #[tokio::test]
    async fn test_full_cycle_with_recovery() {
        let (coord, transport) = coordinator(CoordinatorConfig::for_testing());
        let recorder = Arc::new(Recorder::default());
        coord.add_listener(recorder.clone());
        let id = coord.initiate_coordination(None).await.unwrap();

        coord.handle_coordination_message(&ready(&id, "c1")).await.unwrap();
        coord.handle_coordination_message(&ready(&id, "c2")).await.unwrap();
        assert_eq!(coord.session_state(&id).await, Some(Synchronized));
        assert_eq!(coord.state(), Synchronized);

        coord
            .execute_command(&id, "rebalance", json!({"shards": 4}))
            .await
            .unwrap();
        let commands = transport.sent_to("c1");
        assert_eq!(commands.last().unwrap().payload["command"], "rebalance");

        coord.handle_coordination_message(&error(&id, "c1")).await.unwrap();
        assert_eq!(coord.session_state(&id).await, Some(Degraded));
        assert_eq!(coord.state(), Degraded);

        coord.handle_coordination_message(&ready(&id, "c1")).await.unwrap();
        assert_eq!(coord.session_state(&id).await, Some(Synchronized));

        let stats = coord.statistics().await;
        assert_eq!(stats.commands_executed, 1);
        assert_eq!(stats.errors_received, 1);
        assert_eq!(stats.sequence_violations, 0);

        let session_states: Vec<_> = recorder.sessions.lock().iter().map(|(_, s)| *s).collect();
        assert_eq!(session_states, vec![Connecting, Synchronized, Degraded, Synchronized]);
        assert_eq!(
            *recorder.overall.lock(),
            vec![
                (Disconnected, Connecting),
                (Connecting, Synchronized),
                (Synchronized, Degraded),
                (Degraded, Synchronized)
            ]
        );
    }

    #[tokio::test]
    async fn test_command_requires_synchronized() {
        let (coord, transport) = coordinator(CoordinatorConfig::for_testing());
        let id = coord.initiate_coordination(None).await.unwrap();
        transport.clear();

        let err = coord.execute_command(&id, "go", json!({})).await.unwrap_err();
        assert_eq!(
            err,
            CoordinationError::InvalidState {
                expected: "synchronized".into(),
                actual: "connecting".into()
            }
        );
        assert!(transport.sent().is_empty());
        assert_eq!(coord.statistics().await.commands_executed, 0);

        assert!(matches!(
            coord.execute_command("missing", "go", json!({})).await,
            Err(CoordinationError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ready_quorum_all() {
        let config = CoordinatorConfig {
            ready_quorum: ReadyQuorum::All,
            ..CoordinatorConfig::for_testing()
        };
        let (coord, _transport) = coordinator(config);
        let id = coord.initiate_coordination(None).await.unwrap();

        coord.handle_coordination_message(&ready(&id, "c1")).await.unwrap();
        assert_eq!(coord.session_state(&id).await, Some(Connecting));
        coord.handle_coordination_message(&ready(&id, "c2")).await.unwrap();
        assert_eq!(coord.session_state(&id).await, Some(Synchronized));
        assert_eq!(coord.ready_children(&id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rejects_bad_messages() {
        let (coord, _transport) = coordinator(CoordinatorConfig::for_testing());
        let id = coord.initiate_coordination(None).await.unwrap();

        let plain = Message::new(crate::message::MessageType::Command, "c1", json!({}));
        assert!(matches!(
            coord.handle_coordination_message(&plain).await,
            Err(CoordinationError::MalformedMessage(_))
        ));

        let bogus = ready(&id, "c1").with_metadata(crate::message::META_COORDINATION_TYPE, "coord_bogus");
        assert_eq!(
            coord.handle_coordination_message(&bogus).await,
            Err(CoordinationError::UnknownMessageType("coord_bogus".into()))
        );

        assert!(matches!(
            coord.handle_coordination_message(&ready("coord-root-99", "c1")).await,
            Err(CoordinationError::SessionNotFound(_))
        ));

        assert!(matches!(
            coord.handle_coordination_message(&ready(&id, "stranger")).await,
            Err(CoordinationError::InvalidState { .. })
        ));
        assert_eq!(coord.session_state(&id).await, Some(Connecting));

        // Known but not parent-bound: accepted without effect
        let status = CoordinationProtocol::create_status_message(&id, "c1", "root", json!({"ok": true}))
            .to_message();
        assert!(coord.handle_coordination_message(&status).await.is_ok());
    }

    #[tokio::test]
    async fn test_sequence_violation_strict() {
        let config = CoordinatorConfig {
            strict_sequencing: true,
            ..CoordinatorConfig::for_testing()
        };
        let (coord, _transport) = coordinator(config);
        let id = coord.initiate_coordination(None).await.unwrap();

        // INIT may only be followed by READY or ERROR
        let complete =
            CoordinationProtocol::create_complete_message(&id, "c1", "root", json!({})).to_message();
        let err = coord.handle_coordination_message(&complete).await.unwrap_err();
        assert_eq!(
            err,
            CoordinationError::OutOfSequence {
                prev: "coord_init".into(),
                curr: "coord_complete".into()
            }
        );
        assert_eq!(coord.statistics().await.sequence_violations, 1);
        assert!(coord.handle_coordination_message(&ready(&id, "c1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_sequence_violation_lenient_counts() {
        let (coord, _transport) = coordinator(CoordinatorConfig::for_testing());
        let id = coord.initiate_coordination(None).await.unwrap();
        let complete =
            CoordinationProtocol::create_complete_message(&id, "c1", "root", json!({})).to_message();
        assert!(coord.handle_coordination_message(&complete).await.is_ok());
        let stats = coord.statistics().await;
        assert_eq!(stats.sequence_violations, 1);
        assert_eq!(stats.completions_received, 1);
        assert_eq!(coord.session_counts(&id).await, Some((0, 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_only_for_live_sessions() {
        let (coord, transport) = coordinator(CoordinatorConfig::for_testing());
        let live = coord.initiate_coordination(None).await.unwrap();
        let _pending = coord.initiate_coordination(None).await.unwrap();
        coord.handle_coordination_message(&ready(&live, "c1")).await.unwrap();
        transport.clear();

        assert_eq!(coord.send_heartbeats().await, 2);
        assert!(transport
            .sent()
            .iter()
            .all(|m| m.session_id() == Some(live.as_str())));

        let hb = CoordinationProtocol::create_heartbeat_message(&live, "c1", "root").to_message();
        coord.handle_coordination_message(&hb).await.unwrap();
        let stats = coord.statistics().await;
        assert_eq!((stats.heartbeats_sent, stats.heartbeats_received), (2, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_loop() {
        let (coord, transport) = coordinator(CoordinatorConfig::for_testing());
        let id = coord.initiate_coordination(None).await.unwrap();
        coord.handle_coordination_message(&ready(&id, "c2")).await.unwrap();
        transport.clear();

        coord.start();
        coord.start();
        tokio::time::sleep(Duration::from_millis(250)).await;
        coord.stop().await;
        // Ticks at 0, 100 and 200 ms, two children each
        assert_eq!(transport.sent().len(), 6);
        assert!(!coord.is_running());
    }

    #[tokio::test]
    async fn test_complete_and_fail_sessions() {
        let (coord, transport) = coordinator(CoordinatorConfig::for_testing());
        let a = coord.initiate_coordination(None).await.unwrap();
        let b = coord.initiate_coordination(None).await.unwrap();
        coord.handle_coordination_message(&ready(&a, "c1")).await.unwrap();
        transport.clear();

        coord.complete_session(&a).await.unwrap();
        assert_eq!(transport.sent().len(), 2);
        assert_eq!(
            transport.sent()[0].coordination_type(),
            Some(CoordinationMessageType::Shutdown.wire_name())
        );
        assert_eq!(coord.state(), Connecting);

        coord.fail_session(&b, "children unreachable").await.unwrap();
        assert_eq!(coord.state(), Disconnected);
        assert!(coord.session(&b).await.is_none());

        let stats = coord.statistics().await;
        assert_eq!((stats.sessions_completed, stats.sessions_failed), (1, 1));
        assert_eq!(stats.active_sessions, 0);
        assert!(coord.complete_session(&a).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_cleans_up_sessions() {
        let (coord, _transport) = coordinator(CoordinatorConfig::for_testing());
        coord.initiate_coordination(None).await.unwrap();
        coord.initiate_coordination(None).await.unwrap();
        coord.start();

        coord.stop().await;
        coord.stop().await;
        let stats = coord.statistics().await;
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.sessions_completed, 2);
        assert_eq!(coord.state(), Disconnected);
    }

    #[tokio::test]
    async fn test_send_failures_counted() {
        let (coord, transport) = coordinator(CoordinatorConfig::for_testing());
        transport.set_accepting(false);
        coord.initiate_coordination(None).await.unwrap();
        assert_eq!(coord.statistics().await.send_failures, 2);
    }
}
