//! Table-driven coordination state machine.
//!
//! [`StateManager`] validates every transition against
//! [`CoordinationState::valid_transitions`]. A rejected transition returns
//! [`CoordinationError::InvalidTransition`] and leaves the machine untouched.
//!
//! An accepted transition runs, in order:
//!
//! 1. exit hooks registered for the old state
//! 2. history append (bounded ring, oldest dropped)
//! 3. the state change itself
//! 4. enter hooks registered for the new state
//! 5. generic transition hooks
//!
//! Hooks are advisory. A panicking hook is logged and the transition stays
//! applied.

use super::types::CoordinationState;
use crate::error::{CoordinationError, Result};
use crate::lifecycle::guard_listener;
use crate::metrics;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default number of transitions kept in history.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// One applied transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    pub from: CoordinationState,
    pub to: CoordinationState,
    pub trigger: String,
    pub at: Instant,
    pub metadata: HashMap<String, Value>,
}

/// Hook invoked with the transition being applied.
pub type TransitionHook = Arc<dyn Fn(&StateTransition) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct StateStats {
    pub current_state: CoordinationState,
    pub total_transitions: u64,
    pub visit_counts: HashMap<CoordinationState, u64>,
    pub valid_next_states: Vec<CoordinationState>,
    pub time_in_state: Duration,
}

/// Validating state machine over [`CoordinationState`].
pub struct StateManager {
    name: String,
    current: CoordinationState,
    entered_at: Instant,
    history: VecDeque<StateTransition>,
    history_limit: usize,
    visit_counts: HashMap<CoordinationState, u64>,
    total_transitions: u64,
    enter_hooks: HashMap<CoordinationState, Vec<TransitionHook>>,
    exit_hooks: HashMap<CoordinationState, Vec<TransitionHook>>,
    transition_hooks: Vec<TransitionHook>,
}

impl StateManager {
    /// Machine starting in `Disconnected`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_history_limit(name, DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(name: impl Into<String>, history_limit: usize) -> Self {
        let initial = CoordinationState::default();
        Self {
            name: name.into(),
            current: initial,
            entered_at: Instant::now(),
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
            visit_counts: HashMap::from([(initial, 1)]),
            total_transitions: 0,
            enter_hooks: HashMap::new(),
            exit_hooks: HashMap::new(),
            transition_hooks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current_state(&self) -> CoordinationState {
        self.current
    }

    pub fn can_transition_to(&self, to: CoordinationState) -> bool {
        self.current.can_transition_to(to)
    }

    pub fn valid_next_states(&self) -> Vec<CoordinationState> {
        self.current.valid_transitions().to_vec()
    }

    /// Time spent in the current state.
    pub fn state_duration(&self) -> Duration {
        self.entered_at.elapsed()
    }

    /// Validate and apply a transition.
    pub fn transition_to(
        &mut self,
        to: CoordinationState,
        trigger: &str,
        metadata: Option<HashMap<String, Value>>,
    ) -> Result<StateTransition> {
        let from = self.current;
        if !from.can_transition_to(to) {
            warn!(machine = %self.name, %from, %to, trigger, "Rejected invalid state transition");
            return Err(CoordinationError::InvalidTransition { from, to });
        }

        let transition = StateTransition {
            from,
            to,
            trigger: trigger.to_string(),
            at: Instant::now(),
            metadata: metadata.unwrap_or_default(),
        };

        Self::run_hooks(self.exit_hooks.get(&from), &transition);

        if self.history.len() >= self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(transition.clone());

        self.current = to;
        self.entered_at = transition.at;
        self.total_transitions += 1;
        *self.visit_counts.entry(to).or_insert(0) += 1;

        Self::run_hooks(self.enter_hooks.get(&to), &transition);
        Self::run_hooks(Some(&self.transition_hooks), &transition);

        debug!(machine = %self.name, %from, %to, trigger, "State transition");
        metrics::record_state_transition(from.as_str(), to.as_str());
        Ok(transition)
    }

    fn run_hooks(hooks: Option<&Vec<TransitionHook>>, transition: &StateTransition) {
        for hook in hooks.into_iter().flatten() {
            guard_listener("state_hook", || hook(transition));
        }
    }

    pub fn on_enter<F>(&mut self, state: CoordinationState, hook: F)
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.enter_hooks.entry(state).or_default().push(Arc::new(hook));
    }

    pub fn on_exit<F>(&mut self, state: CoordinationState, hook: F)
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.exit_hooks.entry(state).or_default().push(Arc::new(hook));
    }

    pub fn on_transition<F>(&mut self, hook: F)
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.transition_hooks.push(Arc::new(hook));
    }

    /// Applied transitions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &StateTransition> {
        self.history.iter()
    }

    pub fn last_transition(&self) -> Option<&StateTransition> {
        self.history.back()
    }

    /// Times `state` has been entered (the initial state counts once).
    pub fn visit_count(&self, state: CoordinationState) -> u64 {
        self.visit_counts.get(&state).copied().unwrap_or(0)
    }

    pub fn statistics(&self) -> StateStats {
        StateStats {
            current_state: self.current,
            total_transitions: self.total_transitions,
            visit_counts: self.visit_counts.clone(),
            valid_next_states: self.valid_next_states(),
            time_in_state: self.state_duration(),
        }
    }
}

impl fmt::Debug for StateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateManager")
            .field("name", &self.name)
            .field("current", &self.current)
            .field("total_transitions", &self.total_transitions)
            .field("history_len", &self.history.len())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for StateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StateManager({}, state={}, transitions={})",
            self.name, self.current, self.total_transitions
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use CoordinationState::*;

    #[test]
    fn test_initial_state() {
        let sm = StateManager::new("test");
        assert_eq!(sm.current_state(), Disconnected);
        assert_eq!(sm.valid_next_states(), vec![Connecting]);
        assert_eq!(sm.visit_count(Disconnected), 1);
        assert!(sm.last_transition().is_none());
    }

    #[test]
    fn test_invalid_transition_leaves_state() {
        let mut sm = StateManager::new("test");
        let err = sm.transition_to(Synchronized, "skip", None).unwrap_err();
        assert_eq!(
            err,
            CoordinationError::InvalidTransition {
                from: Disconnected,
                to: Synchronized
            }
        );
        assert_eq!(sm.current_state(), Disconnected);
        assert_eq!(sm.history().count(), 0);
        assert_eq!(sm.statistics().total_transitions, 0);
    }

    #[test]
    fn test_full_lifecycle() {
        let mut sm = StateManager::new("test");
        for (to, trigger) in [
            (Connecting, "join"),
            (Synchronized, "ready"),
            (Degraded, "error"),
            (Synchronized, "ready"),
            (Failed, "timeout"),
            (Connecting, "rejoin"),
        ] {
            sm.transition_to(to, trigger, None).unwrap();
        }
        assert_eq!(sm.current_state(), Connecting);
        assert_eq!(sm.visit_count(Synchronized), 2);
        assert_eq!(sm.visit_count(Connecting), 2);
        assert_eq!(sm.statistics().total_transitions, 6);

        let last = sm.last_transition().unwrap();
        assert_eq!((last.from, last.to), (Failed, Connecting));
        assert_eq!(last.trigger, "rejoin");
    }

    #[test]
    fn test_hook_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut sm = StateManager::new("test");

        let l = Arc::clone(&log);
        sm.on_exit(Disconnected, move |_| l.lock().push("exit"));
        let l = Arc::clone(&log);
        sm.on_enter(Connecting, move |_| l.lock().push("enter"));
        let l = Arc::clone(&log);
        sm.on_transition(move |t| {
            assert_eq!(t.to, Connecting);
            l.lock().push("transition")
        });
        // Not fired: registered for another state
        let l = Arc::clone(&log);
        sm.on_enter(Failed, move |_| l.lock().push("wrong"));

        sm.transition_to(Connecting, "join", None).unwrap();
        assert_eq!(*log.lock(), vec!["exit", "enter", "transition"]);
    }

    #[test]
    fn test_panicking_hook_does_not_roll_back() {
        let mut sm = StateManager::new("test");
        sm.on_enter(Connecting, |_| panic!("hook failure"));
        let seen = Arc::new(Mutex::new(0));
        let s = Arc::clone(&seen);
        sm.on_transition(move |_| *s.lock() += 1);

        assert!(sm.transition_to(Connecting, "join", None).is_ok());
        assert_eq!(sm.current_state(), Connecting);
        assert_eq!(*seen.lock(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut sm = StateManager::with_history_limit("test", 3);
        sm.transition_to(Connecting, "t1", None).unwrap();
        sm.transition_to(Synchronized, "t2", None).unwrap();
        sm.transition_to(Degraded, "t3", None).unwrap();
        sm.transition_to(Synchronized, "t4", None).unwrap();

        let triggers: Vec<_> = sm.history().map(|t| t.trigger.as_str()).collect();
        assert_eq!(triggers, vec!["t2", "t3", "t4"]);
    }

    #[test]
    fn test_metadata_recorded() {
        let mut sm = StateManager::new("test");
        let meta = HashMap::from([("child".to_string(), Value::from("a"))]);
        let t = sm.transition_to(Connecting, "join", Some(meta)).unwrap();
        assert_eq!(t.metadata["child"], "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_duration() {
        let mut sm = StateManager::new("test");
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(sm.state_duration() >= Duration::from_secs(5));
        sm.transition_to(Connecting, "join", None).unwrap();
        assert!(sm.state_duration() < Duration::from_secs(1));
    }
}
