//! Background task lifecycle shared by the long-running components.
//!
//! Every component that owns loops (router, backpressure monitor, session
//! manager, coordinator) starts them through a [`TaskSet`] and stops them
//! the same way: flip the watch channel, then join each handle with a
//! bounded wait.
//!
//! User-supplied listeners run through [`guard_listener`], so a panicking
//! hook is logged and never takes down the loop that fired it.

use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// How long `stop()` waits for each loop to observe shutdown.
pub(crate) const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Running {
    active: bool,
    handles: Vec<JoinHandle<()>>,
}

pub(crate) struct TaskSet {
    shutdown_tx: watch::Sender<bool>,
    state: Mutex<Running>,
}

impl TaskSet {
    pub(crate) fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            state: Mutex::new(Running::default()),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.lock().active
    }

    /// Claim the set for a new run and arm the shutdown channel.
    ///
    /// Returns `None` if a run is already active, so only one of several
    /// racing `start()` calls gets to spawn.
    pub(crate) fn begin(&self) -> Option<watch::Receiver<bool>> {
        let mut state = self.state.lock();
        if state.active {
            return None;
        }
        state.active = true;
        self.shutdown_tx.send_replace(false);
        Some(self.shutdown_tx.subscribe())
    }

    pub(crate) fn push(&self, handle: JoinHandle<()>) {
        self.state.lock().handles.push(handle);
    }

    /// Signal shutdown and join every task.
    ///
    /// Returns `false` if nothing was running.
    pub(crate) async fn stop(&self, component: &str) -> bool {
        let handles = {
            let mut state = self.state.lock();
            if !state.active {
                return false;
            }
            state.active = false;
            std::mem::take(&mut state.handles)
        };

        let _ = self.shutdown_tx.send(true);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {
                    debug!(component, task = i + 1, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(component, task = i + 1, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(component, task = i + 1, "Task timed out during shutdown");
                }
            }
        }
        true
    }
}

/// Resolves once the shutdown flag is set (or its sender is gone).
pub(crate) async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Run a listener, containing any panic.
///
/// Returns `false` if the listener panicked.
pub(crate) fn guard_listener<F: FnOnce()>(context: &'static str, listener: F) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(listener)) {
        Ok(()) => true,
        Err(payload) => {
            error!(context, panic = %panic_message(&*payload), "Listener panicked");
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
