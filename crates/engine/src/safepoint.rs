//! Safepoint gate: the barrier that halts worker threads across a freeze
//!
//! Worker threads that are not timers register a [`WorkerToken`] and call
//! [`WorkerToken::safepoint`] between units of work. While a checkpoint is
//! quiescing the gate, every registered worker blocks at its next safepoint;
//! the gate reports parked only when all of them are there.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use stasis_core::{CheckpointParticipant, RestoreContext, StasisError, StasisResult};

struct GateState {
    registered: usize,
    parked: usize,
    stop_requested: bool,
    /// Bumped on every release so a worker never sleeps through a
    /// resume followed by a new stop request
    release_count: u64,
}

struct GateInner {
    name: String,
    state: Mutex<GateState>,
    /// Workers arriving at a safepoint or deregistering
    arrivals: Condvar,
    /// Stop request lifted
    released: Condvar,
}

/// Barrier participant for ordinary worker threads
pub struct SafepointGate {
    inner: Arc<GateInner>,
}

impl SafepointGate {
    /// Create a gate with no registered workers
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(GateInner {
                name: name.into(),
                state: Mutex::new(GateState {
                    registered: 0,
                    parked: 0,
                    stop_requested: false,
                    release_count: 0,
                }),
                arrivals: Condvar::new(),
                released: Condvar::new(),
            }),
        }
    }

    /// Register the calling worker
    ///
    /// The worker counts toward quiescence until the token is dropped. Blocks
    /// while a checkpoint holds the gate closed, so a late worker never runs
    /// through the freeze.
    pub fn register(&self) -> WorkerToken {
        let mut state = self.inner.state.lock();
        while state.stop_requested {
            self.inner.released.wait(&mut state);
        }
        state.registered += 1;
        drop(state);
        WorkerToken {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of registered workers
    pub fn registered(&self) -> usize {
        self.inner.state.lock().registered
    }

    /// Number of workers currently blocked at a safepoint
    pub fn parked(&self) -> usize {
        self.inner.state.lock().parked
    }
}

impl std::fmt::Debug for SafepointGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SafepointGate")
            .field("name", &self.inner.name)
            .field("registered", &state.registered)
            .field("parked", &state.parked)
            .field("stop_requested", &state.stop_requested)
            .finish()
    }
}

impl CheckpointParticipant for SafepointGate {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn quiesce(&self, timeout: Duration) -> StasisResult<()> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.inner.state.lock();
        state.stop_requested = true;

        while state.parked < state.registered {
            let timed_out = match deadline {
                Some(deadline) => self
                    .inner
                    .arrivals
                    .wait_until(&mut state, deadline)
                    .timed_out(),
                None => {
                    self.inner.arrivals.wait(&mut state);
                    false
                }
            };
            if timed_out && state.parked < state.registered {
                let missing = state.registered - state.parked;
                state.stop_requested = false;
                state.release_count += 1;
                self.inner.released.notify_all();
                warn!(
                    target: "stasis::checkpoint",
                    gate = %self.inner.name,
                    missing,
                    "Workers did not reach a safepoint in time"
                );
                return Err(StasisError::QuiesceTimeout {
                    participant: self.inner.name.clone(),
                    waited: timeout,
                });
            }
        }

        debug!(
            target: "stasis::checkpoint",
            gate = %self.inner.name,
            parked = state.parked,
            "Safepoint gate closed"
        );
        Ok(())
    }

    fn resume(&self, _restore: Option<&RestoreContext>) {
        let mut state = self.inner.state.lock();
        state.stop_requested = false;
        state.release_count += 1;
        self.inner.released.notify_all();
    }
}

/// Registration of one worker thread with a [`SafepointGate`]
pub struct WorkerToken {
    inner: Arc<GateInner>,
}

impl WorkerToken {
    /// Block here while a checkpoint holds the gate closed
    pub fn safepoint(&self) {
        let mut state = self.inner.state.lock();
        if !state.stop_requested {
            return;
        }

        let release = state.release_count;
        state.parked += 1;
        self.inner.arrivals.notify_all();
        while state.stop_requested && state.release_count == release {
            self.inner.released.wait(&mut state);
        }
        state.parked -= 1;
    }

    /// Whether a checkpoint is waiting for workers to reach a safepoint
    ///
    /// Long-running loops can poll this to reach `safepoint` sooner.
    pub fn stop_requested(&self) -> bool {
        self.inner.state.lock().stop_requested
    }
}

impl Drop for WorkerToken {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.registered -= 1;
        // A quiesce may be waiting only on this worker
        self.inner.arrivals.notify_all();
    }
}

impl std::fmt::Debug for WorkerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerToken")
            .field("gate", &self.inner.name)
            .finish()
    }
}
