//! Hook Registry
//!
//! Two disjoint ordered sequences of hooks: pre-checkpoint and post-restore.
//! Registration order is execution order.
//!
//! ## How It Works
//!
//! 1. Subsystems register hooks at any time and keep the returned handle
//! 2. The orchestrator calls `run_pre_checkpoint()` before quiescing
//! 3. The orchestrator calls `run_post_restore()` once the restore is installed
//!
//! Each run works on a snapshot of the sequence taken when the run starts, so
//! a hook may register further hooks; they take effect on the next checkpoint.
//!
//! ## Failure Semantics
//!
//! | Phase          | On failure                                        |
//! |----------------|---------------------------------------------------|
//! | pre-checkpoint | stop, return `HookFailure`; no snapshot is taken  |
//! | post-restore   | log, record, keep running the remaining hooks     |
//!
//! A panicking hook counts as a failing hook.

use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use stasis_core::{HookPhase, StasisError, StasisResult};

use crate::hook::Hook;

/// Identifies one registration, for later deregistration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle {
    id: u64,
    phase: HookPhase,
}

impl HookHandle {
    /// Phase the hook was registered for
    pub fn phase(&self) -> HookPhase {
        self.phase
    }

    /// Registration sequence number (unique per registry)
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Clone)]
struct HookEntry {
    id: u64,
    hook: Arc<dyn Hook>,
}

/// One failed post-restore hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFailureRecord {
    /// Hook name
    pub hook: String,
    /// Failure description
    pub message: String,
}

/// Outcome of running the post-restore sequence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostRestoreReport {
    /// Number of hooks invoked (failed ones included)
    pub executed: usize,
    /// Failures in execution order
    pub failures: Vec<HookFailureRecord>,
}

impl PostRestoreReport {
    /// Whether every hook succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Ordered pre-checkpoint and post-restore hook sequences
pub struct HookRegistry {
    pre_checkpoint: RwLock<Vec<HookEntry>>,
    post_restore: RwLock<Vec<HookEntry>>,
    next_id: AtomicU64,
}

impl HookRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            pre_checkpoint: RwLock::new(Vec::new()),
            post_restore: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn sequence(&self, phase: HookPhase) -> &RwLock<Vec<HookEntry>> {
        match phase {
            HookPhase::PreCheckpoint => &self.pre_checkpoint,
            HookPhase::PostRestore => &self.post_restore,
        }
    }

    fn register(&self, phase: HookPhase, hook: Arc<dyn Hook>) -> HookHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(target: "stasis::hooks", %phase, name = hook.name(), id, "Registered hook");
        self.sequence(phase).write().push(HookEntry { id, hook });
        HookHandle { id, phase }
    }

    /// Append a hook to the pre-checkpoint sequence
    pub fn register_pre_checkpoint(&self, hook: Arc<dyn Hook>) -> HookHandle {
        self.register(HookPhase::PreCheckpoint, hook)
    }

    /// Append a hook to the post-restore sequence
    pub fn register_post_restore(&self, hook: Arc<dyn Hook>) -> HookHandle {
        self.register(HookPhase::PostRestore, hook)
    }

    /// Remove a registration
    ///
    /// Returns `false` if the handle was already removed.
    pub fn unregister(&self, handle: HookHandle) -> bool {
        let mut sequence = self.sequence(handle.phase).write();
        match sequence.iter().position(|e| e.id == handle.id) {
            Some(index) => {
                let entry = sequence.remove(index);
                debug!(
                    target: "stasis::hooks",
                    phase = %handle.phase,
                    name = entry.hook.name(),
                    "Unregistered hook"
                );
                true
            }
            None => false,
        }
    }

    /// Number of hooks registered for a phase
    pub fn len(&self, phase: HookPhase) -> usize {
        self.sequence(phase).read().len()
    }

    /// Whether no hooks are registered at all
    pub fn is_empty(&self) -> bool {
        self.pre_checkpoint.read().is_empty() && self.post_restore.read().is_empty()
    }

    /// Names of the hooks registered for a phase, in execution order
    pub fn names(&self, phase: HookPhase) -> Vec<String> {
        self.sequence(phase)
            .read()
            .iter()
            .map(|e| e.hook.name().to_string())
            .collect()
    }

    fn snapshot(&self, phase: HookPhase) -> Vec<HookEntry> {
        self.sequence(phase).read().clone()
    }

    /// Run the pre-checkpoint sequence, fail-stop
    ///
    /// Returns the number of hooks executed.
    ///
    /// # Errors
    ///
    /// Returns `HookFailure` for the first failing hook; later hooks do not run.
    pub fn run_pre_checkpoint(&self) -> StasisResult<usize> {
        let hooks = self.snapshot(HookPhase::PreCheckpoint);
        for entry in &hooks {
            debug!(target: "stasis::hooks", name = entry.hook.name(), "Running pre-checkpoint hook");
            if let Err(message) = invoke(entry.hook.as_ref()) {
                return Err(StasisError::HookFailure {
                    phase: HookPhase::PreCheckpoint,
                    hook: entry.hook.name().to_string(),
                    message,
                });
            }
        }
        info!(target: "stasis::hooks", count = hooks.len(), "Pre-checkpoint hooks complete");
        Ok(hooks.len())
    }

    /// Run the post-restore sequence, best-effort
    ///
    /// Every hook runs even after a failure; failures are logged and reported.
    pub fn run_post_restore(&self) -> PostRestoreReport {
        let hooks = self.snapshot(HookPhase::PostRestore);
        let mut report = PostRestoreReport::default();
        for entry in &hooks {
            debug!(target: "stasis::hooks", name = entry.hook.name(), "Running post-restore hook");
            report.executed += 1;
            if let Err(message) = invoke(entry.hook.as_ref()) {
                error!(
                    target: "stasis::hooks",
                    name = entry.hook.name(),
                    error = %message,
                    "Post-restore hook failed, continuing"
                );
                report.failures.push(HookFailureRecord {
                    hook: entry.hook.name().to_string(),
                    message,
                });
            }
        }
        info!(
            target: "stasis::hooks",
            count = report.executed,
            failed = report.failures.len(),
            "Post-restore hooks complete"
        );
        report
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("pre_checkpoint", &self.names(HookPhase::PreCheckpoint))
            .field("post_restore", &self.names(HookPhase::PostRestore))
            .finish()
    }
}

/// Run one hook, turning errors and panics into a message
fn invoke(hook: &dyn Hook) -> Result<(), String> {
    match catch_unwind(AssertUnwindSafe(|| hook.run())) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked: (non-string panic)".to_string()
    }
}
