//! Checkpoint orchestrator
//!
//! Drives one checkpoint cycle through
//!
//! ```text
//! Idle -> PreHookRunning -> Quiescing -> Frozen -> Restoring -> PostHookRunning -> Idle
//! ```
//!
//! ## Ordering
//!
//! - Timers park first, then pre-checkpoint hooks run, then worker threads
//!   park. A hook may still hand work to worker threads and may schedule
//!   timer tasks, but a task it schedules only runs after the restore. A hook
//!   must not wait for a timer task to fire.
//! - The epoch pair is recorded after every participant parked and
//!   immediately before the freeze mechanism takes over.
//! - `record_restore` is the first thing that happens after the freeze
//!   mechanism returns. Participants are then resumed with the restore
//!   context; a timer re-bases its pending tasks before its dispatcher runs.
//! - Post-restore hooks run last, against the compensated clock.
//!
//! A failed attempt discards the pending epoch and resumes every parked
//! participant on the unchanged timeline. Pre-checkpoint hook effects are not
//! rolled back.

use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use stasis_clock::{ClockCompensator, TimeSource};
use stasis_core::{
    CheckpointId, CheckpointParticipant, CheckpointPhase, EpochPair, RestoreContext,
    RestoreRecord, StasisConfig, StasisError, StasisResult, WallTime,
};
use stasis_hooks::{Hook, HookHandle, HookRegistry, PostRestoreReport};
use stasis_timer::{Timer, TimerConfig};

use crate::builder::OrchestratorBuilder;
use crate::freeze::FreezeMechanism;
use crate::safepoint::SafepointGate;

/// Result of a completed checkpoint cycle
#[derive(Debug, Clone)]
pub struct CheckpointOutcome {
    /// Attempt identifier
    pub id: CheckpointId,
    /// Epoch recorded before the freeze
    pub epoch: EpochPair,
    /// Restore record installed in the compensator
    pub restore: RestoreRecord,
    /// Outcome of the post-restore hooks
    pub post_restore: PostRestoreReport,
}

/// Checkpoint metrics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointMetrics {
    /// Attempts that entered `PreHookRunning`
    pub attempted: u64,
    /// Attempts that completed a restore
    pub completed: u64,
    /// Attempts that ended in an error
    pub failed: u64,
    /// Requests rejected because an attempt was in progress
    pub rejected: u64,
}

/// Process-lifetime coordinator of checkpoint and restore
///
/// Construct one with [`CheckpointOrchestrator::builder`] at process start and
/// pass it to the subsystems that need it.
///
/// # Memory Ordering
///
/// The metric counters use Relaxed ordering: they are observational only and
/// do not synchronize other memory.
pub struct CheckpointOrchestrator {
    config: StasisConfig,
    timer_config: TimerConfig,
    clock: Arc<ClockCompensator>,
    hooks: HookRegistry,
    freeze: Arc<dyn FreezeMechanism>,
    /// Owned by their subsystems; dead entries are pruned
    participants: RwLock<Vec<Weak<dyn CheckpointParticipant>>>,
    phase: Mutex<CheckpointPhase>,
    in_progress: AtomicBool,
    /// Only honoured while the phase is `PreHookRunning`
    cancel_requested: AtomicBool,
    /// Set by a fatal compensation overflow
    poisoned: Mutex<Option<&'static str>>,
    attempted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

impl CheckpointOrchestrator {
    /// Start configuring an orchestrator
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub(crate) fn from_parts(
        config: StasisConfig,
        timer_config: TimerConfig,
        clock: Arc<ClockCompensator>,
        freeze: Arc<dyn FreezeMechanism>,
    ) -> Self {
        Self {
            config,
            timer_config,
            clock,
            hooks: HookRegistry::new(),
            freeze,
            participants: RwLock::new(Vec::new()),
            phase: Mutex::new(CheckpointPhase::Idle),
            in_progress: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            poisoned: Mutex::new(None),
            attempted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The compensated clock every time call site should read through
    pub fn clock(&self) -> &Arc<ClockCompensator> {
        &self.clock
    }

    /// Hook registry
    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Effective configuration
    pub fn config(&self) -> &StasisConfig {
        &self.config
    }

    /// Name of the freeze mechanism in use
    pub fn freeze_mechanism(&self) -> &str {
        self.freeze.name()
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a hook to run before every checkpoint
    pub fn register_pre_checkpoint(&self, hook: Arc<dyn Hook>) -> HookHandle {
        self.hooks.register_pre_checkpoint(hook)
    }

    /// Register a hook to run after every restore
    pub fn register_post_restore(&self, hook: Arc<dyn Hook>) -> HookHandle {
        self.hooks.register_post_restore(hook)
    }

    /// Remove a hook registration
    pub fn unregister(&self, handle: HookHandle) -> bool {
        self.hooks.unregister(handle)
    }

    /// Register a participant to be parked across every checkpoint
    ///
    /// Only a weak reference is kept; a dropped participant is skipped.
    pub fn register_participant<P>(&self, participant: &Arc<P>)
    where
        P: CheckpointParticipant + 'static,
    {
        let weak: Weak<P> = Arc::downgrade(participant);
        let weak: Weak<dyn CheckpointParticipant> = weak;
        info!(
            target: "stasis::checkpoint",
            participant = %participant.name(),
            "Registered checkpoint participant"
        );
        self.participants.write().push(weak);
    }

    /// Number of live registered participants
    pub fn participant_count(&self) -> usize {
        self.participants
            .read()
            .iter()
            .filter(|p| p.strong_count() > 0)
            .count()
    }

    /// Create a timer on the compensated clock, registered for reconciliation
    ///
    /// # Errors
    ///
    /// Returns `Io` if the dispatcher thread cannot be spawned.
    pub fn new_timer(&self, name: impl Into<String>) -> StasisResult<Arc<Timer>> {
        let timer = Arc::new(Timer::new(
            name,
            Arc::clone(&self.clock) as Arc<dyn TimeSource>,
            self.timer_config,
        )?);
        self.register_participant(&timer);
        Ok(timer)
    }

    /// Create a safepoint gate for worker threads, registered for quiescence
    pub fn new_safepoint_gate(&self, name: impl Into<String>) -> Arc<SafepointGate> {
        let gate = Arc::new(SafepointGate::new(name));
        self.register_participant(&gate);
        gate
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Current phase of the in-progress attempt, `Idle` if none
    pub fn phase(&self) -> CheckpointPhase {
        *self.phase.lock()
    }

    /// Whether an attempt is between `PreHookRunning` and `Idle`
    pub fn is_checkpoint_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Wall-clock instant of the most recent restore, `None` before the first
    pub fn last_restore_instant(&self) -> Option<WallTime> {
        self.clock.last_restore_instant()
    }

    /// Whether at least one restore has occurred
    pub fn has_restored(&self) -> bool {
        self.clock.has_restored()
    }

    /// Process uptime excluding time spent frozen
    pub fn uptime(&self) -> Duration {
        self.clock.uptime()
    }

    /// Whether a fatal compensation overflow disabled checkpointing
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.lock().is_some()
    }

    /// Return a snapshot of checkpoint metrics
    pub fn metrics(&self) -> CheckpointMetrics {
        CheckpointMetrics {
            attempted: self.attempted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Checkpoint
    // =========================================================================

    /// Ask the in-progress attempt to stop before quiescence
    ///
    /// Returns true if the attempt is still running pre-checkpoint hooks, in
    /// which case it fails with `Cancelled` before any worker thread is parked
    /// and already parked timers are resumed. Once worker quiescence has begun
    /// the attempt runs to completion.
    pub fn cancel_pending(&self) -> bool {
        let phase = self.phase.lock();
        if !phase.is_cancellable() {
            return false;
        }
        self.cancel_requested.store(true, Ordering::Release);
        info!(target: "stasis::checkpoint", "Checkpoint cancellation requested");
        true
    }

    /// Checkpoint into the configured `image_dir`
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if no image directory is configured, otherwise
    /// as [`checkpoint`](Self::checkpoint).
    pub fn checkpoint_default(&self) -> StasisResult<CheckpointOutcome> {
        let image_dir = self.config.image_dir.clone().ok_or_else(|| {
            StasisError::invalid_config("checkpoint_default() requires image_dir in stasis.toml")
        })?;
        self.checkpoint(image_dir)
    }

    /// Run one full checkpoint cycle, blocking through the freeze
    ///
    /// Returns after the process has been restored and post-restore hooks
    /// have run.
    ///
    /// # Errors
    ///
    /// - `ConcurrentCheckpointRejected` if an attempt is already in progress
    /// - `HookFailure` if a pre-checkpoint hook failed (nothing was frozen)
    /// - `Cancelled` if [`cancel_pending`](Self::cancel_pending) took effect
    /// - `QuiesceTimeout` if a participant did not park in time
    /// - `FreezeMechanismFailure` if the snapshot could not be taken
    /// - `OffsetOverflow` (fatal) if the restore could not be compensated
    pub fn checkpoint(&self, image_dir: impl AsRef<Path>) -> StasisResult<CheckpointOutcome> {
        if let Some(context) = *self.poisoned.lock() {
            return Err(StasisError::OffsetOverflow { context });
        }

        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(target: "stasis::checkpoint", "Checkpoint rejected: already in progress");
            return Err(StasisError::ConcurrentCheckpointRejected);
        }
        let _guard = InProgressGuard { orchestrator: self };

        self.attempted.fetch_add(1, Ordering::Relaxed);
        let id = CheckpointId::new();
        let result = self.run_cycle(id, image_dir.as_ref());

        match &result {
            Ok(outcome) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    target: "stasis::checkpoint",
                    checkpoint = %id,
                    restore_wall = %outcome.restore.wall_clock_at_restore,
                    post_restore_failures = outcome.post_restore.failures.len(),
                    "Checkpoint cycle complete"
                );
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                if e.is_fatal() {
                    error!(target: "stasis::checkpoint", checkpoint = %id, error = %e, "Checkpoint failed fatally");
                } else {
                    warn!(target: "stasis::checkpoint", checkpoint = %id, error = %e, "Checkpoint aborted");
                }
            }
        }
        result
    }

    fn run_cycle(&self, id: CheckpointId, image_dir: &Path) -> StasisResult<CheckpointOutcome> {
        info!(
            target: "stasis::checkpoint",
            checkpoint = %id,
            image = %image_dir.display(),
            freeze = %self.freeze.name(),
            "Checkpoint requested"
        );

        self.transition(id, CheckpointPhase::PreHookRunning);
        self.check_cancelled(id, CheckpointPhase::PreHookRunning)?;

        let (early, late): (Vec<_>, Vec<_>) = self
            .live_participants()
            .into_iter()
            .partition(|p| p.parks_before_hooks());
        self.quiesce_all(id, &early)?;

        let hooks_done = self
            .hooks
            .run_pre_checkpoint()
            .and_then(|_| self.check_cancelled(id, CheckpointPhase::Quiescing))
            .and_then(|()| self.quiesce_all(id, &late));
        if let Err(e) = hooks_done {
            Self::resume_all(&early, None);
            return Err(e);
        }

        // Parking order, so resume_all releases late participants first
        let participants: Vec<_> = early.into_iter().chain(late).collect();

        let epoch = self.clock.snapshot_epoch();
        self.transition(id, CheckpointPhase::Frozen);

        if let Err(e) = self.freeze.suspend_and_snapshot(image_dir) {
            self.clock.discard_epoch();
            Self::resume_all(&participants, None);
            return Err(e.into());
        }

        self.transition(id, CheckpointPhase::Restoring);
        let record = match self.clock.record_restore() {
            Ok(record) => record,
            Err(e) => {
                if let StasisError::OffsetOverflow { context } = e {
                    *self.poisoned.lock() = Some(context);
                }
                Self::resume_all(&participants, None);
                return Err(e);
            }
        };

        let restore = RestoreContext {
            checkpoint_id: id,
            epoch,
            record,
        };
        Self::resume_all(&participants, Some(&restore));

        self.transition(id, CheckpointPhase::PostHookRunning);
        let post_restore = self.hooks.run_post_restore();

        Ok(CheckpointOutcome {
            id,
            epoch,
            restore: record,
            post_restore,
        })
    }

    fn transition(&self, id: CheckpointId, to: CheckpointPhase) {
        let mut phase = self.phase.lock();
        debug!(
            target: "stasis::checkpoint",
            checkpoint = %id,
            from = %*phase,
            to = %to,
            "Phase transition"
        );
        *phase = to;
    }

    /// Honour a pending cancellation, otherwise move to `next`
    ///
    /// Checked and transitioned under the phase lock, so `cancel_pending`
    /// either lands before this check or sees a non-cancellable phase.
    fn check_cancelled(&self, id: CheckpointId, next: CheckpointPhase) -> StasisResult<()> {
        let mut phase = self.phase.lock();
        if self.cancel_requested.swap(false, Ordering::AcqRel) {
            info!(target: "stasis::checkpoint", checkpoint = %id, "Checkpoint cancelled");
            return Err(StasisError::Cancelled);
        }
        if *phase != next {
            debug!(
                target: "stasis::checkpoint",
                checkpoint = %id,
                from = %*phase,
                to = %next,
                "Phase transition"
            );
            *phase = next;
        }
        Ok(())
    }

    fn live_participants(&self) -> Vec<Arc<dyn CheckpointParticipant>> {
        let mut participants = self.participants.write();
        participants.retain(|p| p.strong_count() > 0);
        participants.iter().filter_map(Weak::upgrade).collect()
    }

    fn quiesce_all(
        &self,
        id: CheckpointId,
        participants: &[Arc<dyn CheckpointParticipant>],
    ) -> StasisResult<()> {
        let timeout = self.config.quiesce_timeout();
        for (i, participant) in participants.iter().enumerate() {
            if let Err(e) = participant.quiesce(timeout) {
                warn!(
                    target: "stasis::checkpoint",
                    checkpoint = %id,
                    participant = %participant.name(),
                    error = %e,
                    "Participant failed to quiesce"
                );
                Self::resume_all(&participants[..i], None);
                return Err(e);
            }
        }
        debug!(
            target: "stasis::checkpoint",
            checkpoint = %id,
            parked = participants.len(),
            "All participants parked"
        );
        Ok(())
    }

    /// Resume in reverse registration order
    fn resume_all(
        participants: &[Arc<dyn CheckpointParticipant>],
        restore: Option<&RestoreContext>,
    ) {
        for participant in participants.iter().rev() {
            participant.resume(restore);
        }
    }
}

impl std::fmt::Debug for CheckpointOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointOrchestrator")
            .field("phase", &self.phase())
            .field("freeze", &self.freeze.name())
            .field("participants", &self.participant_count())
            .field("metrics", &self.metrics())
            .finish()
    }
}

/// RAII guard that returns the orchestrator to `Idle` on every exit path
struct InProgressGuard<'a> {
    orchestrator: &'a CheckpointOrchestrator,
}

impl<'a> Drop for InProgressGuard<'a> {
    fn drop(&mut self) {
        *self.orchestrator.phase.lock() = CheckpointPhase::Idle;
        self.orchestrator
            .cancel_requested
            .store(false, Ordering::Release);
        self.orchestrator.in_progress.store(false, Ordering::Release);
    }
}
