//! Single-thread timer with checkpoint-aware deadlines
//!
//! One dispatcher thread owns a deadline-ordered heap. It sleeps on a condvar
//! until the earliest entry comes due, fires it outside the lock, and pushes
//! the next occurrence for periodic tasks.
//!
//! Every entry carries a due instant on the virtual monotonic clock. Entries
//! scheduled for a wall-clock instant also keep that instant: the due time is
//! only an estimate and is re-derived from the wall clock when the entry is
//! popped and on every restore.
//!
//! ## Checkpoint participation
//!
//! `quiesce` parks the dispatcher between firings. `resume` re-bases pending
//! entries while the dispatcher is still parked, then releases it.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::any::Any;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use stasis_clock::TimeSource;
use stasis_core::{
    duration_to_nanos, nanos_to_duration, CheckpointParticipant, MissedFiringPolicy,
    MonotonicTime, RestoreContext, StasisConfig, StasisError, StasisResult, WallTime,
};

use crate::task::{Deadline, Recurrence, TaskHandle, TaskShared, TaskSpec};

/// Timer behaviour knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// What periodic fixed-rate tasks do about periods they could not run in
    pub missed_firings: MissedFiringPolicy,
    /// Firings later than this past their due time are counted as tardy
    pub max_tardiness: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            missed_firings: MissedFiringPolicy::Coalesce,
            max_tardiness: Duration::from_millis(4_000),
        }
    }
}

impl TimerConfig {
    /// Derive from the process configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `missed_firings` is not a known policy.
    pub fn from_config(config: &StasisConfig) -> StasisResult<Self> {
        Ok(Self {
            missed_firings: config.missed_firing_policy()?,
            max_tardiness: config.max_tardiness(),
        })
    }
}

/// Timer metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerStats {
    /// Tasks waiting in the queue (cancelled entries excluded)
    pub pending: usize,
    /// Total firings since creation
    pub fired: u64,
    /// Tasks cancelled before they stopped firing on their own
    pub cancelled: u64,
    /// Entries re-based across restores
    pub rebased: u64,
    /// Firings later than the tardiness budget
    pub tardy: u64,
    /// Whether the dispatcher is currently parked for a checkpoint
    pub parked: bool,
}

struct ScheduledEntry {
    due: MonotonicTime,
    /// Absolute deadline, for tasks scheduled against the wall clock
    wall_due: Option<WallTime>,
    sequence: u64,
    task: Arc<TaskShared>,
}

impl Eq for ScheduledEntry {}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

// Earliest due first, then lower sequence (older) first
impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct TimerState {
    queue: BinaryHeap<ScheduledEntry>,
    /// A checkpoint asked the dispatcher to stop firing
    paused: bool,
    /// The dispatcher acknowledged `paused` and is not running a task
    parked: bool,
    shutdown: bool,
}

struct TimerInner {
    name: String,
    clock: Arc<dyn TimeSource>,
    config: TimerConfig,
    state: Mutex<TimerState>,
    work_ready: Condvar,
    parked_cond: Condvar,
    sequence: AtomicU64,
    next_task_id: AtomicU64,
    fired: AtomicU64,
    tardy: AtomicU64,
    rebased: AtomicU64,
    cancelled: Arc<AtomicU64>,
}

/// A scheduled-task facility whose deadlines survive checkpoint and restore
///
/// The dispatcher thread is named `stasis-timer-<name>`.
pub struct Timer {
    inner: Arc<TimerInner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    dispatcher_id: ThreadId,
}

impl Timer {
    /// Create a timer and start its dispatcher thread
    ///
    /// # Errors
    ///
    /// Returns `Io` if the dispatcher thread cannot be spawned.
    pub fn new(
        name: impl Into<String>,
        clock: Arc<dyn TimeSource>,
        config: TimerConfig,
    ) -> StasisResult<Self> {
        let name = name.into();
        let inner = Arc::new(TimerInner {
            name: name.clone(),
            clock,
            config,
            state: Mutex::new(TimerState {
                queue: BinaryHeap::new(),
                paused: false,
                parked: false,
                shutdown: false,
            }),
            work_ready: Condvar::new(),
            parked_cond: Condvar::new(),
            sequence: AtomicU64::new(0),
            next_task_id: AtomicU64::new(1),
            fired: AtomicU64::new(0),
            tardy: AtomicU64::new(0),
            rebased: AtomicU64::new(0),
            cancelled: Arc::new(AtomicU64::new(0)),
        });

        let inner_clone = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(format!("stasis-timer-{}", name))
            .spawn(move || dispatcher_loop(&inner_clone))?;

        debug!(target: "stasis::timer", timer = %name, "Timer started");

        Ok(Self {
            dispatcher_id: handle.thread().id(),
            inner,
            dispatcher: Mutex::new(Some(handle)),
        })
    }

    /// Timer name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Schedule a task
    ///
    /// # Errors
    ///
    /// - `TimerShutdown` if the timer was cancelled
    /// - `InvalidTask` for a zero repeat period or a delay past the end of the clock
    pub fn schedule<F>(&self, spec: TaskSpec, action: F) -> StasisResult<TaskHandle>
    where
        F: FnMut() + Send + 'static,
    {
        spec.validate()?;

        let now = self.inner.clock.monotonic();
        let (due, wall_due) = match spec.deadline() {
            Deadline::After(delay) => {
                let due = now.checked_add(delay).ok_or_else(|| {
                    StasisError::InvalidTask(format!(
                        "task '{}' delay {:?} overflows the monotonic clock",
                        spec.name(),
                        delay
                    ))
                })?;
                (due, None)
            }
            Deadline::At(instant) => (
                due_for_wall(instant, now, self.inner.clock.wall_clock()),
                Some(instant),
            ),
        };

        let id = self.inner.next_task_id.fetch_add(1, AtomicOrdering::Relaxed);
        let task = Arc::new(TaskShared::new(
            id,
            &spec,
            Box::new(action),
            Arc::clone(&self.inner.cancelled),
        ));

        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return Err(StasisError::TimerShutdown(self.inner.name.clone()));
            }
            state.queue.push(ScheduledEntry {
                due,
                wall_due,
                sequence: self.inner.sequence.fetch_add(1, AtomicOrdering::Relaxed),
                task: Arc::clone(&task),
            });
            // Notify under the lock: the dispatcher may be in a timed wait for
            // a later deadline than this one.
            self.inner.work_ready.notify_one();
        }

        debug!(
            target: "stasis::timer",
            timer = %self.inner.name,
            task = %spec.name(),
            id,
            "Task scheduled"
        );
        Ok(TaskHandle::new(task))
    }

    /// Schedule a one-shot task `delay` from now
    pub fn schedule_after<F>(&self, delay: Duration, action: F) -> StasisResult<TaskHandle>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule(TaskSpec::after(delay), action)
    }

    /// Schedule a one-shot task for a wall-clock instant
    ///
    /// An instant already in the past fires as soon as possible.
    pub fn schedule_at<F>(&self, instant: WallTime, action: F) -> StasisResult<TaskHandle>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule(TaskSpec::at(instant), action)
    }

    /// Cancel every pending task and stop the dispatcher
    ///
    /// All pending tasks are cancelled under one lock acquisition, so no task
    /// fires after this returns. A firing already in progress completes first.
    /// Returns the number of tasks this cancelled.
    pub fn cancel(&self) -> usize {
        let cancelled = {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                0
            } else {
                state.shutdown = true;
                let cancelled = state.queue.drain().filter(|e| e.task.cancel()).count();
                self.inner.work_ready.notify_all();
                self.inner.parked_cond.notify_all();
                cancelled
            }
        };

        if cancelled > 0 {
            info!(
                target: "stasis::timer",
                timer = %self.inner.name,
                cancelled,
                "Timer cancelled"
            );
        }

        // A task that cancels its own timer cannot join the thread running it
        if std::thread::current().id() != self.dispatcher_id {
            if let Some(handle) = self.dispatcher.lock().take() {
                let _ = handle.join();
            }
        }
        cancelled
    }

    /// Whether `cancel` has been called
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// Drop cancelled entries from the queue, returning how many were removed
    pub fn purge(&self) -> usize {
        let mut state = self.inner.state.lock();
        let before = state.queue.len();
        state.queue.retain(|e| !e.task.is_cancelled());
        before - state.queue.len()
    }

    /// Return a snapshot of timer metrics
    pub fn stats(&self) -> TimerStats {
        let (pending, parked) = {
            let state = self.inner.state.lock();
            let pending = state
                .queue
                .iter()
                .filter(|e| !e.task.is_cancelled())
                .count();
            (pending, state.parked)
        };
        TimerStats {
            pending,
            fired: self.inner.fired.load(AtomicOrdering::Relaxed),
            cancelled: self.inner.cancelled.load(AtomicOrdering::Relaxed),
            rebased: self.inner.rebased.load(AtomicOrdering::Relaxed),
            tardy: self.inner.tardy.load(AtomicOrdering::Relaxed),
            parked,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl CheckpointParticipant for Timer {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn parks_before_hooks(&self) -> bool {
        true
    }

    fn quiesce(&self, timeout: Duration) -> StasisResult<()> {
        if std::thread::current().id() == self.dispatcher_id {
            warn!(
                target: "stasis::timer",
                timer = %self.inner.name,
                "Quiesce requested from the timer's own dispatcher thread"
            );
            return Err(StasisError::QuiesceTimeout {
                participant: self.inner.name.clone(),
                waited: Duration::ZERO,
            });
        }

        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return Ok(());
        }
        state.paused = true;
        self.inner.work_ready.notify_all();

        while !state.parked && !state.shutdown {
            let timed_out = match deadline {
                Some(deadline) => self
                    .inner
                    .parked_cond
                    .wait_until(&mut state, deadline)
                    .timed_out(),
                None => {
                    self.inner.parked_cond.wait(&mut state);
                    false
                }
            };
            if timed_out && !state.parked && !state.shutdown {
                state.paused = false;
                self.inner.work_ready.notify_all();
                warn!(
                    target: "stasis::timer",
                    timer = %self.inner.name,
                    ?timeout,
                    "Timer did not park in time"
                );
                return Err(StasisError::QuiesceTimeout {
                    participant: self.inner.name.clone(),
                    waited: timeout,
                });
            }
        }

        debug!(target: "stasis::timer", timer = %self.inner.name, "Timer parked");
        Ok(())
    }

    fn resume(&self, restore: Option<&RestoreContext>) {
        let mut state = self.inner.state.lock();
        if let Some(ctx) = restore {
            self.inner.rebase(&mut state, ctx);
        }
        state.paused = false;
        state.parked = false;
        self.inner.work_ready.notify_all();
    }
}

impl TimerInner {
    /// Recompute every pending due time after a restore
    ///
    /// Relative entries keep the virtual delay that was outstanding at
    /// checkpoint; absolute entries are measured against the wall clock now.
    fn rebase(&self, state: &mut TimerState, ctx: &RestoreContext) {
        let now = self.clock.monotonic();
        let now_wall = self.clock.wall_clock();

        let entries = std::mem::take(&mut state.queue).into_vec();
        let mut rebased = 0u64;
        for mut entry in entries {
            if entry.task.is_cancelled() {
                continue;
            }
            entry.due = match entry.wall_due {
                Some(wall_due) => due_for_wall(wall_due, now, now_wall),
                None => now.saturating_add(ctx.remaining_at_checkpoint(entry.due)),
            };
            state.queue.push(entry);
            rebased += 1;
        }

        self.rebased.fetch_add(rebased, AtomicOrdering::Relaxed);
        info!(
            target: "stasis::timer",
            timer = %self.name,
            checkpoint = %ctx.checkpoint_id,
            rebased,
            "Re-based pending tasks after restore"
        );
    }

    fn fire(&self, entry: &ScheduledEntry, now: MonotonicTime) {
        let lateness = now.saturating_duration_since(entry.due);
        if lateness > self.config.max_tardiness {
            self.tardy.fetch_add(1, AtomicOrdering::Relaxed);
            warn!(
                target: "stasis::timer",
                timer = %self.name,
                task = %entry.task.name,
                lateness_ms = lateness.as_millis() as u64,
                "Task fired later than the tardiness budget"
            );
        }

        // catch_unwind keeps a panicking task from killing the dispatcher
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut action = entry.task.action.lock();
            (&mut **action)()
        }));
        if let Err(payload) = result {
            error!(
                target: "stasis::timer",
                timer = %self.name,
                task = %entry.task.name,
                "Timer task panicked: {}",
                panic_message(payload.as_ref())
            );
        }

        entry.task.record_fired();
        self.fired.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Next occurrence of a task that just fired, if any
    fn next_occurrence(&self, entry: ScheduledEntry) -> Option<ScheduledEntry> {
        let (due, wall_due) = match entry.task.recurrence {
            Recurrence::Once => {
                entry.task.mark_finished();
                return None;
            }
            Recurrence::FixedDelay(period) => (self.clock.monotonic().checked_add(period)?, None),
            Recurrence::FixedRate(period) => {
                let period = duration_to_nanos(period)?;
                let coalesce = self.config.missed_firings == MissedFiringPolicy::Coalesce;
                match entry.wall_due {
                    Some(wall_due) => {
                        let now_wall = self.clock.wall_clock();
                        let next = self.advance(
                            &entry,
                            wall_due.as_nanos(),
                            period,
                            now_wall.as_nanos(),
                            coalesce,
                        )?;
                        let next_wall = WallTime::from_nanos(next);
                        (
                            due_for_wall(next_wall, self.clock.monotonic(), now_wall),
                            Some(next_wall),
                        )
                    }
                    None => {
                        let now = self.clock.monotonic();
                        let next = self.advance(
                            &entry,
                            entry.due.as_nanos(),
                            period,
                            now.as_nanos(),
                            coalesce,
                        )?;
                        (MonotonicTime::from_nanos(next), None)
                    }
                }
            }
        };

        Some(ScheduledEntry {
            due,
            wall_due,
            sequence: self.sequence.fetch_add(1, AtomicOrdering::Relaxed),
            task: entry.task,
        })
    }

    /// `previous + period`, skipped forward past `now` when coalescing
    fn advance(
        &self,
        entry: &ScheduledEntry,
        previous: i64,
        period: i64,
        now: i64,
        coalesce: bool,
    ) -> Option<i64> {
        let next = previous.checked_add(period);
        let next = match next {
            Some(next) if coalesce && next <= now => {
                let missed = now.checked_sub(previous)? / period;
                debug!(
                    target: "stasis::timer",
                    timer = %self.name,
                    task = %entry.task.name,
                    missed,
                    "Coalesced missed periods"
                );
                previous.checked_add(missed.checked_add(1)?.checked_mul(period)?)
            }
            other => other,
        };
        if next.is_none() {
            warn!(
                target: "stasis::timer",
                timer = %self.name,
                task = %entry.task.name,
                "Periodic task runs past the end of the clock; dropping it"
            );
        }
        next
    }
}

fn dispatcher_loop(inner: &TimerInner) {
    let mut state = inner.state.lock();
    loop {
        if state.shutdown {
            state.parked = false;
            inner.parked_cond.notify_all();
            debug!(target: "stasis::timer", timer = %inner.name, "Dispatcher exiting");
            return;
        }

        if state.paused {
            // Lock is held across the check and the wait, so quiesce cannot
            // miss this notification.
            if !state.parked {
                state.parked = true;
                inner.parked_cond.notify_all();
            }
            inner.work_ready.wait(&mut state);
            continue;
        }

        let head = state
            .queue
            .peek()
            .map(|top| (top.due, top.task.is_cancelled()));
        let (due, cancelled) = match head {
            Some(head) => head,
            None => {
                inner.work_ready.wait(&mut state);
                continue;
            }
        };
        if cancelled {
            state.queue.pop();
            continue;
        }

        let now = inner.clock.monotonic();
        if due > now {
            inner
                .work_ready
                .wait_for(&mut state, due.saturating_duration_since(now));
            continue;
        }

        let Some(mut entry) = state.queue.pop() else {
            continue;
        };

        // Absolute deadlines are authoritative on the wall clock
        if let Some(wall_due) = entry.wall_due {
            let now_wall = inner.clock.wall_clock();
            if wall_due > now_wall {
                entry.due = due_for_wall(wall_due, now, now_wall);
                state.queue.push(entry);
                continue;
            }
        }

        MutexGuard::unlocked(&mut state, || inner.fire(&entry, now));

        if state.shutdown || entry.task.is_cancelled() {
            if entry.task.recurrence == Recurrence::Once {
                entry.task.mark_finished();
            }
            continue;
        }
        if let Some(next) = inner.next_occurrence(entry) {
            state.queue.push(next);
        }
    }
}

/// Monotonic estimate of when the wall clock reaches `instant`
fn due_for_wall(instant: WallTime, now: MonotonicTime, now_wall: WallTime) -> MonotonicTime {
    match instant.nanos_since(now_wall) {
        Some(remaining) => now.saturating_add(nanos_to_duration(remaining)),
        None if instant > now_wall => MonotonicTime::MAX,
        None => now,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("(non-string panic)")
}
