//! Task specifications and handles

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stasis_core::{StasisError, StasisResult, WallTime};

/// When a task first comes due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Relative to the moment of scheduling, measured on the virtual monotonic clock
    After(Duration),
    /// An absolute wall-clock instant
    At(WallTime),
}

/// How a task repeats after its first firing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Recurrence {
    /// Fire once
    #[default]
    Once,
    /// Next firing is `period` after the previous one finished
    FixedDelay(Duration),
    /// Next firing is `period` after the previous one was due
    FixedRate(Duration),
}

impl Recurrence {
    fn period(&self) -> Option<Duration> {
        match self {
            Recurrence::Once => None,
            Recurrence::FixedDelay(p) | Recurrence::FixedRate(p) => Some(*p),
        }
    }
}

/// Description of a task to schedule
///
/// ```
/// use std::time::Duration;
/// use stasis_timer::{Recurrence, TaskSpec};
///
/// let spec = TaskSpec::after(Duration::from_secs(1))
///     .every(Recurrence::FixedRate(Duration::from_millis(500)))
///     .named("heartbeat");
/// assert_eq!(spec.name(), "heartbeat");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    name: String,
    deadline: Deadline,
    recurrence: Recurrence,
}

impl TaskSpec {
    /// Fire `delay` after scheduling
    pub fn after(delay: Duration) -> Self {
        Self {
            name: "task".to_string(),
            deadline: Deadline::After(delay),
            recurrence: Recurrence::Once,
        }
    }

    /// Fire when the wall clock reaches `instant`
    pub fn at(instant: WallTime) -> Self {
        Self {
            name: "task".to_string(),
            deadline: Deadline::At(instant),
            recurrence: Recurrence::Once,
        }
    }

    /// Repeat after the first firing
    pub fn every(mut self, recurrence: Recurrence) -> Self {
        self.recurrence = recurrence;
        self
    }

    /// Name used in log lines
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Task name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// First deadline
    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Repetition rule
    pub fn recurrence(&self) -> Recurrence {
        self.recurrence
    }

    pub(crate) fn validate(&self) -> StasisResult<()> {
        if let Some(period) = self.recurrence.period() {
            if period.is_zero() {
                return Err(StasisError::InvalidTask(format!(
                    "task '{}' has a zero repeat period",
                    self.name
                )));
            }
            if stasis_core::duration_to_nanos(period).is_none() {
                return Err(StasisError::InvalidTask(format!(
                    "task '{}' repeat period {:?} is out of range",
                    self.name, period
                )));
            }
        }
        Ok(())
    }
}

pub(crate) type TaskAction = Box<dyn FnMut() + Send>;

/// State shared between the dispatcher and every handle to one task
pub(crate) struct TaskShared {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) recurrence: Recurrence,
    pub(crate) action: Mutex<TaskAction>,
    cancelled: AtomicBool,
    /// Set once a one-shot task has fired
    finished: AtomicBool,
    fire_count: AtomicU64,
    /// Timer-wide cancellation counter
    cancel_counter: Arc<AtomicU64>,
}

impl TaskShared {
    pub(crate) fn new(
        id: u64,
        spec: &TaskSpec,
        action: TaskAction,
        cancel_counter: Arc<AtomicU64>,
    ) -> Self {
        Self {
            id,
            name: spec.name.clone(),
            recurrence: spec.recurrence,
            action: Mutex::new(action),
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            fire_count: AtomicU64::new(0),
            cancel_counter,
        }
    }

    /// Mark cancelled; true if this call prevented at least one firing
    pub(crate) fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        if self.finished.load(Ordering::Acquire) {
            return false;
        }
        self.cancel_counter.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn record_fired(&self) {
        self.fire_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

/// Handle to a scheduled task
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
}

impl TaskHandle {
    pub(crate) fn new(shared: Arc<TaskShared>) -> Self {
        Self { shared }
    }

    /// Cancel the task
    ///
    /// Returns true if this prevented at least one future firing. A firing
    /// already in progress runs to completion.
    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }

    /// Whether the task was cancelled, directly or by cancelling its timer
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Number of completed firings (panicking firings included)
    pub fn fire_count(&self) -> u64 {
        self.shared.fire_count.load(Ordering::Relaxed)
    }

    /// Task name
    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("cancelled", &self.is_cancelled())
            .field("fire_count", &self.fire_count())
            .finish()
    }
}
