//! Clock compensation across a freeze/resume cycle
//!
//! The compensator owns the offset between the raw monotonic clock and the
//! process's virtual monotonic timeline, and answers "what is now" for every
//! consumer in the process.
//!
//! ## Restore sequence
//!
//! ```text
//! 1. snapshot_epoch()  - record {virtual monotonic, wall clock} before the freeze
//! 2. ... frozen; raw monotonic may stand still or restart on another host ...
//! 3. record_restore()  - gap = wall_now - wall_at_checkpoint (clamped >= 0)
//!                        advance = max(gap, min_restore_advance)
//!                        offset = (virtual_at_checkpoint + advance) - raw_now
//! 4. publish offset, then bump the restore generation
//! ```
//!
//! ## Memory Ordering
//!
//! The offset is stored before the generation counter is incremented, both
//! SeqCst. A reader that observes the new generation therefore observes the new
//! offset; [`MonotonicReader`] relies on this to revalidate its cached offset.
//!
//! A high-water mark (`fetch_max`) backs up the offset arithmetic so that no
//! two reads, on any threads, ever observe the virtual clock going backwards.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use stasis_core::{
    duration_to_nanos, nanos_to_duration, EpochPair, MonotonicTime, RestoreRecord, StasisError,
    StasisResult, WallTime,
};

use crate::source::{ClockSource, SystemClockSource};

/// Consumer-side view of process time
///
/// Every monotonic or wall-clock call site in a checkpointable process reads
/// through this trait instead of a raw OS clock.
pub trait TimeSource: Send + Sync {
    /// Compensated monotonic time
    fn monotonic(&self) -> MonotonicTime;

    /// Wall-clock time
    fn wall_clock(&self) -> WallTime;
}

/// Owner of the compensation offset
///
/// Single writer (the checkpoint-driving thread), many readers.
pub struct ClockCompensator {
    source: Arc<dyn ClockSource>,
    /// Minimum monotonic advance applied across a restore
    min_restore_advance: Duration,
    /// Added to raw monotonic reads
    offset: AtomicI64,
    /// Number of completed restores; bumped after the offset is published
    generation: AtomicU64,
    /// Largest virtual monotonic value handed out so far
    high_water: AtomicI64,
    /// Virtual monotonic time at construction (uptime origin)
    created_at: MonotonicTime,
    /// Total advance applied across all restores, excluded from uptime
    frozen_total: AtomicI64,
    pending_epoch: Mutex<Option<EpochPair>>,
    last_restore: RwLock<Option<RestoreRecord>>,
}

impl ClockCompensator {
    /// Create a compensator over the operating system clocks
    pub fn system(min_restore_advance: Duration) -> Self {
        Self::new(Arc::new(SystemClockSource::new()), min_restore_advance)
    }

    /// Create a compensator over the given raw source
    ///
    /// Until the first restore the offset is zero and the virtual timeline
    /// equals the raw one.
    pub fn new(source: Arc<dyn ClockSource>, min_restore_advance: Duration) -> Self {
        let start = source.raw_monotonic();
        Self {
            source,
            min_restore_advance,
            offset: AtomicI64::new(0),
            generation: AtomicU64::new(0),
            high_water: AtomicI64::new(start),
            created_at: MonotonicTime::from_nanos(start),
            frozen_total: AtomicI64::new(0),
            pending_epoch: Mutex::new(None),
            last_restore: RwLock::new(None),
        }
    }

    // =========================================================================
    // Clock reads
    // =========================================================================

    /// Compensated monotonic time
    ///
    /// Non-decreasing across the whole process lifetime, including restores.
    pub fn read_monotonic(&self) -> MonotonicTime {
        let offset = self.offset.load(Ordering::SeqCst);
        let candidate = compensate(self.source.raw_monotonic(), offset);
        let previous = self.high_water.fetch_max(candidate, Ordering::SeqCst);
        MonotonicTime::from_nanos(candidate.max(previous))
    }

    /// Wall-clock time
    ///
    /// Reflects real elapsed time after a restore.
    pub fn read_wall_clock(&self) -> WallTime {
        self.source.raw_wall_clock()
    }

    /// Virtual time since construction, excluding every frozen interval
    pub fn uptime(&self) -> Duration {
        let now = self.read_monotonic();
        let frozen = self.frozen_total.load(Ordering::SeqCst);
        let elapsed = now.nanos_since(self.created_at).unwrap_or(i64::MAX);
        nanos_to_duration(elapsed.saturating_sub(frozen))
    }

    /// Create a hot-path reader that caches the offset
    pub fn reader(self: &Arc<Self>) -> MonotonicReader {
        MonotonicReader {
            compensator: Arc::clone(self),
            cached_generation: self.generation.load(Ordering::SeqCst),
            cached_offset: self.offset.load(Ordering::SeqCst),
        }
    }

    // =========================================================================
    // Checkpoint / restore
    // =========================================================================

    /// Record the epoch pair for a checkpoint attempt
    ///
    /// Called exactly once per attempt, immediately before the freeze. A second
    /// call before `record_restore` overwrites the pending epoch (retry).
    pub fn snapshot_epoch(&self) -> EpochPair {
        let epoch = EpochPair {
            virtual_monotonic: self.read_monotonic(),
            wall_clock: self.read_wall_clock(),
        };

        let replaced = self.pending_epoch.lock().replace(epoch);
        if replaced.is_some() {
            debug!(target: "stasis::clock", "Pending epoch overwritten by retry");
        }
        debug!(
            target: "stasis::clock",
            virtual_monotonic = epoch.virtual_monotonic.as_nanos(),
            wall_clock = %epoch.wall_clock,
            "Checkpoint epoch recorded"
        );
        epoch
    }

    /// Drop the pending epoch of an aborted attempt
    ///
    /// Leaves no partial compensation state behind.
    pub fn discard_epoch(&self) -> Option<EpochPair> {
        self.pending_epoch.lock().take()
    }

    /// The epoch of the attempt in flight, if any
    pub fn pending_epoch(&self) -> Option<EpochPair> {
        *self.pending_epoch.lock()
    }

    /// Install the compensation offset for a completed restore
    ///
    /// Must be the first thing the checkpoint-driving thread does once control
    /// returns from the freeze mechanism.
    ///
    /// # Errors
    ///
    /// - `NoPendingEpoch` if no epoch was recorded
    /// - `OffsetOverflow` (fatal) if the compensation cannot be represented
    pub fn record_restore(&self) -> StasisResult<RestoreRecord> {
        let epoch = self
            .pending_epoch
            .lock()
            .take()
            .ok_or(StasisError::NoPendingEpoch)?;

        let wall_now = self.source.raw_wall_clock();
        let raw_now = self.source.raw_monotonic();

        let gap = wall_now
            .nanos_since(epoch.wall_clock)
            .ok_or(StasisError::OffsetOverflow {
                context: "wall-clock gap",
            })?;
        let clock_regressed = gap < 0;
        if clock_regressed {
            let regression = StasisError::ClockRegressionDetected {
                checkpoint_wall: epoch.wall_clock,
                restore_wall: wall_now,
            };
            warn!(target: "stasis::clock", error = %regression, "Clamping restore gap to zero");
        }

        let real_elapsed = nanos_to_duration(gap);
        let applied_advance = real_elapsed.max(self.min_restore_advance);
        let advance_nanos = duration_to_nanos(applied_advance).ok_or(StasisError::OffsetOverflow {
            context: "restore advance",
        })?;

        let target = epoch
            .virtual_monotonic
            .as_nanos()
            .checked_add(advance_nanos)
            .ok_or(StasisError::OffsetOverflow {
                context: "monotonic target",
            })?;
        let offset = target
            .checked_sub(raw_now)
            .ok_or(StasisError::OffsetOverflow {
                context: "compensation offset",
            })?;
        let frozen_total = self
            .frozen_total
            .load(Ordering::SeqCst)
            .checked_add(advance_nanos)
            .ok_or(StasisError::OffsetOverflow {
                context: "frozen total",
            })?;

        let wall_clock_at_restore = if wall_now > epoch.wall_clock {
            wall_now
        } else {
            WallTime::from_nanos(epoch.wall_clock.as_nanos().saturating_add(1))
        };

        let record = RestoreRecord {
            wall_clock_at_restore,
            real_elapsed_since_checkpoint: real_elapsed,
            applied_advance,
            offset_nanos: offset,
            clock_regressed,
            generation: self.generation.load(Ordering::SeqCst) + 1,
        };

        // Publish: offset first, generation last
        self.offset.store(offset, Ordering::SeqCst);
        self.frozen_total.store(frozen_total, Ordering::SeqCst);
        *self.last_restore.write() = Some(record);
        self.generation.store(record.generation, Ordering::SeqCst);

        info!(
            target: "stasis::clock",
            generation = record.generation,
            real_elapsed_ms = real_elapsed.as_millis() as u64,
            applied_advance_ms = applied_advance.as_millis() as u64,
            offset = offset,
            restore_wall = %wall_clock_at_restore,
            "Clock compensation installed"
        );
        Ok(record)
    }

    // =========================================================================
    // Status queries
    // =========================================================================

    /// Wall-clock instant of the most recent restore, `None` before the first
    pub fn last_restore_instant(&self) -> Option<WallTime> {
        self.last_restore
            .read()
            .as_ref()
            .map(|r| r.wall_clock_at_restore)
    }

    /// The most recent restore record
    pub fn last_restore(&self) -> Option<RestoreRecord> {
        *self.last_restore.read()
    }

    /// Whether at least one restore has occurred
    pub fn has_restored(&self) -> bool {
        self.restore_count() > 0
    }

    /// Number of completed restores
    pub fn restore_count(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Current compensation offset in nanoseconds
    pub fn offset_nanos(&self) -> i64 {
        self.offset.load(Ordering::SeqCst)
    }

    /// Configured minimum restore advance
    pub fn min_restore_advance(&self) -> Duration {
        self.min_restore_advance
    }
}

impl TimeSource for ClockCompensator {
    fn monotonic(&self) -> MonotonicTime {
        self.read_monotonic()
    }

    fn wall_clock(&self) -> WallTime {
        self.read_wall_clock()
    }
}

impl std::fmt::Debug for ClockCompensator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockCompensator")
            .field("offset", &self.offset_nanos())
            .field("generation", &self.restore_count())
            .field("min_restore_advance", &self.min_restore_advance)
            .finish()
    }
}

#[inline]
fn compensate(raw: i64, offset: i64) -> i64 {
    match raw.checked_add(offset) {
        Some(value) => value,
        None => offset_overflow(raw, offset),
    }
}

#[cold]
fn offset_overflow(raw: i64, offset: i64) -> ! {
    error!(target: "stasis::clock", raw, offset, "Compensated monotonic read overflowed");
    panic!("compensated monotonic read overflowed: raw={raw} offset={offset}");
}

// ============================================================================
// MonotonicReader
// ============================================================================

/// Hot-path monotonic reader
///
/// Caches the compensation offset and revalidates it against the restore
/// generation on every read, so a reader created before a checkpoint agrees
/// with fresh reads after the restore. A value returned here is never greater
/// than a fresh [`ClockCompensator::read_monotonic`] taken after it.
pub struct MonotonicReader {
    compensator: Arc<ClockCompensator>,
    cached_generation: u64,
    cached_offset: i64,
}

impl MonotonicReader {
    /// Compensated monotonic time
    #[inline]
    pub fn read(&mut self) -> MonotonicTime {
        let generation = self.compensator.generation.load(Ordering::SeqCst);
        if generation != self.cached_generation {
            self.cached_offset = self.compensator.offset.load(Ordering::SeqCst);
            self.cached_generation = generation;
        }
        let candidate = compensate(self.compensator.source.raw_monotonic(), self.cached_offset);
        // Read-only: any value above the floor came from a raw source that
        // never goes backwards, so the next fresh read will publish past it
        let floor = self.compensator.high_water.load(Ordering::SeqCst);
        MonotonicTime::from_nanos(candidate.max(floor))
    }

    /// Restore generation the cached offset belongs to
    pub fn generation(&self) -> u64 {
        self.cached_generation
    }
}
