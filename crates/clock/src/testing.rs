//! Deterministic clock source for tests
//!
//! [`ManualClockSource`] only moves when told to, which lets tests reproduce
//! what a real restore looks like from inside the process: the wall clock
//! jumps forward by the freeze gap while the raw monotonic clock restarts from
//! whatever the new host reports.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use stasis_core::{duration_to_nanos, WallTime};

use crate::source::ClockSource;

/// Clock source driven entirely by the test
#[derive(Debug)]
pub struct ManualClockSource {
    monotonic: AtomicI64,
    wall: AtomicI64,
}

impl ManualClockSource {
    /// Create with the given raw monotonic reading and wall clock
    pub fn new(raw_monotonic: i64, wall: WallTime) -> Self {
        Self {
            monotonic: AtomicI64::new(raw_monotonic),
            wall: AtomicI64::new(wall.as_nanos()),
        }
    }

    /// Advance both clocks by the same amount (normal execution)
    pub fn advance(&self, by: Duration) {
        let nanos = duration_to_nanos(by).unwrap_or(i64::MAX);
        self.monotonic.fetch_add(nanos, Ordering::SeqCst);
        self.wall.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Advance only the wall clock (the process is frozen)
    pub fn advance_wall(&self, by: Duration) {
        let nanos = duration_to_nanos(by).unwrap_or(i64::MAX);
        self.wall.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Set the wall clock (operator adjustment, NTP step)
    pub fn set_wall(&self, wall: WallTime) {
        self.wall.store(wall.as_nanos(), Ordering::SeqCst);
    }

    /// Set the raw monotonic reading
    pub fn set_raw_monotonic(&self, nanos: i64) {
        self.monotonic.store(nanos, Ordering::SeqCst);
    }

    /// Emulate a restore on another host after `gap` of real time
    ///
    /// The wall clock advances by `gap`; the raw monotonic clock restarts at
    /// `new_host_monotonic`.
    pub fn simulate_restore(&self, gap: Duration, new_host_monotonic: i64) {
        self.advance_wall(gap);
        self.set_raw_monotonic(new_host_monotonic);
    }
}

impl ClockSource for ManualClockSource {
    fn raw_monotonic(&self) -> i64 {
        self.monotonic.load(Ordering::SeqCst)
    }

    fn raw_wall_clock(&self) -> WallTime {
        WallTime::from_nanos(self.wall.load(Ordering::SeqCst))
    }
}
