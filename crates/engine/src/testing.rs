//! Simulated freeze mechanisms for tests
//!
//! [`SimulatedFreeze`] stands in for the external snapshot tool. It either
//! sleeps through a real gap (the process keeps its host clocks), drives a
//! [`ManualClockSource`] through a restore, or fails on demand.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use stasis_clock::testing::ManualClockSource;

use crate::freeze::{FreezeError, FreezeMechanism, ResumeSignal};

enum Mode {
    /// Block the calling thread for a real gap
    Sleep(Duration),
    /// Advance a manual clock; `new_host_monotonic` restarts the raw clock
    Manual {
        clock: Arc<ManualClockSource>,
        gap: Duration,
        new_host_monotonic: Option<i64>,
    },
    /// Every call fails
    Fail(String),
}

/// Freeze mechanism for tests
pub struct SimulatedFreeze {
    mode: Mutex<Mode>,
    /// One-shot failure injected ahead of the configured mode
    fail_next: Mutex<Option<String>>,
    freezes: AtomicU64,
    last_image: Mutex<Option<PathBuf>>,
}

impl SimulatedFreeze {
    fn with_mode(mode: Mode) -> Self {
        Self {
            mode: Mutex::new(mode),
            fail_next: Mutex::new(None),
            freezes: AtomicU64::new(0),
            last_image: Mutex::new(None),
        }
    }

    /// Sleep for `gap` of real time, like a same-host restore
    pub fn sleeping(gap: Duration) -> Self {
        Self::with_mode(Mode::Sleep(gap))
    }

    /// Move `clock` through a frozen `gap` without sleeping
    ///
    /// Both raw clocks advance by the gap, like a same-host restore.
    pub fn manual(clock: Arc<ManualClockSource>, gap: Duration) -> Self {
        Self::with_mode(Mode::Manual {
            clock,
            gap,
            new_host_monotonic: None,
        })
    }

    /// Restore on another host: the raw monotonic clock restarts at `raw`
    pub fn on_new_host(self, raw: i64) -> Self {
        {
            let mut mode = self.mode.lock();
            if let Mode::Manual {
                new_host_monotonic, ..
            } = &mut *mode
            {
                *new_host_monotonic = Some(raw);
            }
        }
        self
    }

    /// Fail every call with `reason`
    pub fn failing(reason: impl Into<String>) -> Self {
        Self::with_mode(Mode::Fail(reason.into()))
    }

    /// Fail only the next call
    pub fn fail_next(&self, reason: impl Into<String>) {
        *self.fail_next.lock() = Some(reason.into());
    }

    /// Change the gap used by subsequent freezes
    pub fn set_gap(&self, new_gap: Duration) {
        match &mut *self.mode.lock() {
            Mode::Sleep(gap) => *gap = new_gap,
            Mode::Manual { gap, .. } => *gap = new_gap,
            Mode::Fail(_) => {}
        }
    }

    /// Number of successful freezes
    pub fn freeze_count(&self) -> u64 {
        self.freezes.load(Ordering::SeqCst)
    }

    /// Image directory passed to the most recent successful freeze
    pub fn last_image(&self) -> Option<PathBuf> {
        self.last_image.lock().clone()
    }
}

impl FreezeMechanism for SimulatedFreeze {
    fn name(&self) -> &str {
        "simulated"
    }

    fn suspend_and_snapshot(&self, image_dir: &Path) -> Result<ResumeSignal, FreezeError> {
        if let Some(reason) = self.fail_next.lock().take() {
            return Err(FreezeError::Failed(reason));
        }

        match &*self.mode.lock() {
            Mode::Sleep(gap) => std::thread::sleep(*gap),
            Mode::Manual {
                clock,
                gap,
                new_host_monotonic,
            } => match new_host_monotonic {
                Some(raw) => clock.simulate_restore(*gap, *raw),
                None => clock.advance(*gap),
            },
            Mode::Fail(reason) => return Err(FreezeError::Failed(reason.clone())),
        }

        self.freezes.fetch_add(1, Ordering::SeqCst);
        *self.last_image.lock() = Some(image_dir.to_path_buf());
        debug!(
            target: "stasis::checkpoint",
            image = %image_dir.display(),
            "Simulated freeze resumed"
        );
        Ok(ResumeSignal)
    }
}
