//! Clock behaviour across full checkpoint cycles

use crate::common::*;
use stasis::{ClockSource, FreezeError, MonotonicTime, ResumeSignal, TimeSource};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn monotonic_time_advances_by_the_freeze_gap() {
    let (orchestrator, _clock, _freeze) = manual_orchestrator(Duration::from_secs(2));
    let clock = orchestrator.clock();

    let before = clock.read_monotonic();
    orchestrator.checkpoint(image_dir().path()).unwrap();
    let after = clock.read_monotonic();

    assert!(after.saturating_duration_since(before) >= Duration::from_secs(2));
}

#[test]
fn monotonic_time_survives_restore_on_another_host() {
    let clock_source = manual_clock();
    let freeze =
        SimulatedFreeze::manual(clock_source.clone(), Duration::from_secs(3)).on_new_host(42);
    let orchestrator = orchestrator_on(clock_source, Arc::new(freeze));

    let before = orchestrator.clock().read_monotonic();
    let outcome = orchestrator.checkpoint(image_dir().path()).unwrap();
    let after = orchestrator.clock().read_monotonic();

    assert!(after >= before);
    assert_eq!(
        after,
        outcome
            .epoch
            .virtual_monotonic
            .checked_add(Duration::from_secs(3))
            .unwrap()
    );
}

#[test]
fn monotonic_reads_never_decrease_across_cycles() {
    let (orchestrator, _freeze) = sleeping_orchestrator(Duration::from_millis(20));
    let clock = orchestrator.clock();
    let dir = image_dir();

    let mut last = MonotonicTime::ZERO;
    for _ in 0..5 {
        let now = clock.read_monotonic();
        assert!(now >= last);
        last = now;
        orchestrator.checkpoint(dir.path()).unwrap();
    }
    assert!(clock.read_monotonic() >= last);
    assert_eq!(clock.restore_count(), 5);
}

#[test]
fn last_restore_instant_is_bounded_by_request_and_resume() {
    let (orchestrator, _freeze) = sleeping_orchestrator(Duration::from_millis(200));
    assert_eq!(orchestrator.last_restore_instant(), None);
    assert!(!orchestrator.has_restored());

    let before_checkpoint = orchestrator.clock().wall_clock();
    orchestrator.checkpoint(image_dir().path()).unwrap();
    let after_restore = orchestrator.clock().wall_clock();

    let restored_at = orchestrator.last_restore_instant().unwrap();
    assert!(restored_at > before_checkpoint);
    assert!(restored_at <= after_restore);
    assert!(orchestrator.has_restored());
}

#[test]
fn last_restore_instant_tracks_the_latest_cycle() {
    let (orchestrator, _clock, freeze) = manual_orchestrator(Duration::from_secs(1));
    let dir = image_dir();

    let first = orchestrator.checkpoint(dir.path()).unwrap();
    freeze.set_gap(Duration::from_secs(10));
    let second = orchestrator.checkpoint(dir.path()).unwrap();

    assert!(second.restore.wall_clock_at_restore > first.restore.wall_clock_at_restore);
    assert_eq!(
        orchestrator.last_restore_instant(),
        Some(second.restore.wall_clock_at_restore)
    );
    assert_eq!(second.restore.generation, 2);
}

/// Operator rewinds the wall clock while the image sits on disk
struct RewindFreeze {
    clock: Arc<ManualClockSource>,
    by: Duration,
}

impl FreezeMechanism for RewindFreeze {
    fn name(&self) -> &str {
        "rewind"
    }

    fn suspend_and_snapshot(&self, _image_dir: &Path) -> Result<ResumeSignal, FreezeError> {
        let wall = self.clock.raw_wall_clock();
        self.clock
            .set_wall(WallTime::from_nanos(wall.as_nanos() - self.by.as_nanos() as i64));
        Ok(ResumeSignal)
    }
}

#[test]
fn wall_clock_rewind_is_clamped() {
    let clock_source = manual_clock();
    let orchestrator = orchestrator_on(
        clock_source.clone(),
        Arc::new(RewindFreeze {
            clock: clock_source,
            by: Duration::from_secs(60),
        }),
    );

    let before = orchestrator.clock().read_monotonic();
    let outcome = orchestrator.checkpoint(image_dir().path()).unwrap();

    assert!(outcome.restore.clock_regressed);
    assert_eq!(outcome.restore.real_elapsed_since_checkpoint, Duration::ZERO);
    assert!(outcome.restore.wall_clock_at_restore > outcome.epoch.wall_clock);
    assert!(orchestrator.clock().read_monotonic() >= before);
}

#[test]
fn uptime_excludes_time_spent_frozen() {
    let (orchestrator, _freeze) = sleeping_orchestrator(Duration::from_millis(800));

    let before = orchestrator.uptime();
    orchestrator.checkpoint(image_dir().path()).unwrap();
    let after = orchestrator.uptime();

    let growth = after.saturating_sub(before);
    assert!(
        growth < Duration::from_millis(800),
        "uptime grew by {:?} across an 800ms freeze",
        growth
    );
}

#[test]
fn hot_reader_never_ahead_of_fresh_read() {
    let clock_source = manual_clock();
    let freeze =
        SimulatedFreeze::manual(clock_source.clone(), Duration::from_secs(2)).on_new_host(1);
    let orchestrator = orchestrator_on(clock_source.clone(), Arc::new(freeze));

    // Warm the reader so its cached offset predates the restore
    let mut hot = orchestrator.clock().reader();
    let before = hot.read();
    clock_source.advance(Duration::from_millis(5));
    assert!(hot.read() > before);

    orchestrator.checkpoint(image_dir().path()).unwrap();

    let hot_after = hot.read();
    let fresh_after = orchestrator.clock().read_monotonic();
    assert!(hot_after >= before);
    assert!(hot_after <= fresh_after);
    assert_eq!(hot.generation(), 1);
}

#[test]
fn compensated_clock_usable_as_time_source() {
    let (orchestrator, _clock, _freeze) = manual_orchestrator(Duration::from_secs(1));
    let source: Arc<dyn TimeSource> = orchestrator.clock().clone();

    let before = source.monotonic();
    orchestrator.checkpoint(image_dir().path()).unwrap();
    assert!(source.monotonic() >= before);
    assert_eq!(source.wall_clock(), orchestrator.clock().read_wall_clock());
}
