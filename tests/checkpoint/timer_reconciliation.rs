//! Timer deadlines across real (sleeping) freezes

use crate::common::*;
use parking_lot::Mutex;
use stasis::{Recurrence, TaskSpec, TimeSource};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Records the real instant and wall time of every firing
#[derive(Clone, Default)]
struct Firings {
    at: Arc<Mutex<Vec<(Instant, WallTime)>>>,
}

impl Firings {
    fn recorder(&self) -> impl FnMut() + Send + 'static {
        let at = Arc::clone(&self.at);
        move || at.lock().push((Instant::now(), WallTime::now()))
    }

    fn count(&self) -> usize {
        self.at.lock().len()
    }

    fn first(&self) -> Option<(Instant, WallTime)> {
        self.at.lock().first().copied()
    }

    fn since(&self, start: Instant) -> usize {
        self.at.lock().iter().filter(|(i, _)| *i >= start).count()
    }
}

#[test]
fn relative_task_keeps_its_remaining_delay() {
    let (orchestrator, _freeze) = sleeping_orchestrator(Duration::from_millis(1_000));
    let timer = orchestrator.new_timer("relative").unwrap();
    let firings = Firings::default();

    let scheduled_at = Instant::now();
    let task = timer
        .schedule_after(Duration::from_millis(800), firings.recorder())
        .unwrap();
    orchestrator.checkpoint(image_dir().path()).unwrap();

    assert_eq!(task.fire_count(), 0, "fired early after restore");
    assert!(wait_until(Duration::from_millis(800) + MAX_TARDINESS, || {
        firings.count() == 1
    }));

    let (fired_at, _) = firings.first().unwrap();
    let waited = fired_at.duration_since(scheduled_at);
    assert!(
        waited >= Duration::from_millis(1_790),
        "fired {:?} after scheduling; freeze time must not count against the delay",
        waited
    );
    assert!(waited <= Duration::from_millis(1_800) + MAX_TARDINESS);
    assert_eq!(timer.stats().rebased, 1);
    assert_eq!(timer.stats().tardy, 0);
}

#[test]
fn absolute_deadline_passed_during_freeze_fires_promptly() {
    let (orchestrator, _freeze) = sleeping_orchestrator(Duration::from_millis(1_000));
    let timer = orchestrator.new_timer("absolute").unwrap();
    let firings = Firings::default();

    let target = orchestrator
        .clock()
        .wall_clock()
        .checked_add(Duration::from_millis(300))
        .unwrap();
    timer.schedule_at(target, firings.recorder()).unwrap();

    orchestrator.checkpoint(image_dir().path()).unwrap();
    let restored = Instant::now();

    assert!(wait_until(MAX_TARDINESS, || firings.count() == 1));
    let (fired_at, fired_wall) = firings.first().unwrap();
    assert!(fired_wall >= target);
    assert!(fired_at.saturating_duration_since(restored) < MAX_TARDINESS);
}

#[test]
fn absolute_deadline_after_restore_waits_for_the_wall_clock() {
    let (orchestrator, _freeze) = sleeping_orchestrator(Duration::from_millis(500));
    let timer = orchestrator.new_timer("absolute").unwrap();
    let firings = Firings::default();

    let target = orchestrator
        .clock()
        .wall_clock()
        .checked_add(Duration::from_millis(1_200))
        .unwrap();
    timer.schedule_at(target, firings.recorder()).unwrap();

    orchestrator.checkpoint(image_dir().path()).unwrap();
    assert_eq!(firings.count(), 0);

    assert!(wait_until(Duration::from_millis(1_200) + MAX_TARDINESS, || {
        firings.count() == 1
    }));
    let (_, fired_wall) = firings.first().unwrap();
    assert!(
        fired_wall >= target,
        "fired at {} before its deadline {}",
        fired_wall,
        target
    );
}

#[test]
fn fixed_rate_task_does_not_burst_after_restore() {
    let (orchestrator, _freeze) = sleeping_orchestrator(Duration::from_millis(1_000));
    let timer = orchestrator.new_timer("heartbeat").unwrap();
    let firings = Firings::default();

    let task = timer
        .schedule(
            TaskSpec::after(Duration::from_millis(100))
                .every(Recurrence::FixedRate(Duration::from_millis(100)))
                .named("heartbeat"),
            firings.recorder(),
        )
        .unwrap();
    assert!(wait_until(MAX_TARDINESS, || firings.count() >= 2));

    orchestrator.checkpoint(image_dir().path()).unwrap();
    let restored = Instant::now();
    thread::sleep(Duration::from_millis(250));

    // Ten periods passed while frozen; a burst would show them all here
    let after_restore = firings.since(restored);
    assert!(
        after_restore <= 4,
        "{} firings in the first 250ms after restore",
        after_restore
    );
    assert!(wait_until(MAX_TARDINESS, || firings.since(restored) >= 1));
    assert!(task.cancel());
    assert!(!task.cancel());
}

#[test]
fn task_scheduled_by_pre_checkpoint_hook_is_reconciled() {
    let (orchestrator, _freeze) = sleeping_orchestrator(Duration::from_millis(800));
    let timer = orchestrator.new_timer("late-scheduled").unwrap();
    let firings = Firings::default();
    let scheduled_at = Arc::new(Mutex::new(None));

    let t = Arc::clone(&timer);
    let f = firings.clone();
    let s = Arc::clone(&scheduled_at);
    orchestrator.register_pre_checkpoint(hook_fn("schedule-flush", move || {
        *s.lock() = Some(Instant::now());
        t.schedule_after(Duration::from_millis(500), f.recorder())?;
        Ok(())
    }));

    orchestrator.checkpoint(image_dir().path()).unwrap();
    assert!(wait_until(Duration::from_millis(500) + MAX_TARDINESS, || {
        firings.count() == 1
    }));

    let scheduled_at = scheduled_at.lock().unwrap();
    let (fired_at, _) = firings.first().unwrap();
    assert!(fired_at.duration_since(scheduled_at) >= Duration::from_millis(1_290));
}

#[test]
fn short_task_scheduled_by_pre_checkpoint_hook_waits_for_restore() {
    let (orchestrator, freeze) = sleeping_orchestrator(Duration::from_millis(500));
    let timer = orchestrator.new_timer("hook-scheduled").unwrap();
    let ran_before_freeze = Arc::new(Mutex::new(None));

    let t = Arc::clone(&timer);
    let fz = Arc::clone(&freeze);
    let r = Arc::clone(&ran_before_freeze);
    orchestrator.register_pre_checkpoint(hook_fn("schedule-soon", move || {
        let fz = Arc::clone(&fz);
        let r = Arc::clone(&r);
        t.schedule_after(Duration::from_millis(10), move || {
            *r.lock() = Some(fz.freeze_count() == 0);
        })?;
        Ok(())
    }));
    orchestrator.register_pre_checkpoint(hook_fn("slow-flush", || {
        thread::sleep(Duration::from_millis(50));
        Ok(())
    }));

    orchestrator.checkpoint(image_dir().path()).unwrap();
    assert!(wait_until(MAX_TARDINESS, || ran_before_freeze.lock().is_some()));
    assert_eq!(
        *ran_before_freeze.lock(),
        Some(false),
        "task scheduled by a hook ran before the freeze"
    );
}

#[test]
fn cancelled_task_stays_cancelled_across_restore() {
    let (orchestrator, _freeze) = sleeping_orchestrator(Duration::from_millis(100));
    let timer = orchestrator.new_timer("cancelled").unwrap();
    let fired = Arc::new(AtomicU64::new(0));

    let f = Arc::clone(&fired);
    let task = timer
        .schedule_after(Duration::from_millis(200), move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert!(task.cancel());

    orchestrator.checkpoint(image_dir().path()).unwrap();
    thread::sleep(Duration::from_millis(400));

    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(timer.stats().cancelled, 1);
    assert_eq!(timer.stats().rebased, 0);
}

#[test]
fn timers_keep_working_across_repeated_cycles() {
    let (orchestrator, _freeze) = sleeping_orchestrator(Duration::from_millis(50));
    let timer = orchestrator.new_timer("repeated").unwrap();
    let fired = Arc::new(AtomicU64::new(0));
    let dir = image_dir();

    let f = Arc::clone(&fired);
    timer
        .schedule(
            TaskSpec::after(Duration::from_millis(10))
                .every(Recurrence::FixedDelay(Duration::from_millis(10))),
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

    let mut last = 0;
    for _ in 0..3 {
        orchestrator.checkpoint(dir.path()).unwrap();
        assert!(wait_until(MAX_TARDINESS, || fired.load(Ordering::SeqCst) > last));
        last = fired.load(Ordering::SeqCst);
    }
    assert_eq!(orchestrator.clock().restore_count(), 3);

    timer.cancel();
    assert_eq!(timer.stats().fired, fired.load(Ordering::SeqCst));
}
