//! Orchestrator state machine, participants and configuration

use crate::common::*;
use parking_lot::Mutex;
use stasis::{
    install_process_orchestrator, process_orchestrator, CheckpointMetrics, CheckpointPhase,
    FreezeError, Recurrence, ResumeSignal, StasisError, TaskSpec, CONFIG_FILE_NAME,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

/// Runs `during` in place of a real suspend
struct CallbackFreeze<F>(F);

impl<F> FreezeMechanism for CallbackFreeze<F>
where
    F: Fn() + Send + Sync,
{
    fn name(&self) -> &str {
        "callback"
    }

    fn suspend_and_snapshot(&self, _image_dir: &Path) -> Result<ResumeSignal, FreezeError> {
        (self.0)();
        Ok(ResumeSignal)
    }
}

fn callback_orchestrator<F>(during: F) -> Arc<CheckpointOrchestrator>
where
    F: Fn() + Send + Sync + 'static,
{
    init_tracing();
    CheckpointOrchestrator::builder()
        .freeze_mechanism(Arc::new(CallbackFreeze(during)))
        .build()
        .expect("build orchestrator")
}

#[test]
fn concurrent_request_is_rejected_without_disturbing_the_first() {
    let (orchestrator, freeze) = sleeping_orchestrator(Duration::from_millis(300));
    let dir = image_dir();

    let first = {
        let orchestrator = Arc::clone(&orchestrator);
        let path = dir.path().to_path_buf();
        thread::spawn(move || orchestrator.checkpoint(path))
    };
    assert!(wait_until(Duration::from_secs(5), || {
        orchestrator.is_checkpoint_in_progress()
    }));

    let err = orchestrator.checkpoint(dir.path()).unwrap_err();
    assert!(matches!(err, StasisError::ConcurrentCheckpointRejected));

    first.join().unwrap().unwrap();
    assert_eq!(freeze.freeze_count(), 1);
    assert_eq!(orchestrator.phase(), CheckpointPhase::Idle);
    assert_eq!(
        orchestrator.metrics(),
        CheckpointMetrics {
            attempted: 1,
            completed: 1,
            failed: 0,
            rejected: 1,
        }
    );
}

#[test]
fn cancellation_during_pre_hooks_aborts_before_quiescence() {
    let (orchestrator, freeze) = sleeping_orchestrator(Duration::from_millis(10));
    let gate = orchestrator.new_safepoint_gate("workers");
    let worker = gate.register();

    let release = Arc::new(AtomicBool::new(false));
    let r = Arc::clone(&release);
    let handle = orchestrator.register_pre_checkpoint(hook_fn("slow-flush", move || {
        while !r.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }));

    let dir = image_dir();
    let attempt = {
        let orchestrator = Arc::clone(&orchestrator);
        let path = dir.path().to_path_buf();
        thread::spawn(move || orchestrator.checkpoint(path))
    };
    assert!(wait_until(Duration::from_secs(5), || {
        orchestrator.phase() == CheckpointPhase::PreHookRunning
    }));
    assert!(orchestrator.cancel_pending());
    release.store(true, Ordering::SeqCst);

    let err = attempt.join().unwrap().unwrap_err();
    assert!(matches!(err, StasisError::Cancelled));
    assert_eq!(freeze.freeze_count(), 0);
    assert!(!worker.stop_requested(), "workers were never asked to park");
    assert!(orchestrator.clock().pending_epoch().is_none());

    // The request does not linger into the next attempt
    orchestrator.unregister(handle);
    drop(worker);
    orchestrator.checkpoint(dir.path()).unwrap();
    assert_eq!(freeze.freeze_count(), 1);
}

#[test]
fn cancellation_is_refused_once_quiescence_began() {
    let slot: Arc<Mutex<Weak<CheckpointOrchestrator>>> = Arc::new(Mutex::new(Weak::new()));
    let refused = Arc::new(Mutex::new(None));

    let s = Arc::clone(&slot);
    let r = Arc::clone(&refused);
    let orchestrator = callback_orchestrator(move || {
        if let Some(o) = s.lock().upgrade() {
            *r.lock() = Some((o.phase(), o.cancel_pending()));
        }
    });
    *slot.lock() = Arc::downgrade(&orchestrator);

    assert!(!orchestrator.cancel_pending(), "nothing to cancel while idle");
    orchestrator.checkpoint(image_dir().path()).unwrap();
    assert_eq!(*refused.lock(), Some((CheckpointPhase::Frozen, false)));
}

#[test]
fn freeze_failure_resumes_participants_and_allows_retry() {
    let (orchestrator, _clock, freeze) = manual_orchestrator(Duration::from_secs(1));
    let timer = orchestrator.new_timer("jobs").unwrap();
    let task = timer
        .schedule_after(Duration::from_secs(3600), || {})
        .unwrap();

    freeze.fail_next("criu dump exited with 1");
    let before = orchestrator.clock().read_monotonic();
    let err = orchestrator.checkpoint(image_dir().path()).unwrap_err();

    assert!(matches!(err, StasisError::FreezeMechanismFailure { .. }));
    assert!(err.is_retryable());
    assert!(!timer.stats().parked);
    assert_eq!(timer.stats().pending, 1);
    assert!(orchestrator.clock().pending_epoch().is_none());
    assert!(!orchestrator.has_restored());
    assert_eq!(orchestrator.clock().offset_nanos(), 0);
    assert!(orchestrator.clock().read_monotonic() >= before);

    let outcome = orchestrator.checkpoint(image_dir().path()).unwrap();
    assert_eq!(outcome.restore.generation, 1);
    assert_eq!(timer.stats().rebased, 1);
    assert!(!task.is_cancelled());
    assert_eq!(
        orchestrator.metrics(),
        CheckpointMetrics {
            attempted: 2,
            completed: 1,
            failed: 1,
            rejected: 0,
        }
    );
}

#[test]
fn stuck_worker_fails_quiescence_and_reopens_earlier_participants() {
    let config = StasisConfig {
        quiesce_timeout_ms: 50,
        ..StasisConfig::default()
    };
    let freeze = Arc::new(SimulatedFreeze::sleeping(Duration::ZERO));
    let orchestrator = CheckpointOrchestrator::builder()
        .config(config)
        .freeze_mechanism(freeze.clone())
        .build()
        .unwrap();

    let timer = orchestrator.new_timer("first").unwrap();
    let gate = orchestrator.new_safepoint_gate("stuck");
    let token = gate.register();

    let err = orchestrator.checkpoint(image_dir().path()).unwrap_err();
    assert!(matches!(
        err,
        StasisError::QuiesceTimeout { ref participant, .. } if participant == "stuck"
    ));
    assert!(err.is_retryable());
    assert_eq!(freeze.freeze_count(), 0);
    assert!(!timer.stats().parked, "timer resumed after the failed attempt");
    assert!(!token.stop_requested());

    let fired = Arc::new(AtomicBool::new(false));
    let f = Arc::clone(&fired);
    timer
        .schedule_after(Duration::from_millis(5), move || f.store(true, Ordering::SeqCst))
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || fired.load(Ordering::SeqCst)));
}

#[test]
fn nothing_runs_while_frozen() {
    let worker_progress = Arc::new(AtomicU64::new(0));
    let ticks = Arc::new(AtomicU64::new(0));
    let stalled = Arc::new(AtomicBool::new(false));

    let w = Arc::clone(&worker_progress);
    let t = Arc::clone(&ticks);
    let s = Arc::clone(&stalled);
    let orchestrator = callback_orchestrator(move || {
        let (w0, t0) = (w.load(Ordering::SeqCst), t.load(Ordering::SeqCst));
        thread::sleep(Duration::from_millis(100));
        let still = w.load(Ordering::SeqCst) == w0 && t.load(Ordering::SeqCst) == t0;
        s.store(still, Ordering::SeqCst);
    });

    let gate = orchestrator.new_safepoint_gate("workers");
    let stop = Arc::new(AtomicBool::new(false));
    let workers: Vec<_> = (0..2)
        .map(|_| {
            let token = gate.register();
            let progress = Arc::clone(&worker_progress);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    token.safepoint();
                    progress.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(1));
                }
            })
        })
        .collect();

    let timer = orchestrator.new_timer("ticker").unwrap();
    let t = Arc::clone(&ticks);
    timer
        .schedule(
            TaskSpec::after(Duration::from_millis(5))
                .every(Recurrence::FixedDelay(Duration::from_millis(5)))
                .named("tick"),
            move || {
                t.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        ticks.load(Ordering::SeqCst) > 0 && worker_progress.load(Ordering::SeqCst) > 0
    }));

    orchestrator.checkpoint(image_dir().path()).unwrap();
    assert!(stalled.load(Ordering::SeqCst), "work progressed during the freeze");

    let (w1, t1) = (
        worker_progress.load(Ordering::SeqCst),
        ticks.load(Ordering::SeqCst),
    );
    assert!(wait_until(Duration::from_secs(5), || {
        worker_progress.load(Ordering::SeqCst) > w1 && ticks.load(Ordering::SeqCst) > t1
    }));

    stop.store(true, Ordering::SeqCst);
    for worker in workers {
        worker.join().unwrap();
    }
    timer.cancel();
}

#[test]
fn dropped_participants_are_skipped() {
    let (orchestrator, _clock, _freeze) = manual_orchestrator(Duration::from_secs(1));
    let kept = orchestrator.new_safepoint_gate("kept");
    let dropped = orchestrator.new_safepoint_gate("dropped");
    assert_eq!(orchestrator.participant_count(), 2);

    drop(dropped);
    assert_eq!(orchestrator.participant_count(), 1);
    orchestrator.checkpoint(image_dir().path()).unwrap();
    assert_eq!(kept.parked(), 0);
}

#[test]
fn configuration_file_drives_the_orchestrator() {
    let dir = image_dir();
    let images = dir.path().join("images");
    let config_path = dir.path().join(CONFIG_FILE_NAME);
    std::fs::write(
        &config_path,
        format!(
            "quiesce_timeout_ms = 250\nmissed_firings = \"replay\"\nimage_dir = '{}'\n",
            images.display()
        ),
    )
    .unwrap();

    let config = StasisConfig::from_file(&config_path).unwrap();
    assert_eq!(config.quiesce_timeout(), Duration::from_millis(250));
    assert_eq!(config.max_tardiness(), MAX_TARDINESS);

    let clock = manual_clock();
    let freeze = Arc::new(SimulatedFreeze::manual(clock.clone(), Duration::from_secs(1)));
    let orchestrator = CheckpointOrchestrator::builder()
        .config(config)
        .clock_source(clock)
        .freeze_mechanism(freeze.clone())
        .build()
        .unwrap();

    orchestrator.checkpoint_default().unwrap();
    assert_eq!(freeze.last_image(), Some(images));
}

#[test]
fn default_config_file_round_trips() {
    let dir = image_dir();
    let path = dir.path().join(CONFIG_FILE_NAME);
    StasisConfig::write_default_if_missing(&path).unwrap();

    let config = StasisConfig::from_file(&path).unwrap();
    assert_eq!(config, StasisConfig::default());

    let (orchestrator, _clock, _freeze) = manual_orchestrator(Duration::from_secs(1));
    let err = orchestrator.checkpoint_default().unwrap_err();
    assert!(matches!(err, StasisError::InvalidConfig(_)));
}

#[test]
fn invalid_configuration_is_rejected_at_build() {
    let config = StasisConfig {
        missed_firings: "burst".to_string(),
        ..StasisConfig::default()
    };
    let err = CheckpointOrchestrator::builder()
        .config(config)
        .build()
        .unwrap_err();
    assert!(matches!(err, StasisError::InvalidConfig(_)));
}

#[test]
fn process_orchestrator_is_installed_once() {
    let (first, _freeze) = sleeping_orchestrator(Duration::ZERO);
    let (second, _freeze) = sleeping_orchestrator(Duration::ZERO);

    install_process_orchestrator(Arc::clone(&first)).unwrap();
    assert!(matches!(
        install_process_orchestrator(second),
        Err(StasisError::AlreadyInstalled)
    ));

    let installed = process_orchestrator().unwrap();
    assert!(Arc::ptr_eq(&installed, &first));
    installed.checkpoint(image_dir().path()).unwrap();
}
