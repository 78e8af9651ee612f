//! Threaded executor behavior

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{approx_eq, wait_for, RecordingSource};
use rampctl_core::executor::{
    EventChannel, Executor, ExecutorConfig, ExecutorEvent, ExecutorObserver, LoadError,
    ManualClock, RunState, StartError,
};
use rampctl_core::traits::{PowerSource, PowerSourceError, SupplyCommand};
use rampctl_core::trajectory::{ControlMode, Segment, Trajectory, ValidationIssue};

fn fast_config() -> ExecutorConfig {
    ExecutorConfig {
        tick_interval_ms: 2,
        pause_poll_ms: 2,
        stop_timeout_ms: 2000,
        enable_output: false,
    }
}

fn manual_executor(
    source: Arc<RecordingSource>,
) -> (Executor, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let executor = Executor::with_clock(source, fast_config(), clock.clone());
    (executor, clock)
}

/// Ramp to 10 V over 1 s, hold 1 s, ramp to 0 over 1 s
fn three_step() -> Trajectory {
    let mut t = Trajectory::new("Three step");
    t.add_ramp(10.0, 1.0).unwrap();
    t.add_hold(1.0).unwrap();
    t.add_ramp(0.0, 1.0).unwrap();
    t
}

#[test]
fn test_run_to_completion() {
    let source = RecordingSource::new();
    let (executor, clock) = manual_executor(source.clone());
    let (channel, events) = EventChannel::new();
    executor.subscribe(channel);

    executor.load(three_step()).unwrap();
    executor.start().unwrap();
    assert_eq!(executor.state(), RunState::Running);

    // Protective current ceiling goes out before any voltage setpoint
    wait_for("first setpoint", || source.count(SupplyCommand::SetVoltage) > 0);
    assert_eq!(
        source.commands()[..2],
        [
            (SupplyCommand::SetCurrent, Some(50.0)),
            (SupplyCommand::SetVoltage, Some(0.0)),
        ]
    );

    clock.advance_secs(0.5);
    wait_for("mid-ramp setpoint", || approx_eq(executor.setpoint(), 5.0));

    clock.advance_secs(3.0);
    wait_for("completion", || executor.state() == RunState::Completed);

    assert_eq!(executor.setpoint(), 0.0);
    assert_eq!(executor.progress_percent(), 100.0);
    assert_eq!(executor.remaining_time(), 0.0);
    assert_eq!(
        source.tail(3),
        vec![
            (SupplyCommand::SetVoltage, Some(0.0)),
            (SupplyCommand::SetCurrent, Some(0.0)),
            (SupplyCommand::OutputOff, None),
        ]
    );

    let events: Vec<_> = events.try_iter().collect();
    let completions = events
        .iter()
        .filter(|e| **e == ExecutorEvent::Complete)
        .count();
    assert_eq!(completions, 1);
    assert_eq!(events.first(), Some(&ExecutorEvent::StateChanged(RunState::Running)));
    assert!(events.contains(&ExecutorEvent::StateChanged(RunState::Completed)));
}

#[test]
fn test_step_notifications_follow_segments() {
    let source = RecordingSource::new();
    let (executor, clock) = manual_executor(source.clone());
    let (channel, events) = EventChannel::new();
    executor.subscribe(channel);

    let trajectory = three_step();
    executor.load(trajectory.clone()).unwrap();
    executor.start().unwrap();

    let mut t = 0.0;
    while t < 2.75 {
        t += 0.25;
        clock.advance_secs(0.25);
        let expected = trajectory.value_at(t);
        wait_for("setpoint", || approx_eq(executor.setpoint(), expected));
    }
    clock.advance_secs(1.0);
    wait_for("completion", || executor.state() == RunState::Completed);

    let steps: Vec<_> = events
        .try_iter()
        .filter_map(|e| match e {
            ExecutorEvent::Step { index, total } => Some((index, total)),
            _ => None,
        })
        .collect();
    assert_eq!(steps, vec![(0, 3), (1, 3), (2, 3)]);
}

#[test]
fn test_current_mode_programs_voltage_ceiling() {
    let source = RecordingSource::new();
    let (executor, _clock) = manual_executor(source.clone());

    let mut t = Trajectory::new("Filament")
        .with_control_mode(ControlMode::Current)
        .with_start_current(0.5)
        .with_limits(12.0, 50.0);
    t.add_ramp(4.0, 10.0).unwrap();

    executor.load(t).unwrap();
    executor.start().unwrap();
    wait_for("first setpoint", || source.count(SupplyCommand::SetCurrent) > 0);
    executor.stop();

    assert_eq!(
        source.commands()[..2],
        [
            (SupplyCommand::SetVoltage, Some(12.0)),
            (SupplyCommand::SetCurrent, Some(0.5)),
        ]
    );
}

#[test]
fn test_enable_output_after_limit() {
    let source = RecordingSource::new();
    let config = ExecutorConfig {
        enable_output: true,
        ..fast_config()
    };
    let clock = Arc::new(ManualClock::new());
    let executor = Executor::with_clock(source.clone(), config, clock);

    executor.load(three_step()).unwrap();
    executor.start().unwrap();
    executor.stop();

    assert_eq!(
        source.commands()[..2],
        [
            (SupplyCommand::SetCurrent, Some(50.0)),
            (SupplyCommand::OutputOn, None),
        ]
    );
}

#[test]
fn test_protective_limit_failure_enters_error() {
    let source = RecordingSource::new();
    source.fail_on(SupplyCommand::SetCurrent);
    let (executor, _clock) = manual_executor(source.clone());
    let (channel, events) = EventChannel::new();
    executor.subscribe(channel);

    executor.load(three_step()).unwrap();
    assert!(matches!(executor.start(), Err(StartError::Command(_))));

    assert_eq!(executor.state(), RunState::Error);
    assert!(executor.error_message().is_some());
    // No loop was launched
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(source.count(SupplyCommand::SetVoltage), 0);

    let events: Vec<_> = events.try_iter().collect();
    assert!(matches!(events[0], ExecutorEvent::Error(_)));
    assert_eq!(events[1], ExecutorEvent::StateChanged(RunState::Error));
}

#[test]
fn test_stop_after_error_keeps_error() {
    let source = RecordingSource::new();
    source.fail_on(SupplyCommand::SetCurrent);
    let (executor, _clock) = manual_executor(source.clone());
    executor.load(three_step()).unwrap();
    assert!(executor.start().is_err());
    let message = executor.error_message();

    executor.stop();
    assert_eq!(executor.state(), RunState::Error);
    assert_eq!(executor.error_message(), message);
    assert_eq!(source.tail(1), vec![(SupplyCommand::OutputOff, None)]);
}

#[test]
fn test_command_failure_is_not_retried() {
    let source = RecordingSource::new();
    source.fail_on(SupplyCommand::SetVoltage);
    let (executor, _clock) = manual_executor(source.clone());
    let (channel, events) = EventChannel::new();
    executor.subscribe(channel);

    executor.load(three_step()).unwrap();
    executor.start().unwrap();
    wait_for("error state", || executor.state() == RunState::Error);
    std::thread::sleep(Duration::from_millis(20));

    assert_eq!(source.count(SupplyCommand::SetVoltage), 1);
    // Error does not take the zero/off path
    assert_eq!(source.count(SupplyCommand::OutputOff), 0);

    let status = executor.status();
    assert_eq!(status.state, RunState::Error);
    assert!(status.error.unwrap().contains("simulated link loss"));
    assert!(events
        .try_iter()
        .any(|e| matches!(e, ExecutorEvent::Error(_))));

    // Terminal: needs a reload
    assert!(matches!(
        executor.start(),
        Err(StartError::NeedsReload(RunState::Error))
    ));
}

#[test]
fn test_stop_aborts_and_is_idempotent() {
    let source = RecordingSource::new();
    let (executor, _clock) = manual_executor(source.clone());
    let (channel, events) = EventChannel::new();
    executor.subscribe(channel);

    executor.load(three_step()).unwrap();
    executor.start().unwrap();
    wait_for("first setpoint", || source.count(SupplyCommand::SetVoltage) > 0);

    executor.stop();
    assert_eq!(executor.state(), RunState::Aborted);
    assert_eq!(executor.setpoint(), 0.0);
    assert_eq!(
        source.tail(3),
        vec![
            (SupplyCommand::SetVoltage, Some(0.0)),
            (SupplyCommand::SetCurrent, Some(0.0)),
            (SupplyCommand::OutputOff, None),
        ]
    );

    let before = source.commands().len();
    executor.stop();
    assert_eq!(executor.state(), RunState::Aborted);
    assert_eq!(source.commands().len(), before + 3);

    let aborted = events
        .try_iter()
        .filter(|e| *e == ExecutorEvent::StateChanged(RunState::Aborted))
        .count();
    assert_eq!(aborted, 1);

    // No setpoints after the fallback
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(source.commands().len(), before + 3);
}

#[test]
fn test_pause_freezes_elapsed_time() {
    let source = RecordingSource::new();
    let (executor, clock) = manual_executor(source.clone());
    executor.load(three_step()).unwrap();
    executor.start().unwrap();

    clock.advance_secs(0.5);
    assert!(executor.pause());
    assert_eq!(executor.state(), RunState::Paused);

    clock.advance_secs(10.0);
    assert!(approx_eq(executor.elapsed_time(), 0.5));

    assert!(executor.resume());
    clock.advance_secs(1.0);
    assert!(approx_eq(executor.elapsed_time(), 1.5));
    assert!(approx_eq(executor.progress_percent(), 50.0));
    assert!(approx_eq(executor.remaining_time(), 1.5));

    // Several cycles add up
    for _ in 0..3 {
        assert!(executor.pause());
        clock.advance_secs(2.0);
        assert!(executor.resume());
    }
    assert!(approx_eq(executor.elapsed_time(), 1.5));

    executor.stop();
}

#[test]
fn test_paused_loop_sends_nothing() {
    let source = RecordingSource::new();
    let (executor, clock) = manual_executor(source.clone());
    executor.load(three_step()).unwrap();
    executor.start().unwrap();
    wait_for("first setpoint", || source.count(SupplyCommand::SetVoltage) > 0);

    assert!(executor.pause());
    std::thread::sleep(Duration::from_millis(10));
    let before = source.count(SupplyCommand::SetVoltage);
    clock.advance_secs(1.0);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(source.count(SupplyCommand::SetVoltage), before);

    // start() while paused resumes
    executor.start().unwrap();
    assert_eq!(executor.state(), RunState::Running);
    executor.stop();
}

#[test]
fn test_lifecycle_rules() {
    let source = RecordingSource::new();
    let (executor, _clock) = manual_executor(source);

    assert!(matches!(executor.start(), Err(StartError::NoTrajectory)));

    executor.load(three_step()).unwrap();
    executor.start().unwrap();
    assert!(matches!(executor.start(), Err(StartError::AlreadyRunning)));
    assert_eq!(executor.load(three_step()), Err(LoadError::Active));

    executor.pause();
    assert_eq!(executor.load(three_step()), Err(LoadError::Active));

    executor.stop();
    assert!(matches!(
        executor.start(),
        Err(StartError::NeedsReload(RunState::Aborted))
    ));

    executor.load(three_step()).unwrap();
    assert_eq!(executor.state(), RunState::Idle);
    executor.start().unwrap();
    executor.stop();
}

#[test]
fn test_panicking_observer_does_not_stop_loop() {
    struct Panicker;
    impl ExecutorObserver for Panicker {
        fn on_setpoint(&self, _setpoint: f64) {
            panic!("observer bug");
        }
    }

    let source = RecordingSource::new();
    let (executor, clock) = manual_executor(source.clone());
    executor.subscribe(Arc::new(Panicker));
    executor.load(three_step()).unwrap();
    executor.start().unwrap();

    wait_for("several setpoints", || source.count(SupplyCommand::SetVoltage) > 3);
    clock.advance_secs(5.0);
    wait_for("completion", || executor.state() == RunState::Completed);
}

#[test]
fn test_stop_from_observer() {
    struct StopOnStep(std::sync::Mutex<Option<std::sync::Weak<Executor>>>);
    impl ExecutorObserver for StopOnStep {
        fn on_step(&self, index: usize, _total: usize) {
            if index == 1 {
                if let Some(executor) = self.0.lock().unwrap().as_ref().and_then(|w| w.upgrade()) {
                    executor.stop();
                }
            }
        }
    }

    let source = RecordingSource::new();
    let clock = Arc::new(ManualClock::new());
    let executor = Arc::new(Executor::with_clock(source, fast_config(), clock.clone()));
    let observer = Arc::new(StopOnStep(std::sync::Mutex::new(None)));
    *observer.0.lock().unwrap() = Some(Arc::downgrade(&executor));
    executor.subscribe(observer);

    executor.load(three_step()).unwrap();
    executor.start().unwrap();
    clock.advance_secs(1.5);

    wait_for("abort", || executor.state() == RunState::Aborted);
}

#[test]
fn test_drop_stops_active_run() {
    let source = RecordingSource::new();
    {
        let (executor, _clock) = manual_executor(source.clone());
        executor.load(three_step()).unwrap();
        executor.start().unwrap();
        wait_for("first setpoint", || source.count(SupplyCommand::SetVoltage) > 0);
    }

    assert_eq!(source.tail(1), vec![(SupplyCommand::OutputOff, None)]);
}

// Supply whose non-zero voltage setpoints take a long time to acknowledge
struct SlowSource {
    delay: Duration,
    busy: AtomicBool,
}

impl PowerSource for SlowSource {
    fn set_voltage(&self, volts: f64) -> Result<(), PowerSourceError> {
        if volts > 0.0 {
            self.busy.store(true, Ordering::SeqCst);
            thread::sleep(self.delay);
            self.busy.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn set_current(&self, _amps: f64) -> Result<(), PowerSourceError> {
        Ok(())
    }

    fn output_on(&self) -> Result<(), PowerSourceError> {
        Ok(())
    }

    fn output_off(&self) -> Result<(), PowerSourceError> {
        Ok(())
    }

    fn emergency_shutdown(&self) -> Result<(), PowerSourceError> {
        Ok(())
    }
}

#[test]
fn test_slow_command_does_not_block_queries_or_stop() {
    let source = Arc::new(SlowSource {
        delay: Duration::from_secs(2),
        busy: AtomicBool::new(false),
    });
    let config = ExecutorConfig {
        stop_timeout_ms: 100,
        ..fast_config()
    };
    let executor = Executor::with_config(source.clone(), config);

    let mut trajectory = Trajectory::new("Slow").with_start_voltage(1.0);
    trajectory.add_ramp(10.0, 10.0).unwrap();
    executor.load(trajectory).unwrap();
    executor.start().unwrap();
    wait_for("command in flight", || source.busy.load(Ordering::SeqCst));

    let begin = Instant::now();
    let status = executor.status();
    assert_eq!(status.state, RunState::Running);
    assert!(begin.elapsed() < Duration::from_millis(500));

    let begin = Instant::now();
    executor.stop();
    assert!(begin.elapsed() < Duration::from_secs(1));
    assert_eq!(executor.state(), RunState::Aborted);
    assert_eq!(executor.setpoint(), 0.0);

    // The detached loop finishes its command without touching the run
    wait_for("command done", || !source.busy.load(Ordering::SeqCst));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(executor.state(), RunState::Aborted);
    assert_eq!(executor.setpoint(), 0.0);
    assert!(!source.busy.load(Ordering::SeqCst));
}

#[test]
fn test_load_rejects_ramp_without_target_for_mode() {
    let source = RecordingSource::new();
    let (executor, _clock) = manual_executor(source.clone());

    let mut trajectory = Trajectory::new("Wrong mode").with_control_mode(ControlMode::Current);
    trajectory.push(Segment::ramp(ControlMode::Voltage, 5.0, 2.0).unwrap());

    match executor.load(trajectory) {
        Err(LoadError::Invalid(report)) => assert!(report.issues().contains(
            &ValidationIssue::MissingTarget {
                index: 0,
                mode: ControlMode::Current,
            }
        )),
        other => panic!("expected invalid trajectory, got {other:?}"),
    }
    assert!(executor.trajectory().is_none());
    assert!(matches!(executor.start(), Err(StartError::NoTrajectory)));
    assert!(source.commands().is_empty());
}
