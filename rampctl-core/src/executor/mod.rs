//! Trajectory executor
//!
//! Drives a [`PowerSource`] along a loaded [`Trajectory`] from a dedicated
//! background thread. The controlling thread starts, pauses, resumes and
//! stops the run; every public method can be called concurrently and is
//! serialized through one lock.
//!
//! Power-source commands go through a separate command lock and never run
//! under the state lock, so status queries and `stop()` do not wait on a slow
//! supply. The loop checks for a stop request while holding the command lock;
//! after `stop()` no new setpoint is sent, although a command already in
//! flight when the stop timeout expires may still land. Observers are always
//! called after both locks are released.
//!
//! The executor does not watch sensors. When a [`SafetyMonitor`] trips, the
//! caller is expected to call [`Executor::stop`].
//!
//! [`SafetyMonitor`]: crate::safety::SafetyMonitor

pub mod clock;
pub mod observer;
pub mod state;

use std::sync::{Arc, Condvar, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::traits::{PowerSource, PowerSourceError};
use crate::trajectory::{ControlMode, Trajectory, ValidationReport};

pub use clock::{Clock, ManualClock, SystemClock};
pub use observer::{EventChannel, ExecutorEvent, ExecutorObserver};
pub use state::{RunEvent, RunState};

use observer::dispatch;

/// Executor timing configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Interval between setpoint updates (ms)
    pub tick_interval_ms: u64,
    /// Re-check interval while paused (ms)
    pub pause_poll_ms: u64,
    /// How long `stop()` waits for the loop to exit (ms)
    pub stop_timeout_ms: u64,
    /// Switch the output on after programming the protective limit
    pub enable_output: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            pause_poll_ms: 50,
            stop_timeout_ms: 2000,
            enable_output: false,
        }
    }
}

impl ExecutorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Reasons a trajectory was not loaded
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoadError {
    #[error("cannot load while a run is active")]
    Active,
    #[error("invalid trajectory: {0}")]
    Invalid(ValidationReport),
}

/// Reasons a run did not start
#[derive(Debug, Error)]
pub enum StartError {
    #[error("no trajectory loaded")]
    NoTrajectory,
    #[error("already running")]
    AlreadyRunning,
    /// Completed, Error and Aborted runs need a fresh load
    #[error("run is {0}; load a trajectory before starting again")]
    NeedsReload(RunState),
    /// Programming the protective limit or enabling the output failed
    #[error("power source rejected start: {0}")]
    Command(#[from] PowerSourceError),
    #[error("failed to spawn scheduling thread: {0}")]
    Spawn(std::io::Error),
    /// `stop()` or `load()` ran while the protective limit was being programmed
    #[error("run was stopped or reloaded while starting")]
    Interrupted,
}

/// Snapshot of executor state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutorStatus {
    pub state: RunState,
    pub trajectory_name: Option<String>,
    pub setpoint: f64,
    /// Active segment (0-based)
    pub step_index: usize,
    pub step_count: usize,
    pub elapsed_s: f64,
    pub remaining_s: f64,
    pub progress_percent: f64,
    pub error: Option<String>,
}

/// Mutable run state, guarded by `Shared::inner`
#[derive(Debug, Default)]
struct Inner {
    state: RunState,
    trajectory: Option<Arc<Trajectory>>,
    started_at: Option<Instant>,
    paused_at: Option<Instant>,
    /// Set when the run reaches Completed or Error
    ended_at: Option<Instant>,
    paused_total: Duration,
    setpoint: f64,
    step_index: usize,
    error: Option<String>,
    stop_requested: bool,
    /// Incremented on every start; a loop from an older run exits untouched
    generation: u64,
    worker_running: bool,
}

impl Inner {
    fn elapsed(&self, now: Instant) -> Duration {
        let Some(started_at) = self.started_at else {
            return Duration::ZERO;
        };
        let until = self.paused_at.or(self.ended_at).unwrap_or(now);
        until
            .saturating_duration_since(started_at)
            .saturating_sub(self.paused_total)
    }

    fn owns(&self, generation: u64) -> bool {
        self.generation == generation && !self.stop_requested
    }
}

struct Shared {
    source: Arc<dyn PowerSource>,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
    inner: Mutex<Inner>,
    wake: Condvar,
    /// Serializes power-source commands; taken before `inner`, never after
    commands: Mutex<()>,
    observers: Mutex<Vec<Arc<dyn ExecutorObserver>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn commands(&self) -> MutexGuard<'_, ()> {
        self.commands.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current run still belongs to `generation` and is Running
    fn may_command(&self, generation: u64) -> bool {
        let inner = self.lock();
        inner.owns(generation) && inner.state == RunState::Running
    }

    fn notify<F>(&self, f: F)
    where
        F: Fn(&dyn ExecutorObserver),
    {
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        dispatch(&observers, f);
    }

    fn command(&self, mode: ControlMode, value: f64) -> Result<(), PowerSourceError> {
        match mode {
            ControlMode::Voltage => self.source.set_voltage(value),
            ControlMode::Current => self.source.set_current(value),
        }
    }

    fn program_limit(&self, trajectory: &Trajectory) -> Result<(), PowerSourceError> {
        let limit = trajectory.protective_limit();
        match trajectory.control_mode {
            ControlMode::Voltage => self.source.set_current(limit),
            ControlMode::Current => self.source.set_voltage(limit),
        }
    }

    /// Zero both setpoints and switch the output off, logging failures
    fn zero_outputs(&self) {
        if let Err(e) = self.source.set_voltage(0.0) {
            warn!("Failed to zero voltage: {}", e);
        }
        if let Err(e) = self.source.set_current(0.0) {
            warn!("Failed to zero current: {}", e);
        }
        if let Err(e) = self.source.output_off() {
            warn!("Failed to switch output off: {}", e);
        }
    }

    /// Record a command failure and enter Error
    fn fault(&self, mut inner: MutexGuard<'_, Inner>, message: String) {
        error!("{}", message);
        inner.error = Some(message.clone());
        inner.ended_at = Some(self.clock.now());
        inner.state = inner.state.transition(RunEvent::Fault);
        let state = inner.state;
        drop(inner);

        self.notify(|o| o.on_error(&message));
        self.notify(|o| o.on_state_change(state));
    }
}

/// Clears `worker_running` when the loop exits, even by panic
struct WorkerGuard<'a> {
    shared: &'a Shared,
    generation: u64,
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        if inner.generation == self.generation {
            inner.worker_running = false;
        }
        drop(inner);
        self.shared.wake.notify_all();
    }
}

fn run_loop(shared: Arc<Shared>, generation: u64) {
    let _guard = WorkerGuard {
        shared: &shared,
        generation,
    };
    let tick = shared.config.tick_interval();
    let poll = shared.config.pause_poll();
    let mut last_step: Option<usize> = None;

    loop {
        let inner = shared.lock();
        if !inner.owns(generation) {
            debug!("Scheduling loop exiting on stop request");
            return;
        }

        if inner.state == RunState::Paused {
            let _ = shared
                .wake
                .wait_timeout_while(inner, poll, |i| {
                    i.owns(generation) && i.state == RunState::Paused
                })
                .unwrap_or_else(|e| e.into_inner());
            continue;
        }

        if inner.state != RunState::Running {
            return;
        }

        let Some(trajectory) = inner.trajectory.clone() else {
            return;
        };
        let elapsed = inner.elapsed(shared.clock.now()).as_secs_f64();
        drop(inner);

        if elapsed >= trajectory.total_duration() {
            finish(&shared, generation, &trajectory);
            return;
        }

        let value = trajectory.value_at(elapsed);
        let index = trajectory
            .segment_at(elapsed)
            .index()
            .unwrap_or_else(|| trajectory.segment_count().saturating_sub(1));

        let commands = shared.commands();
        if !shared.may_command(generation) {
            // Stopped or paused since the state was read
            continue;
        }
        let result = shared.command(trajectory.control_mode, value);
        drop(commands);

        let mut inner = shared.lock();
        if !inner.owns(generation) {
            debug!("Stop requested during {} command", trajectory.control_mode);
            return;
        }
        if let Err(e) = result {
            let message = format!(
                "{} command failed at {:.3} {}: {}",
                trajectory.control_mode,
                value,
                unit(trajectory.control_mode),
                e
            );
            shared.fault(inner, message);
            return;
        }
        inner.setpoint = value;
        inner.step_index = index;
        drop(inner);

        shared.notify(|o| o.on_setpoint(value));
        if last_step != Some(index) {
            last_step = Some(index);
            let total_steps = trajectory.segment_count();
            debug!("Segment {}/{}", index + 1, total_steps);
            shared.notify(|o| o.on_step(index, total_steps));
        }

        let inner = shared.lock();
        let _ = shared
            .wake
            .wait_timeout_while(inner, tick, |i| {
                i.owns(generation) && i.state == RunState::Running
            })
            .unwrap_or_else(|e| e.into_inner());
    }
}

/// Normal completion: zero outputs and enter Completed
fn finish(shared: &Shared, generation: u64, trajectory: &Trajectory) {
    let commands = shared.commands();
    if !shared.lock().owns(generation) {
        return;
    }
    shared.zero_outputs();
    drop(commands);

    let mut inner = shared.lock();
    if !inner.owns(generation) {
        // stop() sent its own zero/off and owns the transition
        return;
    }
    inner.setpoint = 0.0;
    inner.ended_at = Some(shared.clock.now());
    inner.state = inner.state.transition(RunEvent::Finish);
    let state = inner.state;
    drop(inner);

    info!("Trajectory '{}' completed", trajectory.name);
    shared.notify(|o| o.on_state_change(state));
    shared.notify(|o| o.on_complete());
}

fn unit(mode: ControlMode) -> &'static str {
    match mode {
        ControlMode::Voltage => "V",
        ControlMode::Current => "A",
    }
}

/// Trajectory executor
///
/// All methods take `&self`; wrap the executor in an `Arc` to share it
/// between threads.
pub struct Executor {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    /// Create an executor with default timing and the system clock
    pub fn new(source: Arc<dyn PowerSource>) -> Self {
        Self::with_config(source, ExecutorConfig::default())
    }

    pub fn with_config(source: Arc<dyn PowerSource>, config: ExecutorConfig) -> Self {
        Self::with_clock(source, config, Arc::new(SystemClock))
    }

    /// Create an executor reading time from `clock`
    pub fn with_clock(
        source: Arc<dyn PowerSource>,
        config: ExecutorConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                clock,
                config,
                inner: Mutex::new(Inner::default()),
                wake: Condvar::new(),
                commands: Mutex::new(()),
                observers: Mutex::new(Vec::new()),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.shared.config
    }

    /// Register an observer
    pub fn subscribe(&self, observer: Arc<dyn ExecutorObserver>) {
        self.shared
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Load a trajectory
    ///
    /// Refused while a run is active. Invalid trajectories are rejected with
    /// the full list of problems. On success the executor is Idle at segment 0
    /// with the setpoint at the trajectory's start value.
    pub fn load(&self, trajectory: Trajectory) -> Result<(), LoadError> {
        let mut inner = self.shared.lock();
        if inner.state.is_active() {
            warn!("Load refused: run is {}", inner.state);
            return Err(LoadError::Active);
        }

        let report = trajectory.validate();
        if !report.is_valid() {
            warn!("Rejected trajectory '{}': {}", trajectory.name, report);
            return Err(LoadError::Invalid(report));
        }

        let previous = inner.state;
        inner.state = inner.state.transition(RunEvent::Load);
        inner.setpoint = trajectory.start_value();
        inner.step_index = 0;
        inner.started_at = None;
        inner.paused_at = None;
        inner.ended_at = None;
        inner.paused_total = Duration::ZERO;
        inner.error = None;

        info!("Loaded trajectory {}", trajectory);
        inner.trajectory = Some(Arc::new(trajectory));
        let state = inner.state;
        drop(inner);

        if state != previous {
            self.shared.notify(|o| o.on_state_change(state));
        }
        Ok(())
    }

    /// Start the loaded trajectory
    ///
    /// From Paused this is [`resume`](Self::resume). The protective limit is
    /// programmed before the loop starts; if that fails the executor enters
    /// Error and no loop is launched.
    pub fn start(&self) -> Result<(), StartError> {
        let commands = self.shared.commands();
        let mut inner = self.shared.lock();
        let current = inner.state;
        match current {
            RunState::Paused => {
                drop(inner);
                drop(commands);
                return if self.resume() {
                    Ok(())
                } else {
                    Err(StartError::AlreadyRunning)
                };
            }
            RunState::Running => return Err(StartError::AlreadyRunning),
            state if state.is_terminal() => return Err(StartError::NeedsReload(state)),
            _ => {}
        }

        let trajectory = inner.trajectory.clone().ok_or(StartError::NoTrajectory)?;

        // A stale loop from an earlier run stops owning the executor here
        inner.generation = inner.generation.wrapping_add(1);
        inner.stop_requested = false;
        let generation = inner.generation;
        drop(inner);

        if let Err(e) = self.shared.program_limit(&trajectory) {
            let message = format!(
                "failed to program protective {} limit {}: {}",
                other_quantity(trajectory.control_mode),
                trajectory.protective_limit(),
                e
            );
            drop(commands);
            self.shared.fault(self.shared.lock(), message);
            return Err(e.into());
        }

        if self.shared.config.enable_output {
            if let Err(e) = self.shared.source.output_on() {
                drop(commands);
                self.shared.fault(
                    self.shared.lock(),
                    format!("failed to switch output on: {e}"),
                );
                return Err(e.into());
            }
        }

        let mut inner = self.shared.lock();
        let reloaded = !inner
            .trajectory
            .as_ref()
            .is_some_and(|t| Arc::ptr_eq(t, &trajectory));
        if !inner.owns(generation) || reloaded {
            drop(inner);
            warn!("Start of '{}' interrupted", trajectory.name);
            self.shared.zero_outputs();
            drop(commands);
            return Err(StartError::Interrupted);
        }

        inner.started_at = Some(self.shared.clock.now());
        inner.paused_at = None;
        inner.ended_at = None;
        inner.paused_total = Duration::ZERO;
        inner.error = None;
        inner.setpoint = trajectory.start_value();
        inner.step_index = 0;
        inner.state = inner.state.transition(RunEvent::Start);
        drop(inner);
        drop(commands);

        info!(
            "Started '{}': {} segments, {:.1} s, {} mode",
            trajectory.name,
            trajectory.segment_count(),
            trajectory.total_duration(),
            trajectory.control_mode
        );
        // Observers hear about Running before the loop can send a setpoint
        self.shared
            .notify(|o| o.on_state_change(RunState::Running));
        self.spawn_worker(generation)
    }

    fn spawn_worker(&self, generation: u64) -> Result<(), StartError> {
        let mut inner = self.shared.lock();
        if !inner.owns(generation) {
            // Stopped while observers were being notified
            return Ok(());
        }

        // The loop blocks on the lock until this method releases it
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("rampctl-executor".into())
            .spawn(move || run_loop(shared, generation));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared
                    .fault(inner, format!("failed to spawn scheduling thread: {e}"));
                return Err(StartError::Spawn(e));
            }
        };
        inner.worker_running = true;

        let previous = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        drop(inner);

        if let Some(previous) = previous {
            if previous.is_finished() {
                let _ = previous.join();
            }
        }
        Ok(())
    }

    /// Stop the run and de-energize the source
    ///
    /// Waits up to the configured timeout for the loop to exit, then always
    /// zeroes both setpoints and switches the output off. Only Running or
    /// Paused runs become Aborted; from any other state this just repeats
    /// the zero/off commands.
    ///
    /// A stop after Completed or Error keeps that state: it still carries the
    /// outcome of the run (and the error message) until the next `load()`.
    pub fn stop(&self) {
        let on_worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| h.thread().id() == thread::current().id());

        let mut inner = self.shared.lock();
        inner.stop_requested = true;
        let generation = inner.generation;
        self.shared.wake.notify_all();

        // An observer calling stop() from the loop thread must not wait on itself
        if !on_worker {
            let timeout = self.shared.config.stop_timeout();
            let (guard, wait) = self
                .shared
                .wake
                .wait_timeout_while(inner, timeout, |i| i.worker_running)
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;

            let handle = self
                .worker
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if wait.timed_out() && inner.worker_running {
                warn!(
                    "Scheduling thread did not exit within {:?}; detaching",
                    timeout
                );
            } else if let Some(handle) = handle {
                // The guard has already run; the thread is finishing its return
                let _ = handle.join();
            }
        }

        drop(inner);

        // A command still in flight after the timeout holds the lock; send the
        // fallback anyway rather than wait on it
        let commands = match self.shared.commands.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => {
                warn!("Power source busy; sending zero/off without waiting");
                None
            }
        };
        self.shared.zero_outputs();
        drop(commands);

        let mut inner = self.shared.lock();
        if inner.generation != generation {
            // A new run started while the outputs were being zeroed
            return;
        }
        let previous = inner.state;
        inner.state = inner.state.transition(RunEvent::Stop);
        let state = inner.state;
        if previous.is_active() {
            inner.setpoint = 0.0;
            inner.started_at = None;
            inner.paused_at = None;
            inner.paused_total = Duration::ZERO;
        }
        drop(inner);

        if state != previous {
            info!("Run aborted");
            self.shared.notify(|o| o.on_state_change(state));
        }
    }

    /// Pause a running trajectory
    ///
    /// Returns false unless the executor was Running.
    pub fn pause(&self) -> bool {
        let mut inner = self.shared.lock();
        if inner.state != RunState::Running {
            return false;
        }

        inner.paused_at = Some(self.shared.clock.now());
        inner.state = inner.state.transition(RunEvent::Pause);
        let elapsed = inner.elapsed(self.shared.clock.now());
        drop(inner);
        self.shared.wake.notify_all();

        info!("Paused at {:.1} s", elapsed.as_secs_f64());
        self.shared
            .notify(|o| o.on_state_change(RunState::Paused));
        true
    }

    /// Resume a paused trajectory
    ///
    /// Returns false unless the executor was Paused.
    pub fn resume(&self) -> bool {
        let mut inner = self.shared.lock();
        if inner.state != RunState::Paused {
            return false;
        }

        let now = self.shared.clock.now();
        if let Some(paused_at) = inner.paused_at.take() {
            inner.paused_total += now.saturating_duration_since(paused_at);
        }
        inner.state = inner.state.transition(RunEvent::Resume);
        drop(inner);
        self.shared.wake.notify_all();

        info!("Resumed");
        self.shared
            .notify(|o| o.on_state_change(RunState::Running));
        true
    }

    pub fn state(&self) -> RunState {
        self.shared.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    /// Running or Paused
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Last commanded (or initial) setpoint
    pub fn setpoint(&self) -> f64 {
        self.shared.lock().setpoint
    }

    /// Active segment (0-based)
    pub fn step_index(&self) -> usize {
        self.shared.lock().step_index
    }

    /// Loaded trajectory
    pub fn trajectory(&self) -> Option<Arc<Trajectory>> {
        self.shared.lock().trajectory.clone()
    }

    /// Message of the last command failure
    pub fn error_message(&self) -> Option<String> {
        self.shared.lock().error.clone()
    }

    /// Run time in seconds, excluding pauses
    pub fn elapsed_time(&self) -> f64 {
        let inner = self.shared.lock();
        inner.elapsed(self.shared.clock.now()).as_secs_f64()
    }

    /// Percentage of the trajectory completed (0..=100)
    pub fn progress_percent(&self) -> f64 {
        let inner = self.shared.lock();
        progress(&inner, self.shared.clock.now())
    }

    /// Seconds left in the trajectory
    pub fn remaining_time(&self) -> f64 {
        let inner = self.shared.lock();
        remaining(&inner, self.shared.clock.now())
    }

    pub fn status(&self) -> ExecutorStatus {
        let inner = self.shared.lock();
        let now = self.shared.clock.now();
        ExecutorStatus {
            state: inner.state,
            trajectory_name: inner.trajectory.as_ref().map(|t| t.name.clone()),
            setpoint: inner.setpoint,
            step_index: inner.step_index,
            step_count: inner
                .trajectory
                .as_ref()
                .map_or(0, |t| t.segment_count()),
            elapsed_s: inner.elapsed(now).as_secs_f64(),
            remaining_s: remaining(&inner, now),
            progress_percent: progress(&inner, now),
            error: inner.error.clone(),
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if self.is_active() {
            self.stop();
        }
    }
}

fn progress(inner: &Inner, now: Instant) -> f64 {
    let Some(trajectory) = inner.trajectory.as_ref() else {
        return 0.0;
    };
    let total = trajectory.total_duration();
    if total <= 0.0 {
        return 100.0;
    }
    (inner.elapsed(now).as_secs_f64() / total * 100.0).min(100.0)
}

fn remaining(inner: &Inner, now: Instant) -> f64 {
    let total = inner
        .trajectory
        .as_ref()
        .map_or(0.0, |t| t.total_duration());
    (total - inner.elapsed(now).as_secs_f64()).max(0.0)
}

fn other_quantity(mode: ControlMode) -> ControlMode {
    match mode {
        ControlMode::Voltage => ControlMode::Current,
        ControlMode::Current => ControlMode::Voltage,
    }
}
