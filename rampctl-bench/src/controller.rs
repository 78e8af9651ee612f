//! Bench controller
//!
//! Owns the executor, the safety monitor and the simulated hardware, and
//! runs the acquisition cycle: advance the thermal model, sample the
//! thermocouples, check limits, and stop the executor when the interlock
//! trips. The executor keeps its own background thread; this loop only
//! observes it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rampctl_core::executor::{Clock, Executor, RunState};
use rampctl_core::safety::{SafetyEvent, SafetyMonitor, SafetyStatus};
use rampctl_core::traits::PowerSource;
use rampctl_core::trajectory::Trajectory;
use rampctl_drivers::sensor::ThermalBench;
use rampctl_drivers::supply::{Retrying, SimulatedSupply};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{BenchConfig, BenchError, MAX_TIME_SCALE};

/// Clock running `scale` times faster than real time
#[derive(Debug)]
pub struct ScaledClock {
    origin: Instant,
    scale: f64,
}

impl ScaledClock {
    pub fn new(scale: f64) -> Self {
        Self {
            origin: Instant::now(),
            scale,
        }
    }

    /// Simulated seconds since creation
    pub fn elapsed_s(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * self.scale
    }
}

impl Clock for ScaledClock {
    fn now(&self) -> Instant {
        // Scales beyond MAX_TIME_SCALE can overflow Instant
        Duration::try_from_secs_f64(self.elapsed_s())
            .ok()
            .and_then(|scaled| self.origin.checked_add(scaled))
            .unwrap_or_else(Instant::now)
    }
}

/// What one acquisition cycle saw
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    /// Trajectory time (s)
    pub elapsed_s: f64,
    pub state: RunState,
    pub setpoint: f64,
    pub power_w: f64,
    pub readings: BTreeMap<String, f64>,
    pub safety: SafetyStatus,
    /// The interlock tripped on this cycle
    pub tripped: bool,
}

/// Outcome of a complete run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub trajectory: String,
    pub final_state: RunState,
    pub cycles: usize,
    pub trips: usize,
    /// Highest reading per sensor
    pub peak_c: BTreeMap<String, f64>,
    pub events: Vec<SafetyEvent>,
    pub error: Option<String>,
}

/// Executor, interlock and simulated hardware wired together
pub struct Bench {
    config: BenchConfig,
    supply: Arc<Retrying<SimulatedSupply>>,
    executor: Executor,
    monitor: SafetyMonitor,
    thermal: ThermalBench,
    clock: Arc<ScaledClock>,
}

impl Bench {
    /// Build the bench and load `trajectory` into the executor
    pub fn new(config: BenchConfig, trajectory: Trajectory) -> Result<Self, BenchError> {
        config.validate()?;

        let supply = Arc::new(Retrying::new(SimulatedSupply::new(config.supply)));
        let clock = Arc::new(ScaledClock::new(config.time_scale));
        let executor = Executor::with_clock(supply.clone(), config.executor, clock.clone());
        let source: Arc<dyn PowerSource> = supply.clone();
        let monitor = SafetyMonitor::from_config(&config.safety, Some(source))?;

        let mut thermal = ThermalBench::new(config.ambient_c);
        for sensor in &config.sensors {
            thermal.add_sensor(sensor.clone());
        }

        executor.load(trajectory)?;

        Ok(Self {
            config,
            supply,
            executor,
            monitor,
            thermal,
            clock,
        })
    }

    /// Build the bench from a configuration, reading its trajectory file
    pub fn from_config(config: BenchConfig) -> Result<Self, BenchError> {
        let trajectory = config.load_trajectory()?;
        Self::new(config, trajectory)
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn monitor(&self) -> &SafetyMonitor {
        &self.monitor
    }

    pub fn supply(&self) -> &SimulatedSupply {
        self.supply.inner()
    }

    pub fn thermal_mut(&mut self) -> &mut ThermalBench {
        &mut self.thermal
    }

    /// Start the loaded trajectory
    pub fn start(&self) -> Result<(), BenchError> {
        self.executor.start()?;
        Ok(())
    }

    /// Run one acquisition cycle covering `dt_s` simulated seconds
    pub fn cycle(&mut self, dt_s: f64) -> CycleReport {
        let power_w = self.supply.inner().power_w();
        self.thermal.step(power_w, dt_s);

        let readings = self.thermal.readings();
        let tripped = !self.monitor.check_limits(&readings);
        if tripped && self.executor.is_active() {
            warn!("Interlock tripped; stopping executor");
            self.executor.stop();
        }

        let status = self.executor.status();
        debug!(
            "t={:.1} s setpoint {:.3} power {:.1} W {:?}",
            status.elapsed_s, status.setpoint, power_w, readings
        );

        CycleReport {
            elapsed_s: status.elapsed_s,
            state: status.state,
            setpoint: status.setpoint,
            power_w,
            readings,
            safety: self.monitor.status(),
            tripped,
        }
    }

    /// Start the trajectory and cycle until it ends
    ///
    /// Returns once the executor leaves Running/Paused, whether it completed,
    /// failed or was stopped by the interlock.
    pub fn run(&mut self) -> Result<RunSummary, BenchError> {
        let interval = Duration::from_millis(self.config.acquisition_interval_ms);
        let trajectory = self
            .executor
            .trajectory()
            .map(|t| t.name.clone())
            .unwrap_or_default();

        self.start()?;

        let mut cycles = 0;
        let mut trips = 0;
        let mut peak_c: BTreeMap<String, f64> = BTreeMap::new();
        let mut last = self.clock.elapsed_s();

        loop {
            thread::sleep(interval);
            let now = self.clock.elapsed_s();
            let report = self.cycle(now - last);
            last = now;

            cycles += 1;
            if report.tripped {
                trips += 1;
            }
            for (sensor, value) in &report.readings {
                let peak = peak_c.entry(sensor.clone()).or_insert(*value);
                *peak = peak.max(*value);
            }

            if !report.state.is_active() {
                break;
            }
        }

        let final_state = self.executor.state();
        info!(
            "Run finished: {} after {} cycles, {} trips",
            final_state, cycles, trips
        );

        Ok(RunSummary {
            trajectory,
            final_state,
            cycles,
            trips,
            peak_c,
            events: self.monitor.event_history(),
            error: self.executor.error_message(),
        })
    }
}
