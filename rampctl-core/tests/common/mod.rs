//! Shared test helpers
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rampctl_core::traits::{PowerSource, PowerSourceError, SupplyCommand};

/// Power source that records every command and can be told to fail
#[derive(Default)]
pub struct RecordingSource {
    log: Mutex<Vec<(SupplyCommand, Option<f64>)>>,
    fail_on: Mutex<Option<SupplyCommand>>,
}

impl RecordingSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every future `command` fail
    pub fn fail_on(&self, command: SupplyCommand) {
        *self.fail_on.lock().unwrap() = Some(command);
    }

    pub fn commands(&self) -> Vec<(SupplyCommand, Option<f64>)> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, command: SupplyCommand) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == command)
            .count()
    }

    /// Last `n` commands, oldest first
    pub fn tail(&self, n: usize) -> Vec<(SupplyCommand, Option<f64>)> {
        let log = self.log.lock().unwrap();
        log[log.len().saturating_sub(n)..].to_vec()
    }

    fn record(&self, command: SupplyCommand, value: Option<f64>) -> Result<(), PowerSourceError> {
        self.log.lock().unwrap().push((command, value));
        if *self.fail_on.lock().unwrap() == Some(command) {
            return Err(PowerSourceError::Communication("simulated link loss".into()));
        }
        Ok(())
    }
}

impl PowerSource for RecordingSource {
    fn set_voltage(&self, volts: f64) -> Result<(), PowerSourceError> {
        self.record(SupplyCommand::SetVoltage, Some(volts))
    }

    fn set_current(&self, amps: f64) -> Result<(), PowerSourceError> {
        self.record(SupplyCommand::SetCurrent, Some(amps))
    }

    fn output_on(&self) -> Result<(), PowerSourceError> {
        self.record(SupplyCommand::OutputOn, None)
    }

    fn output_off(&self) -> Result<(), PowerSourceError> {
        self.record(SupplyCommand::OutputOff, None)
    }

    fn emergency_shutdown(&self) -> Result<(), PowerSourceError> {
        self.record(SupplyCommand::EmergencyShutdown, None)
    }
}

/// Poll `condition` until it holds, panicking after a few seconds
pub fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(2));
    }
}

pub fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}
