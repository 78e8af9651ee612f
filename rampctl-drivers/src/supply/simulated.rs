//! Simulated programmable supply
//!
//! Behaves like a CV/CC bench supply driving a fixed resistive load. The
//! supply regulates voltage until the load would draw more than the current
//! setpoint, then regulates current instead.
//!
//! Faults can be injected to exercise error paths: a command kind that always
//! fails, or a budget of successful commands after which everything fails.

use std::sync::{Mutex, MutexGuard};

use rampctl_core::traits::{PowerSource, PowerSourceError, PowerSourceStatus, SupplyCommand};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Supply envelope and load
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedSupplyConfig {
    /// Highest accepted voltage setpoint (V)
    pub max_voltage: f64,
    /// Highest accepted current setpoint (A)
    pub max_current: f64,
    /// Load resistance (ohms)
    pub load_ohms: f64,
}

impl Default for SimulatedSupplyConfig {
    fn default() -> Self {
        Self {
            max_voltage: 60.0,
            max_current: 50.0,
            load_ohms: 2.0,
        }
    }
}

#[derive(Debug, Default)]
struct SupplyState {
    output_on: bool,
    voltage: f64,
    current: f64,
    log: Vec<(SupplyCommand, Option<f64>)>,
    accepted: usize,
    fail_on: Option<SupplyCommand>,
    fail_after: Option<usize>,
}

/// In-memory power source
#[derive(Debug)]
pub struct SimulatedSupply {
    config: SimulatedSupplyConfig,
    state: Mutex<SupplyState>,
}

impl Default for SimulatedSupply {
    fn default() -> Self {
        Self::new(SimulatedSupplyConfig::default())
    }
}

impl SimulatedSupply {
    pub fn new(config: SimulatedSupplyConfig) -> Self {
        info!(
            "Simulated supply: 0..={} V, 0..={} A, {} ohm load",
            config.max_voltage, config.max_current, config.load_ohms
        );
        Self {
            config,
            state: Mutex::new(SupplyState::default()),
        }
    }

    pub fn config(&self) -> &SimulatedSupplyConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, SupplyState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // Fault injection

    /// Make every `command` fail until faults are cleared
    pub fn fail_on(&self, command: SupplyCommand) {
        self.lock().fail_on = Some(command);
    }

    /// Fail every command once `count` more have succeeded
    pub fn fail_after(&self, count: usize) {
        let mut state = self.lock();
        state.fail_after = Some(state.accepted + count);
    }

    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.fail_on = None;
        state.fail_after = None;
    }

    // Inspection

    pub fn output_is_on(&self) -> bool {
        self.lock().output_on
    }

    pub fn voltage_setpoint(&self) -> f64 {
        self.lock().voltage
    }

    pub fn current_setpoint(&self) -> f64 {
        self.lock().current
    }

    /// Accepted commands, oldest first
    pub fn command_log(&self) -> Vec<(SupplyCommand, Option<f64>)> {
        self.lock().log.clone()
    }

    /// Voltage and current delivered into the load
    pub fn delivered(&self) -> (f64, f64) {
        let state = self.lock();
        self.operating_point(&state)
    }

    /// Power delivered into the load (W)
    pub fn power_w(&self) -> f64 {
        let (volts, amps) = self.delivered();
        volts * amps
    }

    fn operating_point(&self, state: &SupplyState) -> (f64, f64) {
        if !state.output_on || self.config.load_ohms <= 0.0 {
            return (0.0, 0.0);
        }
        let cv_current = state.voltage / self.config.load_ohms;
        if cv_current <= state.current {
            (state.voltage, cv_current)
        } else {
            // Current limited
            (state.current * self.config.load_ohms, state.current)
        }
    }

    /// Run a command through fault injection, then apply it
    fn execute<F>(
        &self,
        command: SupplyCommand,
        value: Option<f64>,
        apply: F,
    ) -> Result<(), PowerSourceError>
    where
        F: FnOnce(&mut SupplyState) -> Result<(), PowerSourceError>,
    {
        let mut state = self.lock();

        if state.fail_on == Some(command) {
            return Err(PowerSourceError::Rejected {
                command,
                reason: "injected fault".into(),
            });
        }
        if state.fail_after.is_some_and(|limit| state.accepted >= limit) {
            return Err(PowerSourceError::Communication(
                "simulated link loss".into(),
            ));
        }

        apply(&mut *state)?;
        state.accepted += 1;
        state.log.push((command, value));
        debug!("{} {:?}", command, value);
        Ok(())
    }
}

fn check_range(command: SupplyCommand, value: f64, limit: f64) -> Result<(), PowerSourceError> {
    if value.is_finite() && (0.0..=limit).contains(&value) {
        Ok(())
    } else {
        Err(PowerSourceError::OutOfRange {
            command,
            value,
            limit,
        })
    }
}

impl PowerSource for SimulatedSupply {
    fn set_voltage(&self, volts: f64) -> Result<(), PowerSourceError> {
        let limit = self.config.max_voltage;
        self.execute(SupplyCommand::SetVoltage, Some(volts), |state| {
            check_range(SupplyCommand::SetVoltage, volts, limit)?;
            state.voltage = volts;
            Ok(())
        })
    }

    fn set_current(&self, amps: f64) -> Result<(), PowerSourceError> {
        let limit = self.config.max_current;
        self.execute(SupplyCommand::SetCurrent, Some(amps), |state| {
            check_range(SupplyCommand::SetCurrent, amps, limit)?;
            state.current = amps;
            Ok(())
        })
    }

    fn output_on(&self) -> Result<(), PowerSourceError> {
        self.execute(SupplyCommand::OutputOn, None, |state| {
            state.output_on = true;
            Ok(())
        })
    }

    fn output_off(&self) -> Result<(), PowerSourceError> {
        self.execute(SupplyCommand::OutputOff, None, |state| {
            state.output_on = false;
            Ok(())
        })
    }

    fn emergency_shutdown(&self) -> Result<(), PowerSourceError> {
        self.execute(SupplyCommand::EmergencyShutdown, None, |state| {
            state.output_on = false;
            state.voltage = 0.0;
            state.current = 0.0;
            Ok(())
        })
    }

    fn status(&self) -> Option<PowerSourceStatus> {
        let state = self.lock();
        let (volts, amps) = self.operating_point(&state);
        Some(PowerSourceStatus {
            output_on: state.output_on,
            voltage_setpoint: state.voltage,
            current_setpoint: state.current,
            voltage_actual: Some(volts),
            current_actual: Some(amps),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setpoints_and_output() {
        let supply = SimulatedSupply::default();

        supply.set_current(5.0).unwrap();
        supply.set_voltage(4.0).unwrap();
        assert_eq!(supply.delivered(), (0.0, 0.0));

        supply.output_on().unwrap();
        // 4 V into 2 ohm draws 2 A, under the 5 A ceiling
        assert_eq!(supply.delivered(), (4.0, 2.0));
        assert_eq!(supply.power_w(), 8.0);
    }

    #[test]
    fn test_current_limiting() {
        let supply = SimulatedSupply::default();
        supply.set_current(1.0).unwrap();
        supply.set_voltage(10.0).unwrap();
        supply.output_on().unwrap();

        assert_eq!(supply.delivered(), (2.0, 1.0));
        let status = supply.status().unwrap();
        assert_eq!(status.voltage_setpoint, 10.0);
        assert_eq!(status.voltage_actual, Some(2.0));
    }

    #[test]
    fn test_rejects_out_of_range() {
        let supply = SimulatedSupply::default();

        assert_eq!(
            supply.set_voltage(61.0),
            Err(PowerSourceError::OutOfRange {
                command: SupplyCommand::SetVoltage,
                value: 61.0,
                limit: 60.0,
            })
        );
        assert!(supply.set_current(-1.0).is_err());
        assert!(supply.set_voltage(f64::NAN).is_err());
        assert!(supply.command_log().is_empty());
    }

    #[test]
    fn test_emergency_shutdown_zeroes() {
        let supply = SimulatedSupply::default();
        supply.set_voltage(12.0).unwrap();
        supply.set_current(3.0).unwrap();
        supply.output_on().unwrap();

        supply.emergency_shutdown().unwrap();
        assert!(!supply.output_is_on());
        assert_eq!(supply.voltage_setpoint(), 0.0);
        assert_eq!(supply.current_setpoint(), 0.0);
    }

    #[test]
    fn test_output_off_is_repeatable() {
        let supply = SimulatedSupply::default();
        supply.output_off().unwrap();
        supply.output_off().unwrap();
        assert!(!supply.output_is_on());
    }

    #[test]
    fn test_fail_on_command() {
        let supply = SimulatedSupply::default();
        supply.fail_on(SupplyCommand::OutputOn);

        assert!(supply.set_voltage(1.0).is_ok());
        assert!(matches!(
            supply.output_on(),
            Err(PowerSourceError::Rejected { .. })
        ));

        supply.clear_faults();
        assert!(supply.output_on().is_ok());
    }

    #[test]
    fn test_fail_after_budget() {
        let supply = SimulatedSupply::default();
        supply.set_voltage(1.0).unwrap();
        supply.fail_after(2);

        assert!(supply.set_voltage(2.0).is_ok());
        assert!(supply.set_voltage(3.0).is_ok());
        assert!(matches!(
            supply.set_voltage(4.0),
            Err(PowerSourceError::Communication(_))
        ));
        assert_eq!(supply.voltage_setpoint(), 3.0);
        assert_eq!(supply.command_log().len(), 3);
    }

    #[test]
    fn test_config_defaults_from_toml() {
        let config: SimulatedSupplyConfig = toml::from_str("max_voltage = 30.0").unwrap();
        assert_eq!(config.max_voltage, 30.0);
        assert_eq!(config.max_current, 50.0);
        assert_eq!(config.load_ohms, 2.0);
    }
}
