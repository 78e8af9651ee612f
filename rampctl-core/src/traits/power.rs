//! Programmable power source trait

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

/// Commands a power source accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(rename_all = "snake_case")]
pub enum SupplyCommand {
    SetVoltage,
    SetCurrent,
    OutputOn,
    OutputOff,
    EmergencyShutdown,
}

impl fmt::Display for SupplyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupplyCommand::SetVoltage => "set_voltage",
            SupplyCommand::SetCurrent => "set_current",
            SupplyCommand::OutputOn => "output_on",
            SupplyCommand::OutputOff => "output_off",
            SupplyCommand::EmergencyShutdown => "emergency_shutdown",
        };
        f.write_str(name)
    }
}

/// Errors reported by a power source
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PowerSourceError {
    /// Requested setpoint is outside the programmed envelope
    #[error("{command}: {value} outside allowed range 0..={limit}")]
    OutOfRange {
        command: SupplyCommand,
        value: f64,
        limit: f64,
    },
    /// The instrument did not accept or acknowledge the command
    #[error("{command}: {reason}")]
    Rejected {
        command: SupplyCommand,
        reason: String,
    },
    /// Transport to the instrument failed
    #[error("communication failure: {0}")]
    Communication(String),
    /// Some shutdown steps failed; the output may still be energized
    #[error("emergency shutdown incomplete: {0}")]
    ShutdownIncomplete(String),
}

/// Snapshot of the instrument state, when the source can report one
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PowerSourceStatus {
    pub output_on: bool,
    pub voltage_setpoint: f64,
    pub current_setpoint: f64,
    /// Measured output voltage, if a monitor channel is wired
    pub voltage_actual: Option<f64>,
    /// Measured output current, if a monitor channel is wired
    pub current_actual: Option<f64>,
}

/// Trait for programmable power sources
///
/// A single source is shared between the executor, the safety monitor and
/// any manual operator action, so every method takes `&self`;
/// implementations use interior mutability.
///
/// Every command may fail and must say so. `output_off` must be safe to call
/// repeatedly, and `emergency_shutdown` must leave the output de-energized or
/// report failure. Implementations may retry internally before reporting.
pub trait PowerSource: Send + Sync {
    /// Program the output voltage (or the voltage ceiling in current mode)
    fn set_voltage(&self, volts: f64) -> Result<(), PowerSourceError>;

    /// Program the output current (or the current ceiling in voltage mode)
    fn set_current(&self, amps: f64) -> Result<(), PowerSourceError>;

    /// Enable the output
    fn output_on(&self) -> Result<(), PowerSourceError>;

    /// Disable the output
    fn output_off(&self) -> Result<(), PowerSourceError>;

    /// Disable the output and zero all setpoints
    fn emergency_shutdown(&self) -> Result<(), PowerSourceError>;

    /// Report instrument state, if supported
    fn status(&self) -> Option<PowerSourceStatus> {
        None
    }
}

impl<P: PowerSource + ?Sized> PowerSource for Arc<P> {
    fn set_voltage(&self, volts: f64) -> Result<(), PowerSourceError> {
        (**self).set_voltage(volts)
    }

    fn set_current(&self, amps: f64) -> Result<(), PowerSourceError> {
        (**self).set_current(amps)
    }

    fn output_on(&self) -> Result<(), PowerSourceError> {
        (**self).output_on()
    }

    fn output_off(&self) -> Result<(), PowerSourceError> {
        (**self).output_off()
    }

    fn emergency_shutdown(&self) -> Result<(), PowerSourceError> {
        (**self).emergency_shutdown()
    }

    fn status(&self) -> Option<PowerSourceStatus> {
        (**self).status()
    }
}
