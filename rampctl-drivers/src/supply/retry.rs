//! Retrying power source wrapper
//!
//! `output_off` and `emergency_shutdown` are retried before a failure is
//! reported. Setpoint commands pass straight through.

use rampctl_core::traits::{PowerSource, PowerSourceError, PowerSourceStatus, SupplyCommand};
use tracing::warn;

/// Default number of attempts for shutdown commands
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Power source that retries shutdown commands
#[derive(Debug)]
pub struct Retrying<P> {
    inner: P,
    attempts: u32,
}

impl<P: PowerSource> Retrying<P> {
    pub fn new(inner: P) -> Self {
        Self::with_attempts(inner, DEFAULT_ATTEMPTS)
    }

    /// Retry up to `attempts` times in total (at least once)
    pub fn with_attempts(inner: P, attempts: u32) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn into_inner(self) -> P {
        self.inner
    }

    fn retry<F>(&self, command: SupplyCommand, f: F) -> Result<(), PowerSourceError>
    where
        F: Fn(&P) -> Result<(), PowerSourceError>,
    {
        let mut attempt = 1;
        loop {
            match f(&self.inner) {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.attempts => return Err(e),
                Err(e) => {
                    warn!(
                        "{} failed (attempt {}/{}): {}",
                        command, attempt, self.attempts, e
                    );
                    attempt += 1;
                }
            }
        }
    }
}

impl<P: PowerSource> PowerSource for Retrying<P> {
    fn set_voltage(&self, volts: f64) -> Result<(), PowerSourceError> {
        self.inner.set_voltage(volts)
    }

    fn set_current(&self, amps: f64) -> Result<(), PowerSourceError> {
        self.inner.set_current(amps)
    }

    fn output_on(&self) -> Result<(), PowerSourceError> {
        self.inner.output_on()
    }

    fn output_off(&self) -> Result<(), PowerSourceError> {
        self.retry(SupplyCommand::OutputOff, |p| p.output_off())
    }

    fn emergency_shutdown(&self) -> Result<(), PowerSourceError> {
        self.retry(SupplyCommand::EmergencyShutdown, |p| p.emergency_shutdown())
    }

    fn status(&self) -> Option<PowerSourceStatus> {
        self.inner.status()
    }
}
