//! Safety status, events and notifications

use std::time::SystemTime;

use serde::Serialize;

/// Interlock status
///
/// `ShutdownTriggered` is sticky: only [`SafetyMonitor::reset`] leaves it.
///
/// [`SafetyMonitor::reset`]: super::SafetyMonitor::reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(rename_all = "snake_case")]
pub enum SafetyStatus {
    /// All readings below their warning level
    #[default]
    Ok,
    /// At least one reading is close to (or debouncing over) its limit
    Warning,
    /// A limit was exceeded; waiting for an operator reset
    ShutdownTriggered,
}

impl SafetyStatus {
    pub fn is_safe(&self) -> bool {
        !matches!(self, SafetyStatus::ShutdownTriggered)
    }

    /// Status after a limit check
    pub fn after_check(self, warned: bool, tripped: bool) -> Self {
        match self {
            SafetyStatus::ShutdownTriggered => SafetyStatus::ShutdownTriggered,
            _ if tripped => SafetyStatus::ShutdownTriggered,
            _ if warned => SafetyStatus::Warning,
            _ => SafetyStatus::Ok,
        }
    }
}

impl core::fmt::Display for SafetyStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            SafetyStatus::Ok => "ok",
            SafetyStatus::Warning => "warning",
            SafetyStatus::ShutdownTriggered => "shutdown_triggered",
        };
        f.write_str(name)
    }
}

/// A recorded limit violation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyEvent {
    pub sensor_name: String,
    pub value: f64,
    pub limit: f64,
    pub timestamp: SystemTime,
}

impl SafetyEvent {
    pub fn new(sensor_name: impl Into<String>, value: f64, limit: f64) -> Self {
        Self {
            sensor_name: sensor_name.into(),
            value,
            limit,
            timestamp: SystemTime::now(),
        }
    }
}

impl core::fmt::Display for SafetyEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} reading {:.1} exceeded limit {:.1}",
            self.sensor_name, self.value, self.limit
        )
    }
}

/// Listener interface for safety notifications
///
/// Called after the monitor lock is released. All methods default to doing
/// nothing.
pub trait SafetyObserver: Send + Sync {
    /// A reading passed its warning level without tripping
    fn on_warning(&self, _sensor: &str, _value: f64, _limit: f64) {}

    /// A reading tripped its limit
    fn on_limit_exceeded(&self, _event: &SafetyEvent) {}

    /// The interlock entered shutdown (once per tripping check)
    fn on_shutdown(&self, _event: &SafetyEvent) {}
}
