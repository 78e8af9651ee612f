//! Safety monitoring
//!
//! Compares sensor readings against per-sensor limits and shuts the power
//! source down when one is exceeded.

pub mod config;
pub mod event;
pub mod monitor;

pub use config::SafetyConfig;
pub use event::{SafetyEvent, SafetyObserver, SafetyStatus};
pub use monitor::{
    is_disconnected, SafetyError, SafetyMonitor, SafetyReport, SensorReadings,
    DISCONNECTED_SENTINEL, HISTORY_CAPACITY,
};
