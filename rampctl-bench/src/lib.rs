//! Host acquisition loop for rampctl
//!
//! Couples a ramp executor with the temperature interlock and runs both
//! against a simulated supply and thermocouples.

pub mod config;
pub mod controller;
pub mod logging;

pub use config::{BenchConfig, BenchError};
pub use controller::{Bench, CycleReport, RunSummary, ScaledClock};
