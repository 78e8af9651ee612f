//! Board-agnostic core logic for ramped power supply control
//!
//! This crate contains all control logic that does not depend on a
//! specific power supply or sensor interface:
//!
//! - Power source abstraction trait
//! - Trajectory model (ramp/hold segments) and file persistence
//! - Background ramp executor with its run state machine
//! - Temperature safety interlock
//!
//! The executor and the safety monitor are independent: a
//! monitor trip de-energizes the supply through its own path but does not
//! stop a running executor. Whoever drives the acquisition loop is expected
//! to call [`executor::Executor::stop`] when
//! [`safety::SafetyMonitor::check_limits`] returns `false`.

#![deny(unsafe_code)]

pub mod executor;
pub mod safety;
pub mod traits;
pub mod trajectory;
