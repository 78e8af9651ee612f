//! Power supply and sensor implementations
//!
//! This crate provides concrete implementations of the traits defined
//! in rampctl-core:
//!
//! - Simulated programmable supply with a resistive load
//! - Retrying wrapper for any power source
//! - Simulated thermocouples heated by delivered power

#![deny(unsafe_code)]

pub mod sensor;
pub mod supply;
