//! Sensor implementations

pub mod thermal;

pub use thermal::{ThermalBench, ThermocoupleConfig};
