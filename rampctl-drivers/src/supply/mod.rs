//! Power supply implementations

pub mod retry;
pub mod simulated;

pub use retry::Retrying;
pub use simulated::{SimulatedSupply, SimulatedSupplyConfig};
