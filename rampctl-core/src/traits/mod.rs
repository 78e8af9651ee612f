//! Hardware abstraction traits
//!
//! These traits define the interface between the control logic and the
//! concrete supply implementations (analog-programmed, SCPI, simulated).

pub mod power;

pub use power::{PowerSource, PowerSourceError, PowerSourceStatus, SupplyCommand};
