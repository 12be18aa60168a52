//! OCPP 1.6J payloads, split by which side initiates the exchange

pub mod central_system;
pub mod charge_point;

pub use central_system::*;
pub use charge_point::*;
