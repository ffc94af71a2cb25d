//! Charge Point aggregate
//!
//! The charge point entity, its connectors, and the process-local store the
//! OCPP handlers update.

pub mod model;
pub mod store;

pub use model::{ChargePoint, Connector, ConnectorStatus, StatusChange};
pub use store::{BootInfo, ChargePointStore};
