//! Domain layer
//!
//! Entities, stores and events that the OCPP handlers work against. Nothing
//! here knows about WebSockets or the wire format.

pub mod charge_point;
pub mod events;
pub mod ocpp;
pub mod transaction;

pub use charge_point::{BootInfo, ChargePoint, ChargePointStore, Connector, ConnectorStatus, StatusChange};
pub use events::{DomainEvent, EventMessage};
pub use ocpp::OcppVersion;
pub use transaction::{Transaction, TransactionStatus, TransactionStore};
