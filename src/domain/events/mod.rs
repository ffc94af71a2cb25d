//! Domain events
//!
//! Event types that represent facts about what happened in the gateway.
//! The bounded mailbox that carries them lives in `application::events`.

pub mod types;

pub use types::{
    AuthorizationEvent, BootNotificationEvent, ChargePointConnectedEvent,
    ChargePointDisconnectedEvent, ConnectionErrorEvent, ConnectorStatusChangedEvent, DomainEvent,
    EventMessage, HeartbeatEvent, MeterValuesEvent, TransactionStartedEvent,
    TransactionStoppedEvent,
};
