//! Application events
//!
//! Event types are defined in `domain::events`. The bounded mailbox that
//! carries them to the consumer lives here.

pub mod event_bus;

pub use crate::domain::events::{DomainEvent, EventMessage};

pub use event_bus::{create_event_bus, EventBus, EventBusStats, SharedEventBus};
