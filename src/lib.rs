//! # OCPP Gateway
//!
//! WebSocket gateway that terminates OCPP 1.6 JSON connections from charge
//! points and turns their traffic into a stream of domain events.
//!
//! ## Architecture
//!
//! - **domain**: Charge point and transaction entities, in-memory stores, events
//! - **application**: OCPP 1.6 handlers, pending outbound calls, command sender,
//!   connection registry, event bus
//! - **interfaces**: OCPP WebSocket server and the operational HTTP API
//! - **support**: Wire frames, credentials, graceful shutdown
//! - **server**: Wires everything together and owns the lifecycle

pub mod application;
pub mod config;
pub mod domain;
pub mod interfaces;
pub mod server;
pub mod support;

pub use config::{default_config_path, resolve_config_path, AppConfig, ConfigError};

pub use application::{
    create_event_bus, CommandError, CommandSender, EventBus, SharedCommandSender, SharedEventBus,
};
pub use domain::{DomainEvent, EventMessage, OcppVersion};
pub use server::{init_tracing, ServerError, ServerHandle, ServerOptions};
