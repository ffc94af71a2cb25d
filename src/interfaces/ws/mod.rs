//! WebSocket interfaces
//!
//! - `connection`: per charge point connection state and send queue
//! - `manager`: connection table, upgrade checks and lifecycle events
//! - `ping`: global ping scheduler
//! - `negotiator`: OCPP subprotocol negotiation
//! - `dispatcher`: version routing to protocol handlers
//! - `ocpp_server`: TCP accept loop and per-connection tasks

pub mod connection;
pub mod dispatcher;
pub mod manager;
pub mod negotiator;
pub mod ocpp_server;
pub mod ping;

pub use connection::{Connection, ConnectionError, ConnectionSnapshot, ConnectionState, Outbound};
pub use dispatcher::{
    DispatchContext, DispatchError, MessageDispatcher, ProcessError, ProtocolHandler,
    SharedDispatcher,
};
pub use manager::{ConnectionManager, ManagerSettings, SharedConnectionManager, UpgradeRequest};
pub use negotiator::ProtocolNegotiator;
pub use ocpp_server::OcppServer;
pub use ping::{PingScheduler, PingStats};
