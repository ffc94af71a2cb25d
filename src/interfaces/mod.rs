//! External interfaces
//!
//! - `ws`: charge point WebSocket server and connection management
//! - `http`: operational HTTP surface (health, introspection, metrics)

pub mod http;
pub mod ws;
