//! Operational HTTP API
//!
//! - `handlers`: health, connection introspection, commands, metrics
//! - `router`: route table and middleware

pub mod common;
pub mod handlers;
pub mod router;

pub use common::ApiResponse;
pub use router::{create_api_router, ApiState};
