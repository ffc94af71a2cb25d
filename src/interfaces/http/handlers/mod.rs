pub mod commands;
pub mod connections;
pub mod health;
pub mod metrics;
