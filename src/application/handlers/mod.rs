//! OCPP message handlers

pub mod ocpp_v16;
mod ocpp_v16_processor;

pub use ocpp_v16_processor::{OcppV16Processor, ProcessorSettings, ProcessorStats};
