pub mod credentials;
pub mod ocpp_frame;
pub mod shutdown;
