pub mod commands;
pub mod events;
pub mod handlers;
pub mod pending;
pub mod registry;

// Re-export key types for convenience
pub use commands::{CommandError, CommandSender, SharedCommandSender};
pub use events::{create_event_bus, EventBus, EventBusStats, SharedEventBus};
pub use handlers::{OcppV16Processor, ProcessorSettings, ProcessorStats};
pub use pending::{PendingError, PendingRequests, SharedPendingRequests};
pub use registry::{
    ConnectionRegistry, InMemoryConnectionRegistry, RegistryError, SharedConnectionRegistry,
};
