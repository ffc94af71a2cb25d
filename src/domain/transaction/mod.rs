//! Transaction aggregate

pub mod model;
pub mod store;

pub use model::{Transaction, TransactionStatus};
pub use store::TransactionStore;
