pub mod connection;
pub mod memory;
pub mod migrations;
pub mod sql;
pub mod store;

pub use connection::{connect, DbPool};
pub use memory::MemoryStore;
pub use sql::SqlStore;
pub use store::{Store, StoreError};
