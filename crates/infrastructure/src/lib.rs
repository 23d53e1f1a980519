pub mod cleanup_service;
pub mod database;
pub mod in_memory;

pub use cleanup_service::{CleanupService, CleanupStats};
pub use database::{DatabaseManager, SqliteStateRepository, SqliteTaskRepository};
pub use in_memory::{InMemoryStateRepository, InMemoryTaskRepository};
