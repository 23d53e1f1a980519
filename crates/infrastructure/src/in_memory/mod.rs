//! 内存存储实现，用于 `database.url = "memory"` 和测试

mod state_repository;
mod task_repository;

pub use state_repository::InMemoryStateRepository;
pub use task_repository::InMemoryTaskRepository;
