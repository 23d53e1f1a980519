pub mod handler;
pub mod notifier;
pub mod repository;

pub use handler::{HandlerContext, HandlerOutcome, TaskHandler};
pub use notifier::{CallbackNotifier, CallbackPayload};
pub use repository::{StateRepository, TaskRepository, TaskTransition};
