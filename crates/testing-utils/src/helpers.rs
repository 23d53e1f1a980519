//! Test helper utilities for asynchronous assertions

use std::future::Future;
use std::time::{Duration, Instant};

use chrono::Utc;
use taskpilot_core::{
    models::{Task, TaskStatus},
    traits::TaskRepository,
};
use tokio::time::sleep;

/// Poll a condition until it holds or the timeout elapses
pub async fn wait_until<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition().await
}

/// Poll the store until the task reaches `status`
pub async fn wait_for_status(
    repo: &dyn TaskRepository,
    id: &str,
    status: TaskStatus,
    timeout: Duration,
) -> Option<Task> {
    let start = Instant::now();
    loop {
        if let Ok(Some(task)) = repo.get(id).await {
            if task.status == status {
                return Some(task);
            }
        }
        if start.elapsed() >= timeout {
            return None;
        }
        sleep(Duration::from_millis(20)).await;
    }
}

/// Seconds offset from now, for readable timestamps in tests
pub fn seconds_from_now(seconds: i64) -> chrono::DateTime<Utc> {
    Utc::now() + chrono::Duration::seconds(seconds)
}
