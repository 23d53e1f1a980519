use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use taskpilot_core::{
    models::{FailureKind, TaskStatus},
    traits::TaskRepository,
    BackoffPolicy,
};
use taskpilot_dispatcher::{RecoveryService, RetryPolicy};
use taskpilot_infrastructure::InMemoryTaskRepository;
use taskpilot_testing_utils::TaskBuilder;

fn policy() -> RetryPolicy {
    RetryPolicy::new(BackoffPolicy::new(
        Duration::from_secs(5),
        Duration::from_secs(60),
        0.0,
    ))
}

#[tokio::test]
async fn test_in_flight_tasks_are_requeued_or_failed() {
    let repo = Arc::new(InMemoryTaskRepository::new());
    let running = TaskBuilder::new()
        .with_type("ai_call", "chat")
        .with_status(TaskStatus::Running)
        .with_max_retries(3)
        .build();
    let acknowledged = TaskBuilder::new()
        .with_type("ai_call", "chat")
        .with_status(TaskStatus::Acknowledged)
        .with_max_retries(2)
        .with_retry_count(2)
        .build();
    let pending = TaskBuilder::new().with_type("ai_call", "chat").build();
    for task in [&running, &acknowledged, &pending] {
        repo.create(task).await.unwrap();
    }

    let before = Utc::now();
    let report = RecoveryService::new(repo.clone(), policy())
        .recover_interrupted()
        .await
        .unwrap();
    assert_eq!(report.requeued, vec![running.id.clone()]);
    assert_eq!(report.failed, vec![acknowledged.id.clone()]);
    assert!(report.errors.is_empty());
    assert_eq!(report.total(), 2);

    let requeued = repo.get(&running.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, TaskStatus::Pending);
    assert_eq!(requeued.retry_count, 1);
    assert_eq!(
        requeued.last_attempt_error.map(|e| e.kind),
        Some(FailureKind::Interrupted)
    );
    assert!(requeued
        .not_before
        .is_some_and(|at| at >= before + chrono::Duration::seconds(5)));

    let failed = repo.get(&acknowledged.id).await.unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error.map(|e| e.kind), Some(FailureKind::Interrupted));

    let untouched = repo.get(&pending.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_recovery_with_nothing_in_flight() {
    let repo = Arc::new(InMemoryTaskRepository::new());
    let report = RecoveryService::new(repo, policy())
        .recover_interrupted()
        .await
        .unwrap();
    assert_eq!(report.total(), 0);
}
