use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use taskpilot_core::{config::RetentionConfig, traits::TaskRepository, SchedulerResult};
use tokio::time::interval;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub purged: u64,
    pub duration_ms: u64,
}

/// 数据清理服务
///
/// 定期删除超过保留期的终态任务，防止数据库无限增长
pub struct CleanupService {
    task_repository: Arc<dyn TaskRepository>,
    config: RetentionConfig,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    cleanup_handle: Option<tokio::task::JoinHandle<()>>,
}

impl CleanupService {
    pub fn new(task_repository: Arc<dyn TaskRepository>, config: RetentionConfig) -> Self {
        Self {
            task_repository,
            config,
            shutdown_tx: None,
            cleanup_handle: None,
        }
    }

    /// 启动清理服务
    pub async fn start(&mut self) -> SchedulerResult<()> {
        if !self.config.enabled {
            info!("Cleanup service is disabled");
            return Ok(());
        }

        info!("Starting cleanup service with config: {:?}", self.config);

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let task_repository = self.task_repository.clone();
        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            let mut cleanup_interval = interval(Duration::from_secs(config.interval_seconds));

            loop {
                tokio::select! {
                    _ = cleanup_interval.tick() => {
                        if let Err(e) = Self::perform_cleanup(&task_repository, &config).await {
                            error!("Cleanup failed: {}", e);
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("Cleanup service shutdown requested");
                        break;
                    }
                }
            }
        });

        self.cleanup_handle = Some(handle);
        Ok(())
    }

    /// 停止清理服务
    pub async fn stop(&mut self) -> SchedulerResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if let Some(handle) = self.cleanup_handle.take() {
            if let Err(e) = handle.await {
                warn!("Error waiting for cleanup service to stop: {}", e);
            }
        }

        info!("Cleanup service stopped");
        Ok(())
    }

    /// 执行一次清理操作
    pub async fn cleanup_once(&self) -> SchedulerResult<CleanupStats> {
        Self::perform_cleanup(&self.task_repository, &self.config).await
    }

    async fn perform_cleanup(
        task_repository: &Arc<dyn TaskRepository>,
        config: &RetentionConfig,
    ) -> SchedulerResult<CleanupStats> {
        let start_time = std::time::Instant::now();
        let cutoff = Utc::now() - chrono::Duration::hours(config.terminal_retention_hours);

        let purged = task_repository.purge_terminal(cutoff).await?;
        let stats = CleanupStats {
            purged,
            duration_ms: start_time.elapsed().as_millis() as u64,
        };

        if purged > 0 {
            info!(
                "清理完成: 删除 {} 个终态任务，耗时 {}ms",
                stats.purged, stats.duration_ms
            );
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryTaskRepository;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use taskpilot_testing_utils::TaskBuilder;

    async fn finished_at(repo: &dyn TaskRepository, hours_ago: i64) -> String {
        let task = TaskBuilder::new().build();
        repo.create(&task).await.unwrap();
        let at = Utc::now() - ChronoDuration::hours(hours_ago);
        repo.acknowledge(&task.id, at).await.unwrap();
        repo.mark_running(&task.id, at).await.unwrap();
        repo.mark_completed(&task.id, json!({}), at).await.unwrap();
        task.id
    }

    #[tokio::test]
    async fn test_cleanup_once_keeps_recent_tasks() {
        let repo: Arc<dyn TaskRepository> = Arc::new(InMemoryTaskRepository::new());
        let old = finished_at(repo.as_ref(), 48).await;
        let recent = finished_at(repo.as_ref(), 1).await;
        let pending = TaskBuilder::new().build();
        repo.create(&pending).await.unwrap();

        let config = RetentionConfig {
            terminal_retention_hours: 24,
            ..Default::default()
        };
        let service = CleanupService::new(repo.clone(), config);
        let stats = service.cleanup_once().await.unwrap();

        assert_eq!(stats.purged, 1);
        assert!(repo.get(&old).await.unwrap().is_none());
        assert!(repo.get(&recent).await.unwrap().is_some());
        assert!(repo.get(&pending.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let repo: Arc<dyn TaskRepository> = Arc::new(InMemoryTaskRepository::new());
        let old = finished_at(repo.as_ref(), 400).await;

        let mut service = CleanupService::new(repo.clone(), RetentionConfig::default());
        service.start().await.unwrap();
        // interval 首次 tick 立即触发
        tokio::time::sleep(Duration::from_millis(50)).await;
        service.stop().await.unwrap();

        assert!(repo.get(&old).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disabled_service_does_not_spawn() {
        let repo: Arc<dyn TaskRepository> = Arc::new(InMemoryTaskRepository::new());
        let config = RetentionConfig {
            enabled: false,
            ..Default::default()
        };
        let mut service = CleanupService::new(repo, config);
        service.start().await.unwrap();
        assert!(service.cleanup_handle.is_none());
        service.stop().await.unwrap();
    }
}
