use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use taskpilot_core::{
    models::{Task, TaskFilter, TaskId, TaskStatus},
    traits::{TaskRepository, TaskTransition},
    SchedulerError, SchedulerResult,
};
use tracing::{debug, instrument, warn};

/// 乐观锁冲突时的最大重试次数
const MAX_CAS_ATTEMPTS: usize = 5;
const STATUS_QUERY_BATCH: usize = 500;

/// SQLite 任务存储
///
/// 任务以 JSON 形式存放在 `data` 列，调度相关字段另存为带索引的列。
/// 更新通过 `version` 列做比较并交换，保证同一任务的转换只会成功一次。
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn encode(task: &Task) -> SchedulerResult<String> {
        Ok(serde_json::to_string(task)?)
    }

    fn decode(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<Task> {
        let data: String = row.try_get("data")?;
        Ok(serde_json::from_str(&data)?)
    }
}

fn millis(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(|t| t.timestamp_millis())
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn create(&self, task: &Task) -> SchedulerResult<Task> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, task_type, status, priority, callback_status,
                               expires_at, completed_at, version, data, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.task_type)
        .bind(task.status.as_str())
        .bind(task.priority.level())
        .bind(task.callback_status.as_str())
        .bind(millis(task.expires_at))
        .bind(millis(task.completed_at))
        .bind(Self::encode(task)?)
        .bind(task.created_at.timestamp_millis())
        .bind(task.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        debug!("任务已保存: {} ({})", task.id, task.name);
        Ok(task.clone())
    }

    async fn get(&self, id: &str) -> SchedulerResult<Option<Task>> {
        let row = sqlx::query("SELECT data FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT data FROM tasks WHERE 1 = 1");

        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(task_type) = &filter.task_type {
            query.push(" AND task_type = ").push_bind(task_type.clone());
        }
        if let Some(callback_status) = filter.callback_status {
            query
                .push(" AND callback_status = ")
                .push_bind(callback_status.as_str());
        }
        if let Some(cutoff) = filter.expires_before {
            query
                .push(" AND expires_at IS NOT NULL AND expires_at <= ")
                .push_bind(cutoff.timestamp_millis());
        }
        query.push(" ORDER BY priority DESC, seq ASC");

        // 标签保存在 JSON 中，只能在解码后过滤
        if filter.tag.is_none() {
            if let Some(limit) = filter.limit {
                query.push(" LIMIT ").push_bind(limit as i64);
            }
        }

        let rows = query.build().fetch_all(&self.pool).await?;
        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            let task = Self::decode(row)?;
            if filter.matches(&task) {
                tasks.push(task);
            }
        }
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    async fn statuses(&self, ids: &[TaskId]) -> SchedulerResult<HashMap<TaskId, TaskStatus>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut statuses = HashMap::with_capacity(ids.len());
        // 分批查询，避免超出 SQLite 绑定参数上限
        for chunk in ids.chunks(STATUS_QUERY_BATCH) {
            let mut query: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT id, status FROM tasks WHERE id IN (");
            let mut separated = query.separated(", ");
            for id in chunk {
                separated.push_bind(id.clone());
            }
            separated.push_unseparated(")");

            for row in query.build().fetch_all(&self.pool).await? {
                let id: String = row.try_get("id")?;
                let status: String = row.try_get("status")?;
                statuses.insert(id, status.parse()?);
            }
        }
        Ok(statuses)
    }

    #[instrument(skip(self, transition))]
    async fn update_with(
        &self,
        id: &str,
        transition: TaskTransition<'_>,
    ) -> SchedulerResult<Task> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let row = sqlx::query("SELECT data, version FROM tasks WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })?;

            let version: i64 = row.try_get("version")?;
            let mut task = Self::decode(&row)?;
            transition(&mut task)?;

            let result = sqlx::query(
                r#"
                UPDATE tasks
                SET status = ?, priority = ?, callback_status = ?, expires_at = ?,
                    completed_at = ?, data = ?, updated_at = ?, version = version + 1
                WHERE id = ? AND version = ?
                "#,
            )
            .bind(task.status.as_str())
            .bind(task.priority.level())
            .bind(task.callback_status.as_str())
            .bind(millis(task.expires_at))
            .bind(millis(task.completed_at))
            .bind(Self::encode(&task)?)
            .bind(task.updated_at.timestamp_millis())
            .bind(id)
            .bind(version)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(task);
            }
            debug!("任务 {} 版本冲突，第 {} 次重试", id, attempt);
        }

        warn!("任务 {} 更新冲突次数过多", id);
        Err(SchedulerError::DatabaseOperation(format!(
            "任务 {id} 并发更新冲突"
        )))
    }

    async fn purge_terminal(&self, completed_before: DateTime<Utc>) -> SchedulerResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE status IN ('completed', 'failed', 'cancelled', 'expired')
              AND callback_status != 'pending'
              AND completed_at IS NOT NULL
              AND completed_at < ?
            "#,
        )
        .bind(completed_before.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
