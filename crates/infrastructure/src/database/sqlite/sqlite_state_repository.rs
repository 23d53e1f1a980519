use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use taskpilot_core::{traits::StateRepository, SchedulerResult};

/// 基于 `system_state` 表的键值状态存储
pub struct SqliteStateRepository {
    pool: SqlitePool,
}

impl SqliteStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateRepository for SqliteStateRepository {
    async fn put(&self, namespace: &str, key: &str, value: &Value) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO system_state (namespace, key, value, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(namespace, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(namespace)
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> SchedulerResult<Option<Value>> {
        let row = sqlx::query("SELECT value FROM system_state WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("value")?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn load_namespace(&self, namespace: &str) -> SchedulerResult<Vec<(String, Value)>> {
        let rows = sqlx::query("SELECT key, value FROM system_state WHERE namespace = ? ORDER BY key")
            .bind(namespace)
            .fetch_all(&self.pool)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key")?;
            let raw: String = row.try_get("value")?;
            entries.push((key, serde_json::from_str(&raw)?));
        }
        Ok(entries)
    }

    async fn delete(&self, namespace: &str, key: &str) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM system_state WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
