use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use taskpilot_core::{traits::StateRepository, SchedulerResult};
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct InMemoryStateRepository {
    entries: Arc<RwLock<BTreeMap<(String, String), Value>>>,
}

impl InMemoryStateRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateRepository for InMemoryStateRepository {
    async fn put(&self, namespace: &str, key: &str, value: &Value) -> SchedulerResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert((namespace.to_string(), key.to_string()), value.clone());
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> SchedulerResult<Option<Value>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn load_namespace(&self, namespace: &str) -> SchedulerResult<Vec<(String, Value)>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn delete(&self, namespace: &str, key: &str) -> SchedulerResult<bool> {
        let mut entries = self.entries.write().await;
        Ok(entries
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some())
    }
}
