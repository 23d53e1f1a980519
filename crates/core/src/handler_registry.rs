use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{traits::TaskHandler, SchedulerError, SchedulerResult};

/// 通配动作：匹配该类型下的任意 action
pub const ANY_ACTION: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HandlerKey {
    task_type: String,
    action: String,
}

impl HandlerKey {
    fn new(task_type: &str, action: &str) -> Self {
        Self {
            task_type: task_type.to_string(),
            action: action.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerInfo {
    pub task_type: String,
    pub action: String,
    pub name: String,
    pub description: String,
}

/// 按 `(task_type, action)` 注册的处理器表
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<HandlerKey, Arc<dyn TaskHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, task_type: &str, action: &str, handler: Arc<dyn TaskHandler>) {
        info!(
            "注册任务处理器: {} -> {}/{}",
            handler.name(),
            task_type,
            action
        );
        let mut registry = self.handlers.write().await;
        registry.insert(HandlerKey::new(task_type, action), handler);
    }

    /// 注册处理该类型全部 action 的处理器
    pub async fn register_any(&self, task_type: &str, handler: Arc<dyn TaskHandler>) {
        self.register(task_type, ANY_ACTION, handler).await;
    }

    pub async fn unregister(&self, task_type: &str, action: &str) -> bool {
        let mut registry = self.handlers.write().await;
        registry
            .remove(&HandlerKey::new(task_type, action))
            .is_some()
    }

    /// 精确匹配优先，其次是通配动作
    pub async fn resolve(&self, task_type: &str, action: &str) -> Option<Arc<dyn TaskHandler>> {
        let registry = self.handlers.read().await;
        let handler = registry
            .get(&HandlerKey::new(task_type, action))
            .or_else(|| registry.get(&HandlerKey::new(task_type, ANY_ACTION)))
            .cloned();
        if handler.is_none() {
            debug!("未找到处理器: {}/{}", task_type, action);
        }
        handler
    }

    pub async fn supports(&self, task_type: &str, action: &str) -> bool {
        self.resolve(task_type, action).await.is_some()
    }

    pub async fn task_types(&self) -> Vec<String> {
        let registry = self.handlers.read().await;
        let mut types: Vec<String> = registry.keys().map(|k| k.task_type.clone()).collect();
        types.sort();
        types.dedup();
        types
    }

    pub async fn list(&self) -> Vec<HandlerInfo> {
        let registry = self.handlers.read().await;
        let mut infos: Vec<HandlerInfo> = registry
            .iter()
            .map(|(key, handler)| HandlerInfo {
                task_type: key.task_type.clone(),
                action: key.action.clone(),
                name: handler.name().to_string(),
                description: handler.description().to_string(),
            })
            .collect();
        infos.sort_by(|a, b| (&a.task_type, &a.action).cmp(&(&b.task_type, &b.action)));
        infos
    }

    /// 启动时校验所有可达任务类型都已注册处理器
    pub async fn validate_coverage(&self, required_types: &[String]) -> SchedulerResult<()> {
        let registered = self.task_types().await;
        let missing: Vec<&str> = required_types
            .iter()
            .filter(|t| !registered.contains(t))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(SchedulerError::Configuration(format!(
                "以下任务类型没有注册处理器: {}",
                missing.join(", ")
            )))
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{HandlerContext, HandlerOutcome};
    use async_trait::async_trait;
    use serde_json::json;

    struct Named(&'static str);

    #[async_trait]
    impl TaskHandler for Named {
        async fn execute(&self, _context: &HandlerContext) -> SchedulerResult<HandlerOutcome> {
            Ok(HandlerOutcome::Completed(json!(self.0)))
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    #[tokio::test]
    async fn test_exact_action_wins_over_wildcard() {
        let registry = HandlerRegistry::new();
        registry
            .register_any("market_analysis", Arc::new(Named("generic")))
            .await;
        registry
            .register("market_analysis", "technical", Arc::new(Named("technical")))
            .await;

        let exact = registry.resolve("market_analysis", "technical").await.unwrap();
        let fallback = registry.resolve("market_analysis", "summary").await.unwrap();
        assert_eq!(exact.name(), "technical");
        assert_eq!(fallback.name(), "generic");
        assert!(registry.resolve("ai_call", "chat").await.is_none());
    }

    #[tokio::test]
    async fn test_validate_coverage_lists_missing_types() {
        let registry = HandlerRegistry::new();
        registry.register_any("ai_call", Arc::new(Named("ai"))).await;

        assert!(registry
            .validate_coverage(&["ai_call".to_string()])
            .await
            .is_ok());
        let err = registry
            .validate_coverage(&["ai_call".to_string(), "storage_save".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("storage_save"));
    }
}
