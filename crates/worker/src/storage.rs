use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use taskpilot_core::{SchedulerError, SchedulerResult};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// 内置文件存储目标的名称
pub const FILE_TARGET: &str = "file";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentFormat {
    #[default]
    Markdown,
    Json,
    Text,
}

impl ContentFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ContentFormat::Markdown => "md",
            ContentFormat::Json => "json",
            ContentFormat::Text => "txt",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaveRequest {
    pub title: String,
    pub content: String,
    pub format: ContentFormat,
    /// 可选子目录，不指定时按日期归档
    pub subdir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub target: String,
    pub location: String,
    pub bytes: usize,
}

/// 统一的存储目标接口
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn save(&self, request: &SaveRequest) -> SchedulerResult<StoredObject>;

    fn name(&self) -> &str;
}

/// 本地文件存储，按 `root/YYYYMMDD/标题_时间.扩展名` 组织
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn target_dir(&self, subdir: Option<&str>) -> SchedulerResult<PathBuf> {
        match subdir.map(str::trim).filter(|s| !s.is_empty()) {
            Some(subdir) => {
                let safe = safe_segment(subdir);
                if safe.is_empty() {
                    return Err(SchedulerError::Validation(format!("无效的子目录: {subdir}")));
                }
                Ok(self.root.join(safe))
            }
            None => Ok(self.root.join(Utc::now().format("%Y%m%d").to_string())),
        }
    }
}

/// 只保留字母数字、`-` 和 `_`，空格替换为下划线
fn safe_segment(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect::<String>()
        .trim()
        .replace(' ', "_")
        .chars()
        .take(50)
        .collect()
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn save(&self, request: &SaveRequest) -> SchedulerResult<StoredObject> {
        let dir = self.target_dir(request.subdir.as_deref())?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SchedulerError::Storage(format!("创建目录 {} 失败: {e}", dir.display())))?;

        let stem = match safe_segment(&request.title) {
            s if s.is_empty() => "report".to_string(),
            s => s,
        };
        let filename = format!(
            "{}_{}.{}",
            stem,
            Utc::now().format("%H%M%S%3f"),
            request.format.extension()
        );
        let path = dir.join(filename);

        let body = match request.format {
            ContentFormat::Markdown if !request.content.trim_start().starts_with('#') => {
                format!("# {}\n\n{}", request.title, request.content)
            }
            _ => request.content.clone(),
        };

        tokio::fs::write(&path, body.as_bytes())
            .await
            .map_err(|e| SchedulerError::Storage(format!("写入 {} 失败: {e}", path.display())))?;

        info!("已保存到文件: {}", path.display());
        Ok(StoredObject {
            target: FILE_TARGET.to_string(),
            location: path.display().to_string(),
            bytes: body.len(),
        })
    }

    fn name(&self) -> &str {
        FILE_TARGET
    }
}

/// 按名称查找存储目标
#[derive(Default)]
pub struct StorageRegistry {
    targets: RwLock<HashMap<String, Arc<dyn StorageBackend>>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, backend: Arc<dyn StorageBackend>) {
        debug!("注册存储目标: {}", backend.name());
        self.targets
            .write()
            .await
            .insert(backend.name().to_string(), backend);
    }

    pub async fn get(&self, name: &str) -> SchedulerResult<Arc<dyn StorageBackend>> {
        self.targets
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::Validation(format!("未知的存储目标: {name}")))
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.targets.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_segment_strips_path_characters() {
        assert_eq!(safe_segment("../etc/passwd"), "etcpasswd");
        assert_eq!(safe_segment(" BTC 日报 - 10/17 "), "BTC_日报_-_1017");
    }

    #[tokio::test]
    async fn test_file_storage_writes_titled_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let stored = storage
            .save(&SaveRequest {
                title: "Weekly Review".to_string(),
                content: "all good".to_string(),
                format: ContentFormat::Markdown,
                subdir: Some("reports".to_string()),
            })
            .await
            .unwrap();

        assert!(stored.location.contains("reports"));
        assert!(stored.location.ends_with(".md"));
        let written = tokio::fs::read_to_string(&stored.location).await.unwrap();
        assert_eq!(written, "# Weekly Review\n\nall good");
        assert_eq!(stored.bytes, written.len());
    }

    #[tokio::test]
    async fn test_registry_rejects_unknown_target() {
        let registry = StorageRegistry::new();
        registry
            .register(Arc::new(FileStorage::new("/tmp/unused")))
            .await;
        assert!(registry.get("file").await.is_ok());
        assert!(matches!(
            registry.get("notion").await,
            Err(SchedulerError::Validation(_))
        ));
    }
}
