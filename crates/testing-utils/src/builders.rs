//! Test data builders for creating test entities

use chrono::{DateTime, Utc};
use serde_json::Value;
use taskpilot_core::models::{EndpointConfig, Task, TaskPriority, TaskStatus, TaskSubmission};

/// Builder for creating test Task entities
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self {
            task: Task::new("test_task", "ai_call", "chat", serde_json::json!({}), Utc::now()),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.task.id = id.to_string();
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.task.name = name.to_string();
        self
    }

    pub fn with_type(mut self, task_type: &str, action: &str) -> Self {
        self.task.task_type = task_type.to_string();
        self.task.action = action.to_string();
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.task.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    pub fn with_depends_on(mut self, ids: &[&str]) -> Self {
        self.task.depends_on = ids.iter().map(|id| id.to_string()).collect();
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.task.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.task.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.task.max_retries = max_retries;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.task.retry_count = retry_count;
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.task.expires_at = Some(expires_at);
        self
    }

    pub fn with_not_before(mut self, not_before: DateTime<Utc>) -> Self {
        self.task.not_before = Some(not_before);
        self
    }

    pub fn with_callback(mut self, url: &str) -> Self {
        self.task.callback_url = Some(url.to_string());
        self.task.notify_on_complete = true;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.task.created_at = created_at;
        self.task.updated_at = created_at;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for control-plane submissions
pub struct SubmissionBuilder {
    submission: TaskSubmission,
}

impl SubmissionBuilder {
    pub fn new(task_type: &str, action: &str) -> Self {
        Self {
            submission: TaskSubmission::new(task_type, action, serde_json::json!({})),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.submission.name = Some(name.to_string());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.submission.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.submission.priority = Some(priority);
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.submission.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn with_depends_on(mut self, ids: &str) -> Self {
        self.submission.depends_on = Some(ids.to_string());
        self
    }

    pub fn with_callback(mut self, url: &str) -> Self {
        self.submission.callback_url = Some(url.to_string());
        self.submission.notify_on_complete = true;
        self
    }

    pub fn with_schedule(mut self, schedule_seconds: u64) -> Self {
        self.submission.schedule_seconds = Some(schedule_seconds);
        self
    }

    pub fn with_expires_in(mut self, expires_in_seconds: u64) -> Self {
        self.submission.expires_in_seconds = Some(expires_in_seconds);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.submission.max_retries = Some(max_retries);
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.submission.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn build(self) -> TaskSubmission {
        self.submission
    }
}

/// Builder for endpoint registrations
pub struct EndpointConfigBuilder {
    config: EndpointConfig,
}

impl EndpointConfigBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            config: EndpointConfig {
                name: name.to_string(),
                base_url: format!("https://{name}.example.com/v1"),
                credential: Some(format!("key-{name}")),
                credential_env: None,
                model: Some("test-model".to_string()),
                priority: 1,
                max_requests_per_minute: 600,
                timeout_seconds: 5,
            },
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.config.priority = priority;
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.config.base_url = base_url.to_string();
        self
    }

    pub fn with_rate_limit(mut self, max_requests_per_minute: u32) -> Self {
        self.config.max_requests_per_minute = max_requests_per_minute;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.config.timeout_seconds = timeout_seconds;
        self
    }

    pub fn build(self) -> EndpointConfig {
        self.config
    }
}
