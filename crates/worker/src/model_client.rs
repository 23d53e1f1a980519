use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use taskpilot_core::{models::Endpoint, SchedulerError, SchedulerResult};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub model: Option<String>,
    pub total_tokens: Option<u64>,
}

/// AI 模型调用接口
///
/// 实现只负责单个端点上的一次请求，端点选择与重试由网关负责。
/// 请求参数不合法（HTTP 400/422）应返回 [`SchedulerError::Validation`]，
/// 网关不会对此类错误重试；其余失败返回网络错误，计入端点健康统计。
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        endpoint: &Endpoint,
        request: &ChatRequest,
    ) -> SchedulerResult<ChatResponse>;
}

/// OpenAI 兼容的 `/chat/completions` 客户端
#[derive(Clone, Default)]
pub struct OpenAiCompatibleClient {
    client: Client,
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Deserialize)]
struct CompletionReply {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    total_tokens: Option<u64>,
}

impl OpenAiCompatibleClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatibleClient {
    async fn complete(
        &self,
        endpoint: &Endpoint,
        request: &ChatRequest,
    ) -> SchedulerResult<ChatResponse> {
        let model = endpoint.model.as_deref().ok_or_else(|| {
            SchedulerError::Configuration(format!("端点 {} 未配置模型", endpoint.name))
        })?;
        let url = format!("{}/chat/completions", endpoint.base_url);
        debug!("调用模型 {} @ {}", model, endpoint.name);

        let mut builder = self.client.post(&url).json(&CompletionBody {
            model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        });
        if let Some(credential) = &endpoint.credential {
            builder = builder.bearer_auth(credential);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| SchedulerError::Network(format!("请求 {url} 失败: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                    SchedulerError::Validation(format!("模型拒绝请求 ({status}): {snippet}"))
                }
                _ => SchedulerError::Network(format!("模型端点返回 {status}: {snippet}")),
            });
        }

        let reply: CompletionReply = response
            .json()
            .await
            .map_err(|e| SchedulerError::Network(format!("解析模型响应失败: {e}")))?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| SchedulerError::Network("模型响应中没有 choices".to_string()))?;

        Ok(ChatResponse {
            content,
            model: reply.model.or_else(|| Some(model.to_string())),
            total_tokens: reply.usage.and_then(|u| u.total_tokens),
        })
    }
}
