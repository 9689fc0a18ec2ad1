use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider not configured: {0}")]
    NotConfigured(String),
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("rate limited")]
    RateLimited,
    #[error("request timed out")]
    Timeout,
    #[error("http error: {0}")]
    Http(String),
    #[error("parse error: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Timeout | ProviderError::RateLimited | ProviderError::Http(_) => true,
            ProviderError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Http(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Message model
// ---------------------------------------------------------------------------

/// One entry in the activation context. The system prompt travels
/// separately in [`ChatRequest`], matching the Anthropic Messages API.
#[derive(Debug, Clone)]
pub enum ChatMessage {
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        tool_calls: Vec<ToolCall>,
    },
    ToolResult {
        call_id: String,
        content: String,
        is_error: bool,
    },
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage::User {
            content: content.into(),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A tool offered to the model.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system: &'a str,
    pub messages: &'a [ChatMessage],
    pub tools: &'a [ToolSpec],
}

/// Either a final text, a batch of tool calls, or both (text preceding
/// the calls); plus token usage for budget accounting.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

// ---------------------------------------------------------------------------
// LlmProvider trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, request: ChatRequest<'_>) -> Result<ChatResponse, ProviderError>;

    /// Human-readable provider name (e.g. "anthropic").
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// AnthropicProvider
// ---------------------------------------------------------------------------

/// Anthropic Messages API with tool use.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".to_string(),
        }
    }

    /// Override the base URL (mock servers in tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_body(request: &ChatRequest<'_>) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|msg| match msg {
                ChatMessage::User { content } => serde_json::json!({
                    "role": "user",
                    "content": content,
                }),
                ChatMessage::Assistant {
                    content,
                    tool_calls,
                } => {
                    let mut blocks = Vec::new();
                    if let Some(text) = content {
                        blocks.push(serde_json::json!({ "type": "text", "text": text }));
                    }
                    for call in tool_calls {
                        blocks.push(serde_json::json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": call.arguments,
                        }));
                    }
                    serde_json::json!({ "role": "assistant", "content": blocks })
                }
                ChatMessage::ToolResult {
                    call_id,
                    content,
                    is_error,
                } => serde_json::json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": call_id,
                        "content": content,
                        "is_error": is_error,
                    }],
                }),
            })
            .collect();

        let mut body = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": messages,
        });
        if !request.system.is_empty() {
            body["system"] = serde_json::Value::String(request.system.to_string());
        }
        if !request.tools.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = serde_json::Value::Array(tools);
        }
        body
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
    usage: ApiUsage,
}

#[derive(Deserialize)]
struct ApiContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ApiUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat(&self, request: ChatRequest<'_>) -> Result<ChatResponse, ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::NotConfigured(
                "ANTHROPIC_API_KEY is not set".into(),
            ));
        }

        let body = Self::build_body(&request);
        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited);
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();
        for block in parsed.content {
            match block.block_type.as_str() {
                "text" => {
                    if let Some(t) = block.text {
                        text_parts.push(t);
                    }
                }
                "tool_use" => {
                    tool_calls.push(ToolCall {
                        id: block.id.unwrap_or_default(),
                        name: block.name.unwrap_or_default(),
                        arguments: block.input.unwrap_or(serde_json::Value::Null),
                    });
                }
                other => debug!(block_type = other, "ignoring unknown content block"),
            }
        }

        Ok(ChatResponse {
            text: if text_parts.is_empty() {
                None
            } else {
                Some(text_parts.join("\n"))
            },
            tool_calls,
            tokens_in: parsed.usage.input_tokens,
            tokens_out: parsed.usage.output_tokens,
        })
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

// ---------------------------------------------------------------------------
// ScriptedProvider — canned responses for tests
// ---------------------------------------------------------------------------

/// Pops one pre-loaded response per `chat` call; returns an error once
/// the script runs dry. Also counts calls so tests can assert retries.
#[derive(Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<ChatResponse, ProviderError>>>,
    calls: std::sync::atomic::AtomicU32,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(self, text: impl Into<String>) -> Self {
        self.push(Ok(ChatResponse {
            text: Some(text.into()),
            tool_calls: Vec::new(),
            tokens_in: 10,
            tokens_out: 10,
        }))
    }

    pub fn push_tool_call(self, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        let name = name.into();
        self.push(Ok(ChatResponse {
            text: None,
            tool_calls: vec![ToolCall {
                id: format!("call-{name}"),
                name,
                arguments,
            }],
            tokens_in: 10,
            tokens_out: 10,
        }))
    }

    pub fn push_error(self, error: ProviderError) -> Self {
        self.push(Err(error))
    }

    pub fn push(self, entry: Result<ChatResponse, ProviderError>) -> Self {
        self.script.lock().unwrap().push_back(entry);
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, _request: ChatRequest<'_>) -> Result<ChatResponse, ProviderError> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::NotConfigured("script exhausted".into())))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::RateLimited.is_retryable());
        assert!(ProviderError::Api {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(!ProviderError::Api {
            status: 400,
            message: String::new()
        }
        .is_retryable());
        assert!(!ProviderError::NotConfigured("x".into()).is_retryable());
    }

    #[test]
    fn body_includes_system_and_tools() {
        let messages = vec![ChatMessage::user("hello")];
        let tools = vec![ToolSpec {
            name: "hub_search".into(),
            description: "Search".into(),
            input_schema: serde_json::json!({"type": "object"}),
        }];
        let request = ChatRequest {
            model: "test-model",
            temperature: 0.5,
            max_tokens: 512,
            system: "be kind",
            messages: &messages,
            tools: &tools,
        };
        let body = AnthropicProvider::build_body(&request);
        assert_eq!(body["system"], "be kind");
        assert_eq!(body["tools"][0]["name"], "hub_search");
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn body_encodes_tool_round_trip() {
        let messages = vec![
            ChatMessage::user("go"),
            ChatMessage::Assistant {
                content: None,
                tool_calls: vec![ToolCall {
                    id: "t1".into(),
                    name: "hub_search".into(),
                    arguments: serde_json::json!({"q": "rust"}),
                }],
            },
            ChatMessage::ToolResult {
                call_id: "t1".into(),
                content: "results".into(),
                is_error: false,
            },
        ];
        let request = ChatRequest {
            model: "m",
            temperature: 0.0,
            max_tokens: 16,
            system: "",
            messages: &messages,
            tools: &[],
        };
        let body = AnthropicProvider::build_body(&request);
        assert_eq!(body["messages"][1]["content"][0]["type"], "tool_use");
        assert_eq!(body["messages"][2]["content"][0]["type"], "tool_result");
        assert_eq!(body["messages"][2]["content"][0]["tool_use_id"], "t1");
        assert!(body.get("system").is_none());
    }

    #[tokio::test]
    async fn scripted_provider_pops_in_order() {
        let provider = ScriptedProvider::new()
            .push_text("one")
            .push_error(ProviderError::Timeout);

        let req = ChatRequest {
            model: "m",
            temperature: 0.0,
            max_tokens: 16,
            system: "",
            messages: &[],
            tools: &[],
        };
        let first = provider.chat(req).await.unwrap();
        assert_eq!(first.text.as_deref(), Some("one"));

        let req = ChatRequest {
            model: "m",
            temperature: 0.0,
            max_tokens: 16,
            system: "",
            messages: &[],
            tools: &[],
        };
        assert!(matches!(
            provider.chat(req).await,
            Err(ProviderError::Timeout)
        ));
        assert_eq!(provider.call_count(), 2);
    }
}
