//! Minimal client for the Anthropic Messages API.
//!
//! Non-streaming completions with tool definitions, which is all a character
//! backend needs.

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const API_BASE: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Errors that can occur when talking to Claude.
#[derive(Debug, Error)]
pub enum Error {
    #[error("API key not configured")]
    NoApiKey,

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Claude API client.
#[derive(Clone)]
pub struct Claude {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl std::fmt::Debug for Claude {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Claude")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl Claude {
    /// Create a client with the given API key.
    ///
    /// The HTTP timeout is generous; the dispatcher enforces its own
    /// per-attempt deadline on top.
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Create a client from the ANTHROPIC_API_KEY environment variable.
    pub fn from_env() -> Result<Self, Error> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| Error::NoApiKey)?;
        Ok(Self::new(api_key))
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send a completion request and return the full response.
    pub async fn complete(&self, request: &Request) -> Result<Response, Error> {
        let api_request = self.build_api_request(request);
        let headers = self.build_headers()?;

        let response = self
            .client
            .post(format!("{API_BASE}/messages"))
            .headers(headers)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status,
                message: body,
            });
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;

        Ok(parse_response(api_response))
    }

    fn build_headers(&self) -> Result<HeaderMap, Error> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key)
                .map_err(|e| Error::Config(format!("Invalid API key: {e}")))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        Ok(headers)
    }

    pub(crate) fn build_api_request(&self, request: &Request) -> ApiRequest {
        let messages = request
            .messages
            .iter()
            .map(|m| ApiMessage {
                role: match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                content: m.content.clone(),
            })
            .collect();

        ApiRequest {
            model: request.model.clone().unwrap_or_else(|| self.model.clone()),
            max_tokens: request.max_tokens,
            system: request.system.clone(),
            messages,
            temperature: request.temperature,
            tools: request.tools.clone(),
            tool_choice: request.tool_choice.as_ref().map(|tc| match tc {
                ToolChoice::Auto => ApiToolChoice {
                    r#type: "auto",
                    name: None,
                },
                ToolChoice::Any => ApiToolChoice {
                    r#type: "any",
                    name: None,
                },
                ToolChoice::Tool { name } => ApiToolChoice {
                    r#type: "tool",
                    name: Some(name.clone()),
                },
            }),
        }
    }
}

fn parse_response(api_response: ApiResponse) -> Response {
    let content = api_response
        .content
        .into_iter()
        .filter_map(|c| match c {
            ApiContent::Text { text } => Some(ContentBlock::Text { text }),
            ApiContent::ToolUse { id, name, input } => Some(ContentBlock::ToolUse { id, name, input }),
            ApiContent::Other => None,
        })
        .collect();

    let stop_reason = match api_response.stop_reason.as_deref() {
        Some("max_tokens") => StopReason::MaxTokens,
        Some("stop_sequence") => StopReason::StopSequence,
        Some("tool_use") => StopReason::ToolUse,
        Some("refusal") => StopReason::Refusal,
        _ => StopReason::EndTurn,
    };

    Response {
        id: api_response.id,
        model: api_response.model,
        content,
        stop_reason,
        usage: Usage {
            input_tokens: api_response.usage.input_tokens,
            output_tokens: api_response.usage.output_tokens,
        },
    }
}

// ============================================================================
// Public types
// ============================================================================

/// A completion request.
#[derive(Debug, Clone)]
pub struct Request {
    pub model: Option<String>,
    pub max_tokens: usize,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub tools: Option<Vec<Tool>>,
    pub tool_choice: Option<ToolChoice>,
}

impl Request {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            model: None,
            max_tokens: 1024,
            system: None,
            messages,
            temperature: None,
            tools: None,
            tool_choice: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_tool_choice(mut self, tool_choice: ToolChoice) -> Self {
        self.tool_choice = Some(tool_choice);
        self
    }
}

/// A message in the conversation.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

/// A block of content in a message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

/// A tool definition.
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// How the model should choose tools.
#[derive(Debug, Clone)]
pub enum ToolChoice {
    Auto,
    Any,
    Tool { name: String },
}

/// A completion response.
#[derive(Debug, Clone)]
pub struct Response {
    pub id: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

impl Response {
    /// All text blocks concatenated.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Input of the first call to the named tool.
    pub fn tool_input(&self, tool: &str) -> Option<&serde_json::Value> {
        self.content.iter().find_map(|c| match c {
            ContentBlock::ToolUse { name, input, .. } if name == tool => Some(input),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    Refusal,
}

#[derive(Debug, Clone, Copy)]
pub struct Usage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

// ============================================================================
// API wire types
// ============================================================================

#[derive(Debug, Serialize)]
pub(crate) struct ApiRequest {
    pub(crate) model: String,
    pub(crate) max_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) system: Option<String>,
    pub(crate) messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) tool_choice: Option<ApiToolChoice>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ApiMessage {
    pub(crate) role: &'static str,
    pub(crate) content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ApiToolChoice {
    pub(crate) r#type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    id: String,
    model: String,
    content: Vec<ApiContent>,
    stop_reason: Option<String>,
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContent {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: usize,
    output_tokens: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_with_model() {
        let client = Claude::new("test-key").with_model("claude-3-opus");
        assert_eq!(client.model(), "claude-3-opus");
        assert_eq!(Claude::new("test-key").model(), DEFAULT_MODEL);
    }

    #[test]
    fn test_api_request_shape() {
        let request = Request::new(vec![Message::user("Hello")])
            .with_system("You are Sally")
            .with_tool_choice(ToolChoice::Tool {
                name: "respond".to_string(),
            });
        let api = Claude::new("k").build_api_request(&request);
        let json = serde_json::to_value(&api).unwrap();

        assert_eq!(json["model"], DEFAULT_MODEL);
        assert_eq!(json["system"], "You are Sally");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"][0]["type"], "text");
        assert_eq!(json["tool_choice"]["type"], "tool");
        assert_eq!(json["tool_choice"]["name"], "respond");
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn test_parse_response_skips_unknown_blocks() {
        let raw = serde_json::json!({
            "id": "msg_1",
            "model": DEFAULT_MODEL,
            "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "Hello"},
                {"type": "tool_use", "id": "t1", "name": "respond", "input": {"content": "Hi"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        });
        let response = parse_response(serde_json::from_value(raw).unwrap());
        assert_eq!(response.content.len(), 2);
        assert_eq!(response.text(), "Hello");
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.tool_input("respond").unwrap()["content"], "Hi");
    }
}
