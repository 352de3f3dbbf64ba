//! [`GenerativeBackend`] implementation on top of the Messages API.
//!
//! Every invocation is one non-streaming request. The system prompt carries
//! the character (instructions, traits, memory window) and the user turn
//! carries the capability request. The model is forced to reply through a
//! `respond` tool so content, selected option and mood come back structured.

use crate::client::{self, Claude, Message, Request, StopReason, Tool, ToolChoice};
use async_trait::async_trait;
use ensemble_core::backend::{GenerationContext, GenerativeBackend, InstanceSnapshot};
use ensemble_core::capability::{CapabilityRequest, Generation, Operation};
use ensemble_core::error::{BackendError, BackendResult};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

const RESPOND_TOOL: &str = "respond";

/// Settings for [`ClaudeBackend`].
#[derive(Debug, Clone)]
pub struct ClaudeConfig {
    pub model: String,
    pub max_tokens: usize,
    pub temperature: Option<f32>,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            model: client::DEFAULT_MODEL.to_string(),
            max_tokens: 1024,
            temperature: Some(0.8),
        }
    }
}

impl ClaudeConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Character backend driven by Claude.
#[derive(Debug, Clone)]
pub struct ClaudeBackend {
    client: Claude,
    config: ClaudeConfig,
}

impl ClaudeBackend {
    pub fn new(client: Claude, config: ClaudeConfig) -> Self {
        Self {
            client: client.with_model(config.model.clone()),
            config,
        }
    }

    /// Build from ANTHROPIC_API_KEY with default settings.
    pub fn from_env() -> Result<Self, client::Error> {
        Ok(Self::new(Claude::from_env()?, ClaudeConfig::default()))
    }

    pub fn config(&self) -> &ClaudeConfig {
        &self.config
    }

    /// Request sent for one invocation.
    pub fn build_request(&self, snapshot: &InstanceSnapshot, context: &GenerationContext) -> Request {
        let mut request = Request::new(vec![Message::user(context.render_request())])
            .with_system(snapshot.system_prompt())
            .with_max_tokens(self.config.max_tokens)
            .with_tools(vec![respond_tool(&context.request)])
            .with_tool_choice(ToolChoice::Tool {
                name: RESPOND_TOOL.to_string(),
            });
        if let Some(temperature) = self.config.temperature {
            request = request.with_temperature(temperature);
        }
        request
    }
}

#[async_trait]
impl GenerativeBackend for ClaudeBackend {
    fn name(&self) -> &str {
        "claude"
    }

    async fn generate(
        &self,
        snapshot: &InstanceSnapshot,
        context: &GenerationContext,
    ) -> BackendResult<Generation> {
        let request = self.build_request(snapshot, context);
        let response = self.client.complete(&request).await.map_err(map_error)?;
        debug!(
            instance = %snapshot.instance_id,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "Claude responded"
        );

        if response.stop_reason == StopReason::Refusal {
            return Err(BackendError::Refused(response.text()));
        }

        match response.tool_input(RESPOND_TOOL) {
            Some(input) => parse_reply(input.clone(), context.operation()),
            None => {
                // Tool use is forced, but fall back to plain text if it is skipped.
                let text = response.text();
                warn!(instance = %snapshot.instance_id, "Reply arrived without the respond tool");
                Ok(Generation::text(text))
            }
        }
    }
}

/// Tool through which the model answers.
fn respond_tool(request: &CapabilityRequest) -> Tool {
    let content_description = match request.operation() {
        Operation::Speak => "The words you say aloud, in character",
        Operation::Think => "Your private thoughts, in character",
        Operation::Choose => "Your reasoning for the choice, in character",
        Operation::Answer => "Your answer to the question, in character",
    };
    let mut properties = json!({
        "content": {"type": "string", "description": content_description},
        "emotional_state": {
            "type": "string",
            "description": "One or two words for your current mood"
        }
    });
    let mut required = vec!["content"];

    if let CapabilityRequest::Choose { options, .. } = request {
        properties["option"] = json!({
            "type": "integer",
            "minimum": 1,
            "maximum": options.len(),
            "description": "Number of the option you choose"
        });
        required.push("option");
    }

    Tool {
        name: RESPOND_TOOL.to_string(),
        description: "Give your response as the character.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": properties,
            "required": required
        }),
    }
}

#[derive(Debug, Deserialize)]
struct Reply {
    content: String,
    #[serde(default)]
    option: Option<usize>,
    #[serde(default)]
    emotional_state: Option<String>,
}

fn parse_reply(input: serde_json::Value, operation: Operation) -> BackendResult<Generation> {
    let reply: Reply = serde_json::from_value(input)
        .map_err(|e| BackendError::Malformed(format!("respond tool input: {e}")))?;

    let mut generation = Generation::text(reply.content);
    if let Some(state) = reply.emotional_state.filter(|s| !s.trim().is_empty()) {
        generation = generation.with_emotional_state(state);
    }
    if operation == Operation::Choose {
        // Options are shown 1-based.
        match reply.option {
            Some(number) if number >= 1 => generation = generation.with_selected(number - 1),
            _ => {
                return Err(BackendError::Malformed(
                    "choice reply carries no option number".to_string(),
                ))
            }
        }
    }
    Ok(generation)
}

fn map_error(err: client::Error) -> BackendError {
    match err {
        client::Error::NoApiKey => BackendError::Configuration("ANTHROPIC_API_KEY not set".to_string()),
        client::Error::Config(message) => BackendError::Configuration(message),
        client::Error::Network(message) => BackendError::Network(message),
        client::Error::Api { status, message } if status == 401 || status == 403 => {
            BackendError::Configuration(format!("API rejected credentials ({status}): {message}"))
        }
        client::Error::Api { status, message } => BackendError::Api { status, message },
        client::Error::Parse(message) => BackendError::Malformed(message),
    }
}
