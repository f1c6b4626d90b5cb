//! Anthropic Messages API backend.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{LanguageModel, ModelError};
use crate::config::ModelConfig;
use crate::types::{ContentBlock, ModelTurn, StopReason, ToolDescriptor, TurnEntry};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct CreateMessageRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<MessageParam>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDef<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, PartialEq)]
struct MessageParam {
    role: &'static str,
    content: Vec<BlockParam>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockParam {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Serialize)]
struct ToolDef<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Unsupported,
}

/// Client for the Anthropic Messages API.
pub struct AnthropicModel {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: Option<f32>,
    system_prompt: Option<String>,
}

impl AnthropicModel {
    pub fn new(config: &ModelConfig, api_key: String, system_prompt: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            system_prompt,
        }
    }

    fn headers(&self) -> Result<HeaderMap, ModelError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key)
                .map_err(|e| ModelError::Request(format!("invalid API key header: {}", e)))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        Ok(headers)
    }
}

impl std::fmt::Debug for AnthropicModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicModel")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl LanguageModel for AnthropicModel {
    async fn complete_turn(
        &self,
        history: &[TurnEntry],
        tools: &[ToolDescriptor],
    ) -> Result<ModelTurn, ModelError> {
        let request = CreateMessageRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: to_messages(history),
            system: self.system_prompt.as_deref(),
            tools: (!tools.is_empty()).then(|| {
                tools
                    .iter()
                    .map(|t| ToolDef {
                        name: &t.name,
                        description: &t.description,
                        input_schema: &t.input_schema,
                    })
                    .collect()
            }),
            temperature: self.temperature,
        };

        let url = format!("{}/v1/messages", self.base_url);
        debug!("POST {} ({} messages)", url, request.messages.len());

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await
            .map_err(|e| ModelError::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ModelError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(ModelError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let parsed: MessageResponse = serde_json::from_str(&body).map_err(|e| {
            ModelError::InvalidResponse(format!("failed to parse response: {}\nBody: {}", e, body))
        })?;
        Ok(from_response(parsed))
    }
}

/// Convert history entries into Messages API parameters.
fn to_messages(history: &[TurnEntry]) -> Vec<MessageParam> {
    history
        .iter()
        .map(|entry| match entry {
            TurnEntry::User { content } => MessageParam {
                role: "user",
                content: vec![BlockParam::Text {
                    text: content.clone(),
                }],
            },
            TurnEntry::Assistant { blocks } => MessageParam {
                role: "assistant",
                content: blocks
                    .iter()
                    .map(|block| match block {
                        ContentBlock::Text { text } => BlockParam::Text { text: text.clone() },
                        ContentBlock::ToolUse { id, name, arguments } => BlockParam::ToolUse {
                            id: id.clone(),
                            name: name.clone(),
                            input: arguments.clone(),
                        },
                    })
                    .collect(),
            },
            TurnEntry::ToolResults { results } => MessageParam {
                role: "user",
                content: results
                    .iter()
                    .map(|r| BlockParam::ToolResult {
                        tool_use_id: r.id.clone(),
                        content: r.content.clone(),
                        is_error: r.is_error,
                    })
                    .collect(),
            },
        })
        .collect()
}

fn from_response(response: MessageResponse) -> ModelTurn {
    let blocks = response
        .content
        .into_iter()
        .filter_map(|block| match block {
            ResponseBlock::Text { text } => Some(ContentBlock::Text { text }),
            ResponseBlock::ToolUse { id, name, input } => Some(ContentBlock::ToolUse {
                id,
                name,
                arguments: input,
            }),
            ResponseBlock::Unsupported => None,
        })
        .collect();

    let stop_reason = match response.stop_reason.as_deref() {
        Some("end_turn") | None => StopReason::EndTurn,
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some("stop_sequence") => StopReason::StopSequence,
        Some(other) => StopReason::Other(other.to_string()),
    };

    ModelTurn::new(blocks, stop_reason)
}
