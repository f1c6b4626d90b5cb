//! OpenAI-compatible chat completions backend.

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionTool, ChatCompletionToolArgs, ChatCompletionToolType,
    CreateChatCompletionRequestArgs, FinishReason, FunctionCall, FunctionObjectArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{LanguageModel, ModelError};
use crate::config::ModelConfig;
use crate::types::{content_to_text, ContentBlock, ModelTurn, StopReason, ToolDescriptor, TurnEntry};

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiModel {
    client: Client<OpenAIConfig>,
    model: String,
    max_tokens: u32,
    temperature: Option<f32>,
    system_prompt: Option<String>,
}

impl OpenAiModel {
    pub fn new(
        config: &ModelConfig,
        api_key: Option<String>,
        system_prompt: Option<String>,
    ) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_base(&config.api_base)
            .with_api_key(api_key.unwrap_or_else(|| "not-needed".to_string()));

        Self {
            client: Client::with_config(openai_config),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            system_prompt,
        }
    }

    /// Convert history entries to async-openai request messages.
    fn build_messages(
        &self,
        history: &[TurnEntry],
    ) -> Result<Vec<ChatCompletionRequestMessage>, ModelError> {
        let mut result = Vec::new();

        if let Some(sys_prompt) = &self.system_prompt {
            let sys_msg = ChatCompletionRequestSystemMessageArgs::default()
                .content(sys_prompt.as_str())
                .build()
                .map_err(request_error)?;
            result.push(ChatCompletionRequestMessage::System(sys_msg));
        }

        for entry in history {
            match entry {
                TurnEntry::User { content } => {
                    let m = ChatCompletionRequestUserMessageArgs::default()
                        .content(content.as_str())
                        .build()
                        .map_err(request_error)?;
                    result.push(ChatCompletionRequestMessage::User(m));
                }
                TurnEntry::Assistant { blocks } => {
                    let mut text = Vec::new();
                    let mut tool_calls = Vec::new();
                    for block in blocks {
                        match block {
                            ContentBlock::Text { text: t } => text.push(t.as_str()),
                            ContentBlock::ToolUse { id, name, arguments } => {
                                tool_calls.push(ChatCompletionMessageToolCall {
                                    id: id.clone(),
                                    r#type: ChatCompletionToolType::Function,
                                    function: FunctionCall {
                                        name: name.clone(),
                                        arguments: encode_arguments(arguments),
                                    },
                                })
                            }
                        }
                    }

                    let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
                    builder.content(text.join("\n"));
                    if !tool_calls.is_empty() {
                        builder.tool_calls(tool_calls);
                    }
                    let m = builder.build().map_err(request_error)?;
                    result.push(ChatCompletionRequestMessage::Assistant(m));
                }
                TurnEntry::ToolResults { results } => {
                    // One tool message per result, in tool-call order.
                    for r in results {
                        let m = ChatCompletionRequestToolMessageArgs::default()
                            .tool_call_id(r.id.as_str())
                            .content(content_to_text(&r.content))
                            .build()
                            .map_err(request_error)?;
                        result.push(ChatCompletionRequestMessage::Tool(m));
                    }
                }
            }
        }

        Ok(result)
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn complete_turn(
        &self,
        history: &[TurnEntry],
        tools: &[ToolDescriptor],
    ) -> Result<ModelTurn, ModelError> {
        let mut request_builder = CreateChatCompletionRequestArgs::default();
        request_builder
            .model(&self.model)
            .messages(self.build_messages(history)?)
            .max_completion_tokens(self.max_tokens);

        if let Some(temperature) = self.temperature {
            request_builder.temperature(temperature);
        }

        if !tools.is_empty() {
            let tools = tools
                .iter()
                .map(to_openai_tool)
                .collect::<Result<Vec<_>, _>>()?;
            request_builder.tools(tools);
        }

        let request = request_builder.build().map_err(request_error)?;

        debug!("Sending chat completion request for model {}", self.model);
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| ModelError::Http(e.to_string()))?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::InvalidResponse("no choices in response".into()))?;

        let mut blocks = Vec::new();
        if let Some(content) = choice.message.content.filter(|c| !c.is_empty()) {
            blocks.push(ContentBlock::Text { text: content });
        }
        for tc in choice.message.tool_calls.unwrap_or_default() {
            blocks.push(ContentBlock::ToolUse {
                id: tc.id,
                name: tc.function.name,
                arguments: decode_arguments(&tc.function.arguments),
            });
        }

        let stop_reason = match choice.finish_reason {
            Some(FinishReason::Stop) | None => StopReason::EndTurn,
            Some(FinishReason::ToolCalls) | Some(FinishReason::FunctionCall) => StopReason::ToolUse,
            Some(FinishReason::Length) => StopReason::MaxTokens,
            Some(other) => StopReason::Other(format!("{:?}", other)),
        };

        Ok(ModelTurn::new(blocks, stop_reason))
    }
}

fn to_openai_tool(tool: &ToolDescriptor) -> Result<ChatCompletionTool, ModelError> {
    let func = FunctionObjectArgs::default()
        .name(&tool.name)
        .description(&tool.description)
        .parameters(tool.input_schema.clone())
        .build()
        .map_err(|e| ModelError::Request(format!("function '{}': {}", tool.name, e)))?;
    ChatCompletionToolArgs::default()
        .r#type(ChatCompletionToolType::Function)
        .function(func)
        .build()
        .map_err(|e| ModelError::Request(format!("tool '{}': {}", tool.name, e)))
}

fn request_error(e: impl std::fmt::Display) -> ModelError {
    ModelError::Request(e.to_string())
}

/// Tool arguments arrive as a JSON string. Unparseable input is kept as a raw
/// string so the provider can reject it in-band.
fn decode_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn encode_arguments(arguments: &Value) -> String {
    match arguments {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}
