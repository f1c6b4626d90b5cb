use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool as advertised by a provider and presented to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema describing the tool's arguments.
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// One block of an assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// A request from the model to invoke a tool.
    ToolUse {
        id: String,
        name: String,
        arguments: Value,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse { .. })
    }
}

/// Result of one tool invocation, paired with the tool-use id it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: String,
    pub content: Value,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(id: impl Into<String>, content: Value) -> Self {
        Self {
            id: id.into(),
            content,
            is_error: false,
        }
    }

    /// An error result carrying a plain-text message.
    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: text_content(message),
            is_error: true,
        }
    }
}

/// A single entry in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum TurnEntry {
    User { content: String },
    Assistant { blocks: Vec<ContentBlock> },
    /// Results for every tool use of the preceding assistant entry, in order.
    ToolResults { results: Vec<ToolResult> },
}

impl TurnEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, Self::Assistant { .. })
    }

    pub fn is_tool_results(&self) -> bool {
        matches!(self, Self::ToolResults { .. })
    }
}

/// Output of a provider's `call_tool`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallOutput {
    /// Provider content blocks, usually `[{"type": "text", "text": ...}]`.
    pub content: Value,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    Other(String),
}

/// One model response.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelTurn {
    pub blocks: Vec<ContentBlock>,
    pub stop_reason: StopReason,
}

impl ModelTurn {
    pub fn new(blocks: Vec<ContentBlock>, stop_reason: StopReason) -> Self {
        Self { blocks, stop_reason }
    }

    pub fn has_tool_use(&self) -> bool {
        self.blocks.iter().any(ContentBlock::is_tool_use)
    }
}

/// Wrap plain text as a single-element content array.
pub fn text_content(text: impl Into<String>) -> Value {
    serde_json::json!([{ "type": "text", "text": text.into() }])
}

/// Render provider content as readable text.
///
/// Text blocks contribute their text; any other block or shape is rendered as
/// compact JSON.
pub fn content_to_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .map(|block| match block.get("text").and_then(Value::as_str) {
                Some(text) if block.get("type").and_then(Value::as_str) == Some("text") => {
                    text.to_string()
                }
                _ => block.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}
