//! JSON-RPC framing and the subset of MCP messages toolhub uses.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use toolhub_core::provider::ProviderError;
use toolhub_core::types::{ToolCallOutput, ToolDescriptor};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl<'a> RpcRequest<'a> {
    pub fn call(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params,
        }
    }

    pub fn notification(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method,
            params,
        }
    }

    /// Serialize as a single line, newline-terminated.
    pub fn to_line(&self) -> Result<String, ProviderError> {
        let mut line = serde_json::to_string(self)
            .map_err(|e| ProviderError::Protocol(format!("encoding request: {}", e)))?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// A message read from the provider's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response {
        id: u64,
        outcome: Result<Value, RpcErrorObject>,
    },
    Notification {
        method: String,
    },
    /// A server-to-client request. toolhub advertises no client capabilities,
    /// so only `ping` gets a real answer; see [`reply_to_request`].
    Request {
        id: Value,
        method: String,
    },
}

pub fn parse_line(line: &str) -> Result<Incoming, ProviderError> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| ProviderError::Protocol(format!("invalid JSON from provider: {}", e)))?;

    if let Some(method) = value.get("method").and_then(Value::as_str) {
        let method = method.to_string();
        return Ok(match value.get("id") {
            Some(id) if !id.is_null() => Incoming::Request {
                id: id.clone(),
                method,
            },
            _ => Incoming::Notification { method },
        });
    }

    let id = value
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| ProviderError::Protocol(format!("response without numeric id: {}", line)))?;

    let outcome = match value.get("error") {
        Some(error) if !error.is_null() => Err(serde_json::from_value(error.clone())
            .map_err(|e| ProviderError::Protocol(format!("malformed error object: {}", e)))?),
        _ => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
    };

    Ok(Incoming::Response { id, outcome })
}

/// Response line for a server-to-client request: an empty result for `ping`,
/// method-not-found for anything else.
pub fn reply_to_request(id: &Value, method: &str) -> String {
    let reply = if method == "ping" {
        json!({ "jsonrpc": "2.0", "id": id, "result": {} })
    } else {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": METHOD_NOT_FOUND,
                "message": format!("Method not found: {}", method),
            }
        })
    };
    let mut line = reply.to_string();
    line.push('\n');
    line
}

pub fn initialize_params(client_name: &str, client_version: &str) -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": client_name,
            "version": client_version,
        }
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct McpTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsPage {
    tools: Vec<McpTool>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

impl ToolsPage {
    pub fn parse(result: Value) -> Result<Self, ProviderError> {
        serde_json::from_value(result)
            .map_err(|e| ProviderError::Protocol(format!("malformed tools/list result: {}", e)))
    }

    /// Descriptors as advertised. Shape checks happen in the registry.
    pub fn into_descriptors(self) -> Vec<ToolDescriptor> {
        self.tools
            .into_iter()
            .map(|t| ToolDescriptor {
                name: t.name,
                description: t.description.unwrap_or_default(),
                input_schema: t.input_schema,
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallToolResult {
    #[serde(default)]
    content: Value,
    #[serde(default)]
    is_error: bool,
}

pub fn parse_call_result(result: Value) -> Result<ToolCallOutput, ProviderError> {
    let parsed: CallToolResult = serde_json::from_value(result)
        .map_err(|e| ProviderError::Protocol(format!("malformed tools/call result: {}", e)))?;
    let content = match parsed.content {
        Value::Null => Value::Array(Vec::new()),
        other => other,
    };
    Ok(ToolCallOutput {
        content,
        is_error: parsed.is_error,
    })
}
