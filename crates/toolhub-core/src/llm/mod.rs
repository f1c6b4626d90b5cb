//! Language-model backends.
//!
//! The orchestrator only talks to [`LanguageModel`]; concrete backends adapt a
//! vendor API to the shared turn/entry types.

pub mod anthropic;
pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ModelConfig;
use crate::error::HubError;
use crate::types::{ModelTurn, ToolDescriptor, TurnEntry};

pub use anthropic::AnthropicModel;
pub use openai::OpenAiModel;

/// Failure of a model API call.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("invalid request: {0}")]
    Request(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// A model that completes one turn given the full history and available tools.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// `tools` is empty when no tools should be offered.
    async fn complete_turn(
        &self,
        history: &[TurnEntry],
        tools: &[ToolDescriptor],
    ) -> Result<ModelTurn, ModelError>;
}

/// Which vendor API a [`ModelConfig`] targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Anthropic,
    OpenAi,
}

/// Build the configured backend.
pub fn from_config(
    config: &ModelConfig,
    system_prompt: Option<String>,
) -> Result<Arc<dyn LanguageModel>, HubError> {
    let api_key = config.resolve_api_key();
    let model: Arc<dyn LanguageModel> = match config.backend {
        Backend::Anthropic => {
            let api_key = api_key.ok_or_else(|| {
                HubError::Config(format!(
                    "Anthropic backend needs an API key (set model.api_key or ${})",
                    config.api_key_env.as_deref().unwrap_or("ANTHROPIC_API_KEY")
                ))
            })?;
            Arc::new(AnthropicModel::new(config, api_key, system_prompt))
        }
        Backend::OpenAi => Arc::new(OpenAiModel::new(config, api_key, system_prompt)),
    };
    Ok(model)
}
