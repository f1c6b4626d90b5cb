use thiserror::Error;

use crate::llm::ModelError;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider '{provider}' failed to connect: {message}")]
    ProviderConnect { provider: String, message: String },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Tool-call loop exceeded {0} rounds without a final answer")]
    LoopExceeded(usize),

    #[error("No provider sessions available")]
    NoSessions,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, HubError>;
