pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod provider;
pub mod tool_registry;
pub mod types;

pub use config::AppConfig;
pub use conversation::ConversationState;
pub use error::HubError;
pub use llm::LanguageModel;
pub use orchestrator::Orchestrator;
pub use provider::{ProviderSession, SessionSet};
pub use tool_registry::ToolRegistry;

#[cfg(test)]
pub(crate) mod testing;
