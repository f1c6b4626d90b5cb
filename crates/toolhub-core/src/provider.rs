use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::types::{ToolCallOutput, ToolDescriptor};

/// Failure talking to a tool provider.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("provider returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("provider connection closed")]
    Closed,
}

/// One live connection to a tool-provider process.
#[async_trait]
pub trait ProviderSession: Send + Sync {
    /// List the tools this provider exposes.
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ProviderError>;

    /// Invoke a tool with structured arguments.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallOutput, ProviderError>;

    /// Whether the underlying connection is still usable.
    fn is_alive(&self) -> bool {
        true
    }

    /// Release the connection. Called once during shutdown.
    async fn close(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Provider sessions keyed by id, iterated in registration order.
#[derive(Clone, Default)]
pub struct SessionSet {
    entries: Vec<(String, Arc<dyn ProviderSession>)>,
}

impl SessionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Re-registering an id replaces the session but keeps
    /// its original position.
    pub fn insert(&mut self, id: impl Into<String>, session: Arc<dyn ProviderSession>) {
        let id = id.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == id) {
            Some(entry) => entry.1 = session,
            None => self.entries.push((id, session)),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn ProviderSession>> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == id)
            .map(|(_, session)| session)
    }

    pub fn remove(&mut self, id: &str) -> Option<Arc<dyn ProviderSession>> {
        let index = self.entries.iter().position(|(existing, _)| existing == id)?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn ProviderSession>)> {
        self.entries.iter().map(|(id, session)| (id.as_str(), session))
    }

    pub fn ids(&self) -> Vec<&str> {
        self.entries.iter().map(|(id, _)| id.as_str()).collect()
    }

    /// Remove and return every session, in registration order.
    pub fn drain(&mut self) -> Vec<(String, Arc<dyn ProviderSession>)> {
        std::mem::take(&mut self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
