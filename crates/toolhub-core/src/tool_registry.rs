use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::error::HubError;
use crate::provider::SessionSet;
use crate::types::ToolDescriptor;

/// What went wrong with a provider while building the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    /// `list_tools` failed; the provider contributes no tools.
    ListFailed,
    /// A descriptor failed validation and was rejected.
    MalformedTool,
    /// A tool name was already claimed by an earlier provider.
    Collision,
}

/// A problem recorded against one provider during `refresh`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderIssue {
    pub session_id: String,
    pub kind: IssueKind,
    pub message: String,
}

/// Unified tool namespace across all provider sessions.
///
/// Routing is first-writer-wins: a tool name belongs to the first session
/// (in registration order) that advertised it.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    routes: HashMap<String, String>,
    tools: Vec<ToolDescriptor>,
    issues: Vec<ProviderIssue>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the registry from the given sessions.
    pub async fn refresh(&mut self, sessions: &SessionSet) {
        self.clear();

        for (session_id, session) in sessions.iter() {
            let descriptors = match session.list_tools().await {
                Ok(descriptors) => descriptors,
                Err(e) => {
                    warn!("Listing tools for provider '{}' failed: {}", session_id, e);
                    self.record(session_id, IssueKind::ListFailed, e.to_string());
                    continue;
                }
            };

            let mut accepted = Vec::new();
            for descriptor in descriptors {
                if let Err(e) = validate_descriptor(&descriptor) {
                    warn!("Rejected tool from provider '{}': {}", session_id, e);
                    self.record(session_id, IssueKind::MalformedTool, e.to_string());
                    continue;
                }

                if let Some(owner) = self.routes.get(&descriptor.name) {
                    let message = format!(
                        "tool '{}' already provided by '{}'; keeping that one",
                        descriptor.name, owner
                    );
                    warn!("Tool name conflict from provider '{}': {}", session_id, message);
                    self.record(session_id, IssueKind::Collision, message);
                    continue;
                }

                debug!("Registered tool '{}' from provider '{}'", descriptor.name, session_id);
                self.routes
                    .insert(descriptor.name.clone(), session_id.to_string());
                accepted.push(descriptor.name.clone());
                self.tools.push(descriptor);
            }
            info!("Provider '{}' provides tools: {:?}", session_id, accepted);
        }

        info!(
            "Registry built from {} provider(s): {} unique tool(s)",
            sessions.len(),
            self.tools.len()
        );
    }

    /// One descriptor per distinct tool name, in registration order.
    pub fn tools_for_model(&self) -> Vec<ToolDescriptor> {
        self.tools.clone()
    }

    /// The session id that owns a tool name.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.routes.get(name).map(String::as_str)
    }

    /// Tool descriptors grouped under the session that owns them.
    pub fn tools_by_session(&self, session_id: &str) -> Vec<&ToolDescriptor> {
        self.tools
            .iter()
            .filter(|t| self.resolve(&t.name) == Some(session_id))
            .collect()
    }

    /// Problems recorded during the last refresh.
    pub fn issues(&self) -> &[ProviderIssue] {
        &self.issues
    }

    pub fn clear(&mut self) {
        self.routes.clear();
        self.tools.clear();
        self.issues.clear();
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    fn record(&mut self, session_id: &str, kind: IssueKind, message: String) {
        self.issues.push(ProviderIssue {
            session_id: session_id.to_string(),
            kind,
            message,
        });
    }
}

/// Required-fields check applied to every descriptor a provider returns.
pub fn validate_descriptor(descriptor: &ToolDescriptor) -> Result<(), HubError> {
    if descriptor.name.trim().is_empty() {
        return Err(HubError::Config("tool descriptor has an empty name".into()));
    }
    if !descriptor.input_schema.is_object() {
        return Err(HubError::Config(format!(
            "tool '{}' has a non-object input schema",
            descriptor.name
        )));
    }
    Ok(())
}
