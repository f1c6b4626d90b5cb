use std::sync::Arc;

use tokio::sync::Mutex;
use toolhub_core::config::AppConfig;
use toolhub_core::Orchestrator;

/// Shared application state for the server.
///
/// The orchestrator holds a single conversation, so requests take turns on it.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub orchestrator: Arc<Mutex<Orchestrator>>,
}

impl AppState {
    pub fn new(config: AppConfig, orchestrator: Orchestrator) -> Self {
        Self {
            config: Arc::new(config),
            orchestrator: Arc::new(Mutex::new(orchestrator)),
        }
    }
}
