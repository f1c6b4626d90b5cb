use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{info, warn};

use toolhub_core::config::ProviderConfig;
use toolhub_core::error::HubError;
use toolhub_core::provider::SessionSet;

use crate::session::StdioSession;

/// Outcome of bringing up the configured providers.
#[derive(Default)]
pub struct ConnectReport {
    /// Live sessions, in config order.
    pub sessions: SessionSet,
    /// Providers that could not be started, in config order.
    pub failures: Vec<(String, HubError)>,
}

impl ConnectReport {
    pub fn connected(&self) -> usize {
        self.sessions.len()
    }
}

/// Start every provider concurrently. A failing provider is reported and
/// skipped; it never prevents the others from connecting.
///
/// Provider names must be unique. A repeated name is a `Config` failure for
/// the later entry and the first entry keeps the name.
pub async fn connect_all(configs: &[ProviderConfig], request_timeout: Duration) -> ConnectReport {
    let mut seen = HashSet::new();
    let repeated: Vec<bool> = configs
        .iter()
        .map(|config| !config.name.trim().is_empty() && !seen.insert(config.name.as_str()))
        .collect();

    let attempts = configs.iter().zip(repeated).map(|(config, repeated)| async move {
        let outcome = if repeated {
            Err(HubError::Config(format!(
                "provider name '{}' is already used by an earlier entry",
                config.name
            )))
        } else {
            StdioSession::spawn(config, request_timeout).await
        };
        (config.name.clone(), outcome)
    });

    let mut report = ConnectReport::default();
    for (name, outcome) in join_all(attempts).await {
        match outcome {
            Ok(session) => {
                info!("Connected to provider '{}'", name);
                report.sessions.insert(name, Arc::new(session));
            }
            Err(e) => {
                warn!("Failed to connect to provider '{}': {}", name, e);
                report.failures.push((name, e));
            }
        }
    }
    report
}
