//! ECS container agent task-protection endpoint

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use super::{OrchestratorControl, ProtectionError};

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ProtectionState {
    protection_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_in_minutes: Option<u64>,
}

pub struct EcsAgentProtection {
    client: Client,
    agent_uri: String,
}

impl EcsAgentProtection {
    pub fn new(client: Client, agent_uri: impl Into<String>) -> Self {
        Self {
            client,
            agent_uri: agent_uri.into().trim_end_matches('/').to_string(),
        }
    }

    fn state_url(&self) -> String {
        format!("{}/task-protection/v1/state", self.agent_uri)
    }
}

/// Whole minutes, rounded up, at least one
fn expires_in_minutes(duration: Duration) -> u64 {
    duration.as_secs().div_ceil(60).max(1)
}

#[async_trait]
impl OrchestratorControl for EcsAgentProtection {
    async fn set_protection(&self, enabled: bool, expires_in: Duration) -> Result<(), ProtectionError> {
        let body = ProtectionState {
            protection_enabled: enabled,
            expires_in_minutes: enabled.then(|| expires_in_minutes(expires_in)),
        };

        let response = self
            .client
            .put(self.state_url())
            .json(&body)
            .send()
            .await
            .map_err(ProtectionError::Request)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProtectionError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Used when no orchestrator agent is reachable, e.g. local runs
#[derive(Debug, Default)]
pub struct NoopOrchestrator;

#[async_trait]
impl OrchestratorControl for NoopOrchestrator {
    async fn set_protection(&self, enabled: bool, expires_in: Duration) -> Result<(), ProtectionError> {
        debug!(enabled, expires_in_secs = expires_in.as_secs(), "Protection change (no orchestrator)");
        Ok(())
    }
}
