//! Delivery of final match records

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Url};
use serde::Serialize;
use tracing::{info, warn};

use super::sigv4::{uri_encode, SigV4Signer, SignError};
use crate::game::{AbortRecord, MatchRecord};
use crate::store::MatchStore;

#[async_trait]
pub trait MatchFinalizer: Send + Sync {
    /// Called once per ended match; the caller retries on error.
    async fn end(&self, record: &MatchRecord) -> Result<(), FinalizeError>;

    async fn abort(&self, record: &AbortRecord) -> Result<(), FinalizeError>;
}

#[derive(Debug, thiserror::Error)]
pub enum FinalizeError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("function error ({kind}): {body}")]
    Function { kind: String, body: String },

    #[error("invalid function endpoint: {0}")]
    Endpoint(String),

    #[error("signing failed: {0}")]
    Sign(#[from] SignError),

    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationType {
    /// Wait for the function to finish
    RequestResponse,
    /// Queue and return
    Event,
}

impl InvocationType {
    fn as_str(self) -> &'static str {
        match self {
            InvocationType::RequestResponse => "RequestResponse",
            InvocationType::Event => "Event",
        }
    }
}

/// Invokes the end/abort Lambda functions
pub struct LambdaFinalizer {
    client: Client,
    signer: SigV4Signer,
    region: String,
    end_function: String,
    abort_function: String,
}

impl LambdaFinalizer {
    pub fn new(
        client: Client,
        signer: SigV4Signer,
        region: impl Into<String>,
        end_function: impl Into<String>,
        abort_function: impl Into<String>,
    ) -> Self {
        Self {
            client,
            signer,
            region: region.into(),
            end_function: end_function.into(),
            abort_function: abort_function.into(),
        }
    }

    async fn invoke<T: Serialize + Sync>(
        &self,
        function: &str,
        payload: &T,
        invocation: InvocationType,
    ) -> Result<(), FinalizeError> {
        let url = invoke_url(&self.region, function)?;
        let body = serde_json::to_vec(payload)?;
        let signed = self.signer.sign(
            "POST",
            &url,
            &[("x-amz-invocation-type", invocation.as_str())],
            &body,
            Utc::now(),
        )?;

        let response = signed
            .apply(self.client.post(url))
            .header("X-Amz-Invocation-Type", invocation.as_str())
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(FinalizeError::Request)?;

        let status = response.status();
        let function_error = response
            .headers()
            .get("X-Amz-Function-Error")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FinalizeError::Api {
                status: status.as_u16(),
                body,
            });
        }
        if let Some(kind) = function_error {
            let body = response.text().await.unwrap_or_default();
            return Err(FinalizeError::Function { kind, body });
        }
        Ok(())
    }
}

/// `https://lambda.{region}.amazonaws.com/2015-03-31/functions/{fn}/invocations`
fn invoke_url(region: &str, function: &str) -> Result<Url, FinalizeError> {
    let url = format!(
        "https://lambda.{region}.amazonaws.com/2015-03-31/functions/{}/invocations",
        uri_encode(function)
    );
    Url::parse(&url).map_err(|e| FinalizeError::Endpoint(e.to_string()))
}

#[async_trait]
impl MatchFinalizer for LambdaFinalizer {
    async fn end(&self, record: &MatchRecord) -> Result<(), FinalizeError> {
        self.invoke(&self.end_function, record, InvocationType::RequestResponse)
            .await
    }

    async fn abort(&self, record: &AbortRecord) -> Result<(), FinalizeError> {
        self.invoke(&self.abort_function, record, InvocationType::Event)
            .await
    }
}

/// Local stand-in: logs the record and clears the match from the store so
/// its players can queue again.
pub struct StoreFinalizer {
    store: Arc<dyn MatchStore>,
}

impl StoreFinalizer {
    pub fn new(store: Arc<dyn MatchStore>) -> Self {
        Self { store }
    }

    async fn release(&self, match_id: &str, player_ids: &[&str]) {
        for &player_id in player_ids {
            if let Err(e) = self.store.delete_user_match(player_id).await {
                warn!(match_id = %match_id, player_id = %player_id, error = %e, "Failed to release user binding");
            }
        }
        if let Err(e) = self.store.delete_spectator_channel(match_id).await {
            warn!(match_id = %match_id, error = %e, "Failed to delete spectator channel");
        }
        if let Err(e) = self.store.delete_match(match_id).await {
            warn!(match_id = %match_id, error = %e, "Failed to delete match");
        }
    }
}

#[async_trait]
impl MatchFinalizer for StoreFinalizer {
    async fn end(&self, record: &MatchRecord) -> Result<(), FinalizeError> {
        info!(
            match_id = %record.match_id,
            record = %serde_json::to_string(record)?,
            "Match record"
        );
        let players: Vec<&str> = record.players.iter().map(|p| p.id.as_str()).collect();
        self.release(&record.match_id, &players).await;
        Ok(())
    }

    async fn abort(&self, record: &AbortRecord) -> Result<(), FinalizeError> {
        info!(match_id = %record.match_id, players = ?record.player_ids, "Match aborted");
        let players: Vec<&str> = record.player_ids.iter().map(String::as_str).collect();
        self.release(&record.match_id, &players).await;
        Ok(())
    }
}
