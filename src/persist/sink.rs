//! Snapshot delivery to spectators and durable storage

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Url};
use serde_json::{json, Value};

use super::sigv4::{SigV4Signer, SignError};
use crate::store::{MatchSnapshot, StoreError};

/// Receives every authoritative snapshot of a live match
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn publish(&self, snapshot: &MatchSnapshot) -> Result<(), SinkError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("GraphQL error: {0}")]
    GraphQl(String),

    #[error("signing failed: {0}")]
    Sign(#[from] SignError),

    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(StoreError),
}

const SAVE_SNAPSHOT_MUTATION: &str = "mutation SaveMatchSnapshot($input: MatchSnapshotInput!) {
  saveMatchSnapshot(input: $input) { id matchId ply }
}";

/// AppSync GraphQL endpoint signed with SigV4 (`service = appsync`)
pub struct AppSyncSink {
    client: Client,
    url: Url,
    signer: SigV4Signer,
}

impl AppSyncSink {
    pub fn new(client: Client, url: Url, signer: SigV4Signer) -> Self {
        Self { client, url, signer }
    }
}

fn mutation_body(snapshot: &MatchSnapshot) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&json!({
        "query": SAVE_SNAPSHOT_MUTATION,
        "variables": { "input": snapshot },
    }))
}

/// AppSync reports resolver failures with a 200 and an `errors` array
fn graphql_errors(response: &Value) -> Option<String> {
    let errors = response.get("errors")?.as_array()?;
    if errors.is_empty() {
        return None;
    }
    Some(
        errors
            .iter()
            .map(|e| e.get("message").and_then(Value::as_str).unwrap_or("unknown error"))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

#[async_trait]
impl SnapshotSink for AppSyncSink {
    async fn publish(&self, snapshot: &MatchSnapshot) -> Result<(), SinkError> {
        let body = mutation_body(snapshot)?;
        let signed = self.signer.sign(
            "POST",
            &self.url,
            &[("content-type", "application/json")],
            &body,
            Utc::now(),
        )?;

        let response = signed
            .apply(self.client.post(self.url.clone()))
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(SinkError::Request)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let reply: Value = response.json().await.map_err(SinkError::Request)?;
        match graphql_errors(&reply) {
            Some(message) => Err(SinkError::GraphQl(message)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    #[test]
    fn mutation_wraps_snapshot_as_input() {
        let snapshot = MatchSnapshot {
            id: Uuid::nil(),
            match_id: "m1".into(),
            player_states: BTreeMap::new(),
            game_state: "e2e4".into(),
            last_move: None,
            ply: 1,
            timestamp: Utc::now(),
        };
        let body: Value = serde_json::from_slice(&mutation_body(&snapshot).unwrap()).unwrap();
        assert!(body["query"].as_str().unwrap().contains("saveMatchSnapshot"));
        assert_eq!(body["variables"]["input"]["matchId"], "m1");
        assert_eq!(body["variables"]["input"]["gameState"], "e2e4");
        assert_eq!(body["variables"]["input"]["ply"], 1);
    }

    #[test]
    fn detects_graphql_errors() {
        assert_eq!(graphql_errors(&json!({"data": {}})), None);
        assert_eq!(graphql_errors(&json!({"errors": []})), None);
        assert_eq!(
            graphql_errors(&json!({"errors": [{"message": "denied"}, {"message": "again"}]})),
            Some("denied; again".into())
        );
    }
}
