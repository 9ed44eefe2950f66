//! Game-server discovery and queued-player notification

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::store::ActiveMatch;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },
}

/// Where new matches are hosted
#[async_trait]
pub trait ServerPool: Send + Sync {
    /// Make sure at least one game server is running.
    async fn ensure_running(&self) -> Result<(), PeerError>;

    /// Address of a server able to host a match. `None` while none is up.
    async fn server_address(&self) -> Result<Option<String>, PeerError>;
}

/// A single, always-running server
#[derive(Debug, Clone)]
pub struct StaticServerPool {
    address: String,
}

impl StaticServerPool {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl ServerPool for StaticServerPool {
    async fn ensure_running(&self) -> Result<(), PeerError> {
        Ok(())
    }

    async fn server_address(&self) -> Result<Option<String>, PeerError> {
        Ok(Some(self.address.clone()))
    }
}

/// Tells a queued player that an opponent has been found
#[async_trait]
pub trait QueueNotifier: Send + Sync {
    async fn match_found(&self, user_id: &str, active: &ActiveMatch) -> Result<(), PeerError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MatchFoundNotice<'a> {
    user_id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(rename = "match")]
    active: &'a ActiveMatch,
}

/// POSTs `{userId, type: "matchFound", match}` to a webhook
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl QueueNotifier for WebhookNotifier {
    async fn match_found(&self, user_id: &str, active: &ActiveMatch) -> Result<(), PeerError> {
        let notice = MatchFoundNotice {
            user_id,
            kind: "matchFound",
            active,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&notice)
            .send()
            .await
            .map_err(PeerError::Request)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PeerError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl QueueNotifier for NoopNotifier {
    async fn match_found(&self, user_id: &str, active: &ActiveMatch) -> Result<(), PeerError> {
        debug!(user_id = %user_id, match_id = %active.match_id, "No notifier configured");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn notice_shape() {
        let active = ActiveMatch {
            match_id: "m1".into(),
            conversation_id: None,
            players: Vec::new(),
            game_mode: "5+3".into(),
            server: Some("10.0.0.1:8080".into()),
            average_rating: 1200.0,
            created_at: Utc::now(),
            started_at: None,
        };
        let json = serde_json::to_value(MatchFoundNotice {
            user_id: "u1",
            kind: "matchFound",
            active: &active,
        })
        .unwrap();
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["type"], "matchFound");
        assert_eq!(json["match"]["matchId"], "m1");
        assert_eq!(json["match"]["server"], "10.0.0.1:8080");
    }

    #[tokio::test]
    async fn static_pool_always_answers() {
        let pool = StaticServerPool::new("game.local:8080");
        pool.ensure_running().await.unwrap();
        assert_eq!(pool.server_address().await.unwrap().as_deref(), Some("game.local:8080"));
    }
}
