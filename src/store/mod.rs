//! Match store: pre-created matches, snapshot history, user bindings and
//! the matchmaking ticket pool

use async_trait::async_trait;

pub mod memory;
pub mod model;
pub mod rest;

pub use memory::MemoryMatchStore;
pub use model::{
    ActiveMatch, ActiveMatchUpdate, MatchPlayer, MatchSnapshot, MatchmakingTicket,
    SnapshotCursor, SnapshotMove, SnapshotPage, SnapshotPlayerState, DEFAULT_RD,
};
pub use rest::RestMatchStore;

/// Persistence operations the match server and the matchmaker rely on
#[async_trait]
pub trait MatchStore: Send + Sync {
    async fn get_match(&self, match_id: &str) -> Result<ActiveMatch, StoreError>;

    async fn put_match(&self, active: &ActiveMatch) -> Result<(), StoreError>;

    async fn update_match(&self, match_id: &str, update: &ActiveMatchUpdate) -> Result<(), StoreError>;

    async fn delete_match(&self, match_id: &str) -> Result<(), StoreError>;

    /// Page through snapshot history ordered by ply. `cursor` is exclusive.
    async fn fetch_snapshots(
        &self,
        match_id: &str,
        cursor: Option<SnapshotCursor>,
        limit: usize,
        ascending: bool,
    ) -> Result<SnapshotPage, StoreError>;

    async fn fetch_latest_snapshot(&self, match_id: &str) -> Result<Option<MatchSnapshot>, StoreError> {
        let page = self.fetch_snapshots(match_id, None, 1, false).await?;
        Ok(page.items.into_iter().next())
    }

    async fn get_user_match(&self, user_id: &str) -> Result<Option<String>, StoreError>;

    /// Bind a user to a match. Fails with `Conflict` if a binding exists.
    async fn put_user_match(&self, user_id: &str, match_id: &str) -> Result<(), StoreError>;

    async fn delete_user_match(&self, user_id: &str) -> Result<(), StoreError>;

    async fn put_spectator_channel(&self, match_id: &str) -> Result<(), StoreError>;

    async fn delete_spectator_channel(&self, match_id: &str) -> Result<(), StoreError>;

    /// Waiting tickets for a game mode, oldest first
    async fn scan_tickets(&self, game_mode: &str) -> Result<Vec<MatchmakingTicket>, StoreError>;

    async fn put_ticket(&self, ticket: &MatchmakingTicket) -> Result<(), StoreError>;

    async fn delete_ticket(&self, user_id: &str) -> Result<(), StoreError>;
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Failed to parse response: {0}")]
    Parse(reqwest::Error),

    #[error("Record not found")]
    NotFound,

    #[error("Conditional write failed")]
    Conflict,
}
