//! Records persisted in the match store

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::PlayerStatus;
use crate::util::time::duration_millis;

/// Default Glicko rating deviation for players with no history
pub const DEFAULT_RD: f64 = 350.0;

fn default_rd() -> f64 {
    DEFAULT_RD
}

/// One seat of a pre-created match, with rating projections for
/// the three possible results (win, draw, loss)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchPlayer {
    pub id: String,
    pub rating: f64,
    #[serde(default = "default_rd")]
    pub rd: f64,
    #[serde(default)]
    pub new_ratings: Vec<f64>,
    #[serde(default)]
    pub new_rds: Vec<f64>,
}

/// Pre-created match awaiting (or in) play
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveMatch {
    pub match_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Starter first
    pub players: Vec<MatchPlayer>,
    pub game_mode: String,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub average_rating: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

impl ActiveMatch {
    pub fn player_ids(&self) -> Vec<String> {
        self.players.iter().map(|p| p.id.clone()).collect()
    }
}

/// Partial update applied by `MatchStore::update_match`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveMatchUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPlayerState {
    #[serde(with = "duration_millis")]
    pub clock: Duration,
    pub status: PlayerStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMove {
    pub player_id: String,
    #[serde(rename = "move")]
    pub payload: String,
}

/// Authoritative state of a match at one ply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSnapshot {
    pub id: Uuid,
    pub match_id: String,
    pub player_states: BTreeMap<String, SnapshotPlayerState>,
    pub game_state: String,
    #[serde(rename = "move", default, skip_serializing_if = "Option::is_none")]
    pub last_move: Option<SnapshotMove>,
    pub ply: u32,
    pub timestamp: DateTime<Utc>,
}

/// Position in the snapshot history used for paging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotCursor {
    pub ply: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotPage {
    pub items: Vec<MatchSnapshot>,
    pub next: Option<SnapshotCursor>,
}

/// A user's request to be paired, held in the pool until matched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchmakingTicket {
    pub user_id: String,
    pub user_rating: f64,
    #[serde(default = "default_rd")]
    pub user_rd: f64,
    pub min_rating: f64,
    pub max_rating: f64,
    pub game_mode: String,
    pub ranked: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_wire_shape() {
        let mut player_states = BTreeMap::new();
        player_states.insert(
            "a".to_string(),
            SnapshotPlayerState {
                clock: Duration::from_millis(599_100),
                status: PlayerStatus::Connected,
            },
        );
        let snapshot = MatchSnapshot {
            id: Uuid::nil(),
            match_id: "m1".into(),
            player_states,
            game_state: "e2e4".into(),
            last_move: Some(SnapshotMove {
                player_id: "a".into(),
                payload: "e2e4".into(),
            }),
            ply: 1,
            timestamp: DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["matchId"], "m1");
        assert_eq!(json["playerStates"]["a"]["clock"], 599_100);
        assert_eq!(json["playerStates"]["a"]["status"], "CONNECTED");
        assert_eq!(json["move"]["playerId"], "a");
        assert_eq!(json["move"]["move"], "e2e4");
        assert_eq!(json["gameState"], "e2e4");
    }

    #[test]
    fn active_match_tolerates_missing_optionals() {
        let json = serde_json::json!({
            "matchId": "m1",
            "players": [{"id": "a", "rating": 1200.0}, {"id": "b", "rating": 1250.0}],
            "gameMode": "10+0",
            "createdAt": "2024-01-01T00:00:00Z"
        });
        let active: ActiveMatch = serde_json::from_value(json).unwrap();
        assert_eq!(active.player_ids(), vec!["a", "b"]);
        assert_eq!(active.players[0].rd, DEFAULT_RD);
        assert!(active.started_at.is_none());
        assert!(active.server.is_none());
    }
}
