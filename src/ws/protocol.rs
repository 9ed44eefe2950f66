//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::game::{Action, Inbound, Move, PlayerStatus};

/// Envelope `type` for game actions
pub const MSG_GAME_DATA: &str = "gameData";
/// Envelope `type` asking for a fresh state
pub const MSG_SYNC: &str = "sync";

/// Frame sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Option<GameData>,
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GameData {
    #[serde(default)]
    pub action: Option<GameAction>,
    /// Game-specific move payload, e.g. UCI
    #[serde(rename = "move", default)]
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GameAction {
    Abort,
    Resign,
    OfferDraw,
    DeclineDraw,
    Move,
    #[serde(other)]
    Unknown,
}

impl ClientEnvelope {
    /// Turn a decoded frame into a server-side instruction. A missing
    /// `createdAt` is read as "sent now", which earns no lag credit.
    pub fn into_inbound(self, player_id: &str, now: DateTime<Utc>) -> Inbound {
        match self.kind.as_str() {
            MSG_SYNC => Inbound::Sync,
            MSG_GAME_DATA => {
                let data = self.data.unwrap_or_default();
                let action = match (data.action, data.payload) {
                    (Some(GameAction::Abort), _) => Action::Abort,
                    (Some(GameAction::Resign), _) => Action::Resign,
                    (Some(GameAction::OfferDraw), _) => Action::OfferDraw,
                    (Some(GameAction::DeclineDraw), _) => Action::DeclineDraw,
                    (Some(GameAction::Move), Some(payload)) => Action::Play(payload),
                    (action, _) => {
                        debug!(player_id = %player_id, ?action, "Ignoring game data without a usable action");
                        return Inbound::Ignore;
                    }
                };
                Inbound::Move(Move {
                    player_id: player_id.to_string(),
                    action,
                    created_at: self.created_at.unwrap_or(now),
                })
            }
            other => {
                debug!(player_id = %player_id, kind = %other, "Ignoring unknown message type");
                Inbound::Ignore
            }
        }
    }
}

/// Per-player clock and connection state as shown to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStateView {
    pub id: String,
    pub status: PlayerStatus,
    /// Remaining clock in milliseconds
    pub clock: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStateView {
    pub outcome: String,
    pub method: String,
    #[serde(rename = "fen")]
    pub position: String,
    pub player_states: Vec<PlayerStateView>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawOfferStatus {
    Pending,
    Declined,
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMsg {
    GameState {
        game: GameStateView,
    },

    PlayerStatus {
        #[serde(rename = "playerId")]
        player_id: String,
        status: PlayerStatus,
    },

    DrawOffer {
        status: DrawOfferStatus,
        #[serde(rename = "createdAt")]
        created_at: DateTime<Utc>,
    },

    Error {
        error: String,
    },
}

impl ServerMsg {
    pub fn error(code: ErrorCode) -> Self {
        ServerMsg::Error {
            error: code.to_string(),
        }
    }
}

/// Reasons a move is bounced back to its sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidMove,
    WrongTurn { want: String, got: String },
    InvalidPly,
    InvalidPlayerId,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::InvalidMove => f.write_str("INVALID_MOVE"),
            ErrorCode::WrongTurn { want, got } => write!(f, "WRONG_TURN: want {want} - got {got}"),
            ErrorCode::InvalidPly => f.write_str("INVALID_PLY"),
            ErrorCode::InvalidPlayerId => f.write_str("INVALID_PLAYER_ID"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(text: &str) -> Inbound {
        serde_json::from_str::<ClientEnvelope>(text)
            .unwrap()
            .into_inbound("p1", Utc::now())
    }

    #[test]
    fn decodes_move_with_timestamp() {
        let inbound = decode(
            r#"{"type":"gameData","data":{"action":"move","move":"e2e4"},"createdAt":"2024-05-01T10:00:00.250Z"}"#,
        );
        let Inbound::Move(mv) = inbound else {
            panic!("expected a move, got {inbound:?}");
        };
        assert_eq!(mv.player_id, "p1");
        assert_eq!(mv.action, Action::Play("e2e4".into()));
        assert_eq!(mv.created_at.to_rfc3339(), "2024-05-01T10:00:00.250+00:00");
    }

    #[test]
    fn decodes_control_actions() {
        for (action, expected) in [
            ("abort", Action::Abort),
            ("resign", Action::Resign),
            ("offerDraw", Action::OfferDraw),
            ("declineDraw", Action::DeclineDraw),
        ] {
            let text = format!(r#"{{"type":"gameData","data":{{"action":"{action}"}}}}"#);
            assert!(matches!(decode(&text), Inbound::Move(mv) if mv.action == expected));
        }
    }

    #[test]
    fn sync_and_unknown_frames() {
        assert!(matches!(decode(r#"{"type":"sync"}"#), Inbound::Sync));
        assert!(matches!(decode(r#"{"type":"chat","data":{}}"#), Inbound::Ignore));
        assert!(matches!(
            decode(r#"{"type":"gameData","data":{"action":"teleport"}}"#),
            Inbound::Ignore
        ));
        assert!(matches!(
            decode(r#"{"type":"gameData","data":{"action":"move"}}"#),
            Inbound::Ignore
        ));
    }

    #[test]
    fn malformed_frames_fail_to_decode() {
        assert!(serde_json::from_str::<ClientEnvelope>("not json").is_err());
        assert!(serde_json::from_str::<ClientEnvelope>(r#"{"data":{}}"#).is_err());
    }

    #[test]
    fn server_messages_are_tagged() {
        let msg = ServerMsg::PlayerStatus {
            player_id: "p2".into(),
            status: PlayerStatus::Disconnected,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "playerStatus", "playerId": "p2", "status": "DISCONNECTED"})
        );

        let state = ServerMsg::GameState {
            game: GameStateView {
                outcome: "*".into(),
                method: String::new(),
                position: "e2e4".into(),
                player_states: vec![PlayerStateView {
                    id: "p1".into(),
                    status: PlayerStatus::Connected,
                    clock: 600_000,
                }],
            },
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["type"], "gameState");
        assert_eq!(json["game"]["fen"], "e2e4");
        assert_eq!(json["game"]["playerStates"][0]["clock"], 600_000);
    }

    #[test]
    fn error_codes_render() {
        let wrong = ErrorCode::WrongTurn {
            want: "a".into(),
            got: "b".into(),
        };
        assert_eq!(wrong.to_string(), "WRONG_TURN: want a - got b");
        let json = serde_json::to_value(ServerMsg::error(ErrorCode::InvalidPly)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "error", "error": "INVALID_PLY"}));
    }
}
