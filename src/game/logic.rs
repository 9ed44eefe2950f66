//! Capability set a game supplies to the match server.
//!
//! [`GameRules`] is the per-process factory: it seats players for a new or
//! resumed match and decodes inbound frames. [`GameLogic`] is the per-match
//! rule state the [`Match`](super::Match) drives from its worker. The core
//! never interprets a move payload itself.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::mode::MatchConfig;
use super::player::{Player, PlayerStatus};
use super::record::MatchRecord;
use crate::store::{ActiveMatch, MatchSnapshot};
use crate::ws::protocol::ClientEnvelope;

/// Game-specific side tag ("white", "black", ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Side(String);

impl Side {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a match as far as the core needs to know it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Undecided,
    Draw,
    Win(Side),
}

impl Outcome {
    pub fn is_decided(&self) -> bool {
        !matches!(self, Outcome::Undecided)
    }
}

/// How the rules reacted to a draw offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawResponse {
    /// Both sides want the draw; the outcome is now a draw.
    Agreed,
    /// The offer stands until the opponent answers.
    Pending,
    /// Nothing changed (repeat offer, game over, ...).
    Ignored,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("rejected move: {0}")]
pub struct MoveRejected(pub String);

/// Control action carried by a [`Move`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Abort,
    Resign,
    OfferDraw,
    DeclineDraw,
    /// Ordinary move with its game-opaque payload (e.g. UCI)
    Play(String),
}

/// Event placed on a match's move queue
#[derive(Debug, Clone)]
pub struct Move {
    pub player_id: String,
    pub action: Action,
    /// Client-side send time, used for lag compensation
    pub created_at: DateTime<Utc>,
}

/// What the server should do with a decoded frame
#[derive(Debug, Clone)]
pub enum Inbound {
    Move(Move),
    Sync,
    Ignore,
}

/// One seated player produced by [`GameRules`]
#[derive(Debug, Clone)]
pub struct Seat {
    pub player_id: String,
    pub side: Side,
    pub clock: Duration,
    pub status: PlayerStatus,
}

/// Everything a match needs from the rules at construction time
pub struct MatchSetup {
    pub logic: Box<dyn GameLogic>,
    pub seats: Vec<Seat>,
    /// Side whose first join starts the match
    pub starter: Side,
}

#[derive(Debug, thiserror::Error)]
pub enum GameError {
    #[error("unknown game mode: {0}")]
    UnknownGameMode(String),

    #[error("unsupported player count: {0}")]
    PlayerCount(usize),

    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),
}

/// Per-match rule state. Called with the match mutex held, so every method
/// must be synchronous and quick.
pub trait GameLogic: Send + 'static {
    fn current_turn(&self) -> Side;

    fn ply(&self) -> u32;

    /// Opaque position blob sent to clients and persisted in snapshots
    fn position(&self) -> String;

    fn outcome(&self) -> Outcome;

    /// Rule-level reason for the outcome, empty while undecided
    fn method(&self) -> String;

    /// Validate and apply a move for `side`. Only called when it is `side`'s turn.
    fn handle_move(&mut self, side: &Side, payload: &str) -> Result<(), MoveRejected>;

    fn resign(&mut self, side: &Side);

    fn offer_draw(&mut self, side: &Side, at: DateTime<Utc>) -> DrawResponse;

    /// Returns true if a pending offer was declined.
    fn decline_draw(&mut self, side: &Side) -> bool;

    fn last_move(&self) -> Option<String>;

    /// Full human-readable record of the game (PGN-like)
    fn transcript(&self) -> String;

    fn describe_outcome(&self, outcome: &Outcome) -> String {
        match outcome {
            Outcome::Undecided => "*".to_string(),
            Outcome::Draw => "1/2-1/2".to_string(),
            Outcome::Win(side) => format!("{side} wins"),
        }
    }

    fn on_player_join(&mut self, _player: &Player) {}

    fn on_player_leave(&mut self, _player: &Player) {}

    fn on_player_sync(&mut self, _player: &Player) {}

    fn on_match_save(&mut self, _snapshot: &mut MatchSnapshot) {}

    fn on_match_end(&mut self, _record: &mut MatchRecord) {}

    fn on_match_abort(&mut self) {}
}

/// Process-wide game binding
pub trait GameRules: Send + Sync {
    fn on_match_create(
        &self,
        active: &ActiveMatch,
        config: &MatchConfig,
    ) -> Result<MatchSetup, GameError>;

    fn on_match_resume(
        &self,
        active: &ActiveMatch,
        config: &MatchConfig,
        snapshot: &MatchSnapshot,
    ) -> Result<MatchSetup, GameError>;

    /// Decode one text frame from `player_id`.
    ///
    /// The default understands the standard envelope: `gameData` frames carry
    /// an action, `sync` asks for a fresh state, anything else is ignored.
    fn on_handle_message(&self, player_id: &str, text: &str) -> Result<Inbound, serde_json::Error> {
        let envelope: ClientEnvelope = serde_json::from_str(text)?;
        Ok(envelope.into_inbound(player_id, Utc::now()))
    }
}
