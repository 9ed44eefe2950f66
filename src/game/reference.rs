//! Reference two-sided rules: coordinate moves, resignation and draw offers.
//!
//! Board legality is out of scope here. A move is accepted when it is a
//! well-formed coordinate move (`e2e4`, `e7e8q`) made by the side on turn.
//! The position blob is the space separated move list, which is also what
//! a resumed match is rebuilt from.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::logic::{
    DrawResponse, GameError, GameLogic, GameRules, MatchSetup, MoveRejected, Outcome, Seat, Side,
};
use super::mode::MatchConfig;
use super::player::PlayerStatus;
use super::record::MatchRecord;
use crate::store::{ActiveMatch, MatchSnapshot};

pub const WHITE: &str = "white";
pub const BLACK: &str = "black";

/// How long a draw offer stays open, in seconds
const DRAW_OFFER_WINDOW_SECS: i64 = 20;

const METHOD_RESIGNATION: &str = "RESIGNATION";
const METHOD_AGREEMENT: &str = "DRAW_AGREEMENT";

#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceRules;

impl ReferenceRules {
    fn seats(
        active: &ActiveMatch,
        clock_of: impl Fn(&str) -> Option<Duration>,
        status: PlayerStatus,
    ) -> Result<Vec<Seat>, GameError> {
        if active.players.len() != 2 {
            return Err(GameError::PlayerCount(active.players.len()));
        }
        active
            .players
            .iter()
            .zip([WHITE, BLACK])
            .map(|(player, side)| {
                let clock = clock_of(&player.id).ok_or_else(|| {
                    GameError::CorruptSnapshot(format!("no clock for player {}", player.id))
                })?;
                Ok(Seat {
                    player_id: player.id.clone(),
                    side: Side::new(side),
                    clock,
                    status,
                })
            })
            .collect()
    }
}

impl GameRules for ReferenceRules {
    fn on_match_create(
        &self,
        active: &ActiveMatch,
        config: &MatchConfig,
    ) -> Result<MatchSetup, GameError> {
        let seats = Self::seats(active, |_| Some(config.match_duration), PlayerStatus::Init)?;
        Ok(MatchSetup {
            logic: Box::new(ReferenceGame::default()),
            seats,
            starter: Side::new(WHITE),
        })
    }

    fn on_match_resume(
        &self,
        active: &ActiveMatch,
        _config: &MatchConfig,
        snapshot: &MatchSnapshot,
    ) -> Result<MatchSetup, GameError> {
        let game = ReferenceGame::restore(&snapshot.game_state)?;
        let status = if active.started_at.is_some() {
            PlayerStatus::Disconnected
        } else {
            PlayerStatus::Init
        };
        let seats = Self::seats(
            active,
            |id| snapshot.player_states.get(id).map(|s| s.clock),
            status,
        )?;
        Ok(MatchSetup {
            logic: Box::new(game),
            seats,
            starter: Side::new(WHITE),
        })
    }
}

#[derive(Debug, Default, Clone)]
pub struct ReferenceGame {
    moves: Vec<String>,
    result: Option<(Outcome, &'static str)>,
    draw_offer: Option<(Side, DateTime<Utc>)>,
}

impl ReferenceGame {
    pub fn restore(position: &str) -> Result<Self, GameError> {
        let moves: Vec<String> = position.split_whitespace().map(str::to_string).collect();
        if let Some(bad) = moves.iter().find(|m| !is_coordinate_move(m)) {
            return Err(GameError::CorruptSnapshot(format!("bad move {bad:?}")));
        }
        Ok(Self {
            moves,
            ..Self::default()
        })
    }

    fn numbered(&self, result: &str) -> String {
        let mut out = String::new();
        for (i, pair) in self.moves.chunks(2).enumerate() {
            out.push_str(&format!("{}. {} ", i + 1, pair.join(" ")));
        }
        out.push_str(result);
        out
    }

    fn opponent(side: &Side) -> Side {
        if side.as_str() == WHITE {
            Side::new(BLACK)
        } else {
            Side::new(WHITE)
        }
    }
}

impl GameLogic for ReferenceGame {
    fn current_turn(&self) -> Side {
        if self.moves.len() % 2 == 0 {
            Side::new(WHITE)
        } else {
            Side::new(BLACK)
        }
    }

    fn ply(&self) -> u32 {
        self.moves.len() as u32
    }

    fn position(&self) -> String {
        self.moves.join(" ")
    }

    fn outcome(&self) -> Outcome {
        self.result
            .as_ref()
            .map(|(outcome, _)| outcome.clone())
            .unwrap_or(Outcome::Undecided)
    }

    fn method(&self) -> String {
        self.result
            .as_ref()
            .map(|(_, method)| method.to_string())
            .unwrap_or_default()
    }

    fn handle_move(&mut self, _side: &Side, payload: &str) -> Result<(), MoveRejected> {
        if self.result.is_some() {
            return Err(MoveRejected("game is over".into()));
        }
        if !is_coordinate_move(payload) {
            return Err(MoveRejected(format!("malformed move {payload:?}")));
        }
        self.moves.push(payload.to_string());
        Ok(())
    }

    fn resign(&mut self, side: &Side) {
        if self.result.is_none() {
            self.result = Some((Outcome::Win(Self::opponent(side)), METHOD_RESIGNATION));
        }
    }

    fn offer_draw(&mut self, side: &Side, at: DateTime<Utc>) -> DrawResponse {
        if self.result.is_some() {
            return DrawResponse::Ignored;
        }
        let window = chrono::Duration::seconds(DRAW_OFFER_WINDOW_SECS);
        match &self.draw_offer {
            Some((offerer, when)) if at - *when <= window => {
                if offerer == side {
                    DrawResponse::Ignored
                } else {
                    self.result = Some((Outcome::Draw, METHOD_AGREEMENT));
                    self.draw_offer = None;
                    DrawResponse::Agreed
                }
            }
            _ => {
                self.draw_offer = Some((side.clone(), at));
                DrawResponse::Pending
            }
        }
    }

    fn decline_draw(&mut self, side: &Side) -> bool {
        match &self.draw_offer {
            Some((offerer, _)) if offerer != side => {
                self.draw_offer = None;
                true
            }
            _ => false,
        }
    }

    fn last_move(&self) -> Option<String> {
        self.moves.last().cloned()
    }

    fn transcript(&self) -> String {
        self.numbered(&self.describe_outcome(&self.outcome()))
    }

    /// Clock verdicts are decided outside the rules; stamp them on the record.
    fn on_match_end(&mut self, record: &mut MatchRecord) {
        record.pgn = self.numbered(&record.outcome);
    }

    fn describe_outcome(&self, outcome: &Outcome) -> String {
        match outcome {
            Outcome::Undecided => "*".to_string(),
            Outcome::Draw => "1/2-1/2".to_string(),
            Outcome::Win(side) if side.as_str() == WHITE => "1-0".to_string(),
            Outcome::Win(_) => "0-1".to_string(),
        }
    }
}

/// `e2e4` or `e7e8q`
fn is_coordinate_move(payload: &str) -> bool {
    let bytes = payload.as_bytes();
    let square = |file: u8, rank: u8| (b'a'..=b'h').contains(&file) && (b'1'..=b'8').contains(&rank);
    match bytes.len() {
        4 | 5 => {
            square(bytes[0], bytes[1])
                && square(bytes[2], bytes[3])
                && bytes[0..2] != bytes[2..4]
                && bytes.get(4).map_or(true, |p| b"qrbn".contains(p))
        }
        _ => false,
    }
}
