//! Matchmaking tickets: validation, compatibility and rating projections

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::game::GameMode;
use crate::store::{MatchmakingTicket, DEFAULT_RD};

/// Body of a matchmaking request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketRequest {
    pub game_mode: String,
    pub min_rating: f64,
    pub max_rating: f64,
    #[serde(default)]
    pub ranked: bool,
    pub rating: f64,
    #[serde(default)]
    pub rd: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TicketError {
    #[error("unsupported game mode: {0}")]
    UnknownGameMode(String),

    #[error("ratings must be finite numbers")]
    NotFinite,

    #[error("rating band is inverted ({min} > {max})")]
    InvertedBand { min: f64, max: f64 },

    #[error("rating {rating} is outside the requested band")]
    OutsideBand { rating: f64 },
}

impl TicketRequest {
    /// Check the request and turn it into a pool ticket for `user_id`.
    pub fn into_ticket(self, user_id: &str, now: DateTime<Utc>) -> Result<MatchmakingTicket, TicketError> {
        self.game_mode
            .parse::<GameMode>()
            .map_err(|_| TicketError::UnknownGameMode(self.game_mode.clone()))?;

        let rd = self.rd.unwrap_or(DEFAULT_RD);
        if ![self.min_rating, self.max_rating, self.rating, rd]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(TicketError::NotFinite);
        }
        if self.min_rating > self.max_rating {
            return Err(TicketError::InvertedBand {
                min: self.min_rating,
                max: self.max_rating,
            });
        }
        if self.ranked && !(self.min_rating..=self.max_rating).contains(&self.rating) {
            return Err(TicketError::OutsideBand { rating: self.rating });
        }

        Ok(MatchmakingTicket {
            user_id: user_id.to_string(),
            user_rating: self.rating,
            user_rd: rd,
            min_rating: self.min_rating,
            max_rating: self.max_rating,
            game_mode: self.game_mode,
            ranked: self.ranked,
            created_at: now,
        })
    }
}

/// Same mode and ranking, and for ranked play each rating sits inside the
/// other's band.
pub fn compatible(user: &MatchmakingTicket, other: &MatchmakingTicket) -> bool {
    if user.user_id == other.user_id || user.game_mode != other.game_mode || user.ranked != other.ranked {
        return false;
    }
    if !user.ranked {
        return true;
    }
    (other.min_rating..=other.max_rating).contains(&user.user_rating)
        && (user.min_rating..=user.max_rating).contains(&other.user_rating)
}

/// Post-match ratings for a win, a draw and a loss, in that order
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub ratings: Vec<f64>,
    pub rds: Vec<f64>,
}

pub trait RatingProjector: Send + Sync {
    fn project(&self, player: &MatchmakingTicket, opponent: &MatchmakingTicket) -> Projection;
}

/// Keeps every rating where it is
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatRatingProjector;

impl RatingProjector for FlatRatingProjector {
    fn project(&self, player: &MatchmakingTicket, _opponent: &MatchmakingTicket) -> Projection {
        Projection {
            ratings: vec![player.user_rating; 3],
            rds: vec![player.user_rd; 3],
        }
    }
}
