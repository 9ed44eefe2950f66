//! Final records handed to the match finalizer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::logic::{Outcome, Side};
use crate::store::MatchPlayer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPlayer {
    pub id: String,
    pub old_rating: f64,
    pub new_rating: f64,
    #[serde(rename = "oldRD")]
    pub old_rd: f64,
    #[serde(rename = "newRD")]
    pub new_rd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRecord {
    pub match_id: String,
    pub players: Vec<RecordPlayer>,
    pub pgn: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    /// Score per player, in `players` order
    pub results: Vec<f64>,
    pub outcome: String,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortRecord {
    pub match_id: String,
    pub player_ids: Vec<String>,
}

/// Score for `side` under `outcome`: 1 win, 0 loss, 0.5 otherwise.
pub fn score_for(outcome: &Outcome, side: &Side) -> f64 {
    match outcome {
        Outcome::Win(winner) if winner == side => 1.0,
        Outcome::Win(_) => 0.0,
        Outcome::Draw | Outcome::Undecided => 0.5,
    }
}

/// Pick the pre-computed projection matching the result. Undecided matches
/// leave ratings untouched.
pub fn project_rating(seat: &MatchPlayer, outcome: &Outcome, score: f64) -> RecordPlayer {
    let index = match outcome {
        Outcome::Undecided => None,
        _ if score >= 1.0 => Some(0),
        _ if score <= 0.0 => Some(2),
        _ => Some(1),
    };
    let pick = |values: &[f64], fallback: f64| {
        index
            .and_then(|i| values.get(i).copied())
            .unwrap_or(fallback)
    };

    RecordPlayer {
        id: seat.id.clone(),
        old_rating: seat.rating,
        new_rating: pick(&seat.new_ratings, seat.rating),
        old_rd: seat.rd,
        new_rd: pick(&seat.new_rds, seat.rd),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seat() -> MatchPlayer {
        MatchPlayer {
            id: "a".into(),
            rating: 1500.0,
            rd: 200.0,
            new_ratings: vec![1520.0, 1500.5, 1480.0],
            new_rds: vec![190.0, 191.0, 192.0],
        }
    }

    #[test]
    fn scores_by_outcome() {
        let white = Side::new("white");
        let black = Side::new("black");
        assert_eq!(score_for(&Outcome::Win(white.clone()), &white), 1.0);
        assert_eq!(score_for(&Outcome::Win(white), &black), 0.0);
        assert_eq!(score_for(&Outcome::Draw, &black), 0.5);
        assert_eq!(score_for(&Outcome::Undecided, &black), 0.5);
    }

    #[test]
    fn projections_follow_result() {
        let white = Side::new("white");
        let win = project_rating(&seat(), &Outcome::Win(white.clone()), 1.0);
        assert_eq!((win.new_rating, win.new_rd), (1520.0, 190.0));

        let loss = project_rating(&seat(), &Outcome::Win(white), 0.0);
        assert_eq!((loss.new_rating, loss.new_rd), (1480.0, 192.0));

        let draw = project_rating(&seat(), &Outcome::Draw, 0.5);
        assert_eq!(draw.new_rating, 1500.5);

        let cancelled = project_rating(&seat(), &Outcome::Undecided, 0.5);
        assert_eq!((cancelled.new_rating, cancelled.new_rd), (1500.0, 200.0));
    }

    #[test]
    fn missing_projections_keep_old_rating() {
        let mut seat = seat();
        seat.new_ratings.clear();
        let rec = project_rating(&seat, &Outcome::Draw, 0.5);
        assert_eq!(rec.new_rating, 1500.0);
        assert_eq!(rec.old_rd, 200.0);
    }

    #[test]
    fn record_wire_shape() {
        let rec = project_rating(&seat(), &Outcome::Draw, 0.5);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["oldRating"], 1500.0);
        assert_eq!(json["oldRD"], 200.0);
        assert_eq!(json["newRD"], 191.0);
    }
}
