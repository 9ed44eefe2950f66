//! Matchmaker - opportunistic pairing over the ticket pool

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::notify::{PeerError, QueueNotifier, ServerPool};
use super::ticket::{compatible, RatingProjector, TicketError, TicketRequest};
use crate::store::{ActiveMatch, MatchPlayer, MatchStore, MatchmakingTicket, StoreError};

/// Attempts at finding a server address before giving up
pub const SERVER_LOOKUP_ATTEMPTS: u32 = 5;
pub const SERVER_LOOKUP_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum MatchmakingOutcome {
    Matched {
        #[serde(rename = "match")]
        active: ActiveMatch,
    },
    Queued,
}

#[derive(Debug, thiserror::Error)]
pub enum MatchmakingError {
    #[error(transparent)]
    Ticket(#[from] TicketError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("server pool error: {0}")]
    Server(#[from] PeerError),

    #[error("no game server available")]
    NoServer,

    #[error("every candidate was taken, try again")]
    Contended,
}

pub struct Matchmaker {
    store: Arc<dyn MatchStore>,
    servers: Arc<dyn ServerPool>,
    notifier: Arc<dyn QueueNotifier>,
    ratings: Arc<dyn RatingProjector>,
}

impl Matchmaker {
    pub fn new(
        store: Arc<dyn MatchStore>,
        servers: Arc<dyn ServerPool>,
        notifier: Arc<dyn QueueNotifier>,
        ratings: Arc<dyn RatingProjector>,
    ) -> Self {
        Self {
            store,
            servers,
            notifier,
            ratings,
        }
    }

    /// Pair `user_id` with a waiting compatible ticket, or queue it.
    pub async fn find_match(
        &self,
        user_id: &str,
        request: TicketRequest,
    ) -> Result<MatchmakingOutcome, MatchmakingError> {
        let ticket = request.into_ticket(user_id, Utc::now())?;
        self.servers.ensure_running().await?;

        if let Some(match_id) = self.store.get_user_match(user_id).await? {
            return self.existing(user_id, &match_id).await;
        }

        let candidates: Vec<MatchmakingTicket> = self
            .store
            .scan_tickets(&ticket.game_mode)
            .await?
            .into_iter()
            .filter(|other| compatible(&ticket, other))
            .collect();

        if candidates.is_empty() {
            self.store.put_ticket(&ticket).await?;
            info!(user_id = %user_id, game_mode = %ticket.game_mode, "Ticket queued");
            return Ok(MatchmakingOutcome::Queued);
        }

        let match_id = Uuid::new_v4().to_string();
        for opponent in &candidates {
            match self.store.put_user_match(user_id, &match_id).await {
                Ok(()) => {}
                // Paired by someone else in the meantime
                Err(StoreError::Conflict) => {
                    return match self.store.get_user_match(user_id).await? {
                        Some(bound) => self.existing(user_id, &bound).await,
                        None => Err(MatchmakingError::Contended),
                    };
                }
                Err(e) => return Err(e.into()),
            }

            match self.store.put_user_match(&opponent.user_id, &match_id).await {
                Ok(()) => return self.create(&match_id, opponent, &ticket).await,
                Err(StoreError::Conflict) => {
                    info!(user_id = %user_id, opponent = %opponent.user_id, "Candidate already taken");
                    self.store.delete_user_match(user_id).await?;
                }
                Err(e) => {
                    self.store.delete_user_match(user_id).await?;
                    return Err(e.into());
                }
            }
        }

        Err(MatchmakingError::Contended)
    }

    /// The user is already bound to a match.
    async fn existing(&self, user_id: &str, match_id: &str) -> Result<MatchmakingOutcome, MatchmakingError> {
        let mut active = match self.store.get_match(match_id).await {
            Ok(active) => active,
            Err(StoreError::NotFound) => {
                warn!(user_id = %user_id, match_id = %match_id, "User bound to a missing match, reporting queued");
                return Ok(MatchmakingOutcome::Queued);
            }
            Err(e) => return Err(e.into()),
        };
        if active.server.is_none() {
            active.server = Some(self.resolve_server().await?);
        }
        Ok(MatchmakingOutcome::Matched { active })
    }

    async fn create(
        &self,
        match_id: &str,
        opponent: &MatchmakingTicket,
        ticket: &MatchmakingTicket,
    ) -> Result<MatchmakingOutcome, MatchmakingError> {
        let server = match self.resolve_server().await {
            Ok(server) => server,
            Err(e) => {
                self.release(&[ticket.user_id.as_str(), opponent.user_id.as_str()]).await;
                return Err(e);
            }
        };

        // The queued player starts
        let players = vec![self.seat(opponent, ticket), self.seat(ticket, opponent)];
        let active = ActiveMatch {
            match_id: match_id.to_string(),
            conversation_id: None,
            average_rating: (opponent.user_rating + ticket.user_rating) / 2.0,
            players,
            game_mode: ticket.game_mode.clone(),
            server: Some(server),
            created_at: Utc::now(),
            started_at: None,
        };

        if let Err(e) = self.store.put_match(&active).await {
            self.release(&[ticket.user_id.as_str(), opponent.user_id.as_str()]).await;
            return Err(e.into());
        }

        for user in [&opponent.user_id, &ticket.user_id] {
            if let Err(e) = self.store.delete_ticket(user).await {
                warn!(user_id = %user, error = %e, "Failed to delete ticket");
            }
        }
        if let Err(e) = self.store.put_spectator_channel(match_id).await {
            warn!(match_id = %match_id, error = %e, "Failed to create spectator channel");
        }
        if let Err(e) = self.notifier.match_found(&opponent.user_id, &active).await {
            warn!(user_id = %opponent.user_id, error = %e, "Failed to notify queued player");
        }

        info!(
            match_id = %match_id,
            players = ?active.player_ids(),
            game_mode = %active.game_mode,
            "Match created"
        );
        Ok(MatchmakingOutcome::Matched { active })
    }

    fn seat(&self, player: &MatchmakingTicket, opponent: &MatchmakingTicket) -> MatchPlayer {
        let projection = self.ratings.project(player, opponent);
        MatchPlayer {
            id: player.user_id.clone(),
            rating: player.user_rating,
            rd: player.user_rd,
            new_ratings: projection.ratings,
            new_rds: projection.rds,
        }
    }

    async fn resolve_server(&self) -> Result<String, MatchmakingError> {
        for attempt in 1..=SERVER_LOOKUP_ATTEMPTS {
            if let Some(address) = self.servers.server_address().await? {
                return Ok(address);
            }
            if attempt < SERVER_LOOKUP_ATTEMPTS {
                tokio::time::sleep(SERVER_LOOKUP_BACKOFF).await;
            }
        }
        Err(MatchmakingError::NoServer)
    }

    async fn release(&self, user_ids: &[&str]) {
        for &user_id in user_ids {
            if let Err(e) = self.store.delete_user_match(user_id).await {
                warn!(user_id = %user_id, error = %e, "Failed to release user binding");
            }
        }
    }
}
