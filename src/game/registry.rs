//! Process-wide map of live matches

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::logic::{GameError, GameRules, MatchSetup};
use super::mode::{GameMode, MatchConfig};
use super::r#match::{Match, MatchHooks};
use super::player::PlayerStatus;
use crate::protection::ProtectionGovernor;
use crate::store::{ActiveMatch, MatchStore, StoreError};
use crate::util::time::elapsed_since;

/// An unstarted match older than this is abandoned
const UNSTARTED_EXPIRY: Duration = Duration::from_secs(2 * 60);

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("match not found")]
    NotFound,

    #[error("match expired")]
    Expired,

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("match setup failed: {0}")]
    Setup(#[from] GameError),
}

impl From<StoreError> for LoadError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => LoadError::NotFound,
            other => LoadError::Store(other),
        }
    }
}

pub struct MatchRegistry {
    matches: DashMap<String, Arc<Match>>,
    load_lock: Mutex<()>,
    active: AtomicUsize,
    store: Arc<dyn MatchStore>,
    rules: Arc<dyn GameRules>,
    hooks: Arc<dyn MatchHooks>,
    protection: Arc<ProtectionGovernor>,
    max_lag_forgiven: Duration,
}

impl MatchRegistry {
    pub fn new(
        store: Arc<dyn MatchStore>,
        rules: Arc<dyn GameRules>,
        hooks: Arc<dyn MatchHooks>,
        protection: Arc<ProtectionGovernor>,
        max_lag_forgiven: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            matches: DashMap::new(),
            load_lock: Mutex::new(()),
            active: AtomicUsize::new(0),
            store,
            rules,
            hooks,
            protection,
            max_lag_forgiven,
        })
    }

    pub fn get(&self, match_id: &str) -> Option<Arc<Match>> {
        self.matches.get(match_id).map(|m| m.value().clone())
    }

    pub fn active_matches(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Return the live match for `match_id`, building it from the store
    /// (fresh or from its latest snapshot) on first use.
    pub async fn load(self: &Arc<Self>, match_id: &str) -> Result<Arc<Match>, LoadError> {
        if let Some(game) = self.get(match_id) {
            return Ok(game);
        }

        let active = self.store.get_match(match_id).await?;
        let mode: GameMode = active
            .game_mode
            .parse()
            .map_err(|_| GameError::UnknownGameMode(active.game_mode.clone()))?;
        let config = mode.config(self.max_lag_forgiven);

        if is_expired(&active, &config, Utc::now()) {
            info!(match_id = %match_id, "Match expired before load");
            self.remove_expired(&active).await;
            return Err(LoadError::Expired);
        }

        let _guard = self.load_lock.lock().await;
        if let Some(game) = self.get(match_id) {
            return Ok(game);
        }

        let snapshot = self.store.fetch_latest_snapshot(match_id).await?;
        let (setup, arm) = match &snapshot {
            Some(snapshot) => {
                let setup = self.rules.on_match_resume(&active, &config, snapshot)?;
                let arm = if active.started_at.is_some() {
                    turn_clock(&setup)
                } else {
                    config.cancel_timeout
                };
                info!(match_id = %match_id, ply = snapshot.ply, "Resuming match from snapshot");
                (setup, arm)
            }
            None => (self.rules.on_match_create(&active, &config)?, config.cancel_timeout),
        };

        let (game, worker) = Match::new(
            match_id,
            config,
            setup,
            active.players.clone(),
            active.started_at,
            arm,
            self.hooks.clone(),
        );

        self.protection.arm(config.protection_horizon()).await;
        self.matches.insert(match_id.to_string(), game.clone());
        let count = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        info!(match_id = %match_id, game_mode = %mode, active = count, "Match loaded");

        let registry = self.clone();
        let id = match_id.to_string();
        tokio::spawn(async move {
            worker.run().await;
            registry.remove(&id).await;
        });

        Ok(game)
    }

    async fn remove(&self, match_id: &str) {
        if self.matches.remove(match_id).is_none() {
            return;
        }
        let left = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        info!(match_id = %match_id, active = left, "Match removed");
        if left == 0 {
            self.protection.skip().await;
        }
    }

    /// Drop an abandoned match with its user bindings and spectator channel.
    async fn remove_expired(&self, active: &ActiveMatch) {
        let match_id = active.match_id.as_str();
        if let Err(e) = self.store.delete_match(match_id).await {
            warn!(match_id = %match_id, error = %e, "Failed to delete expired match");
        }
        for player_id in active.player_ids() {
            if let Err(e) = self.store.delete_user_match(&player_id).await {
                warn!(match_id = %match_id, player_id = %player_id, error = %e, "Failed to delete user binding");
            }
        }
        if let Err(e) = self.store.delete_spectator_channel(match_id).await {
            warn!(match_id = %match_id, error = %e, "Failed to delete spectator channel");
        }
    }
}

/// Stored matches nobody finished: unstarted ones after two minutes, started
/// ones after twice their duration plus two minutes.
pub fn is_expired(active: &ActiveMatch, config: &MatchConfig, now: DateTime<Utc>) -> bool {
    match active.started_at {
        None => elapsed_since(active.created_at, now) > UNSTARTED_EXPIRY,
        Some(started_at) => elapsed_since(started_at, now) > config.expiry_horizon(),
    }
}

/// Clock of the seat on turn in a freshly built setup
fn turn_clock(setup: &MatchSetup) -> Duration {
    let turn = setup.logic.current_turn();
    setup
        .seats
        .iter()
        .find(|seat| seat.side == turn)
        .map(|seat| seat.clock)
        .unwrap_or_default()
}
