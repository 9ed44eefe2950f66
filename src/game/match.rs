//! Authoritative per-match state machine and its single-consumer worker

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::clock::{charge_move, is_from_future, ClockTimer};
use super::logic::{Action, DrawResponse, GameLogic, MatchSetup, Move, Outcome, Side};
use super::mode::MatchConfig;
use super::player::{ConnectionHandle, ControlFrame, Player, PlayerStatus};
use super::record::{project_rating, score_for, AbortRecord, MatchRecord};
use crate::store::{MatchPlayer, MatchSnapshot, SnapshotMove, SnapshotPlayerState};
use crate::util::time::elapsed_since;
use crate::ws::protocol::{
    DrawOfferStatus, ErrorCode, GameStateView, PlayerStateView, ServerMsg,
};

/// Deadline given to every close frame
pub const CLOSE_DEADLINE: Duration = Duration::from_secs(5);

const MOVE_QUEUE_CAPACITY: usize = 64;

pub const METHOD_OUT_OF_TIME: &str = "OUT_OF_TIME";
pub const METHOD_DISCONNECT_TIMEOUT: &str = "DISCONNECT_TIMEOUT";
pub const METHOD_DRAW_BY_TIMEOUT: &str = "DRAW_BY_TIMEOUT";

pub const REASON_ENDED: &str = "match ended";
pub const REASON_ABORTED: &str = "match aborted";
pub const REASON_CANCELLED: &str = "match cancelled";

/// Side effects a match asks of the outside world
#[async_trait]
pub trait MatchHooks: Send + Sync {
    /// The starter joined for the first time.
    async fn on_start(&self, match_id: &str, started_at: DateTime<Utc>);

    /// Best-effort; called in ply order from a dedicated task.
    async fn on_save(&self, snapshot: MatchSnapshot);

    /// Awaited by the worker before it exits.
    async fn on_end(&self, record: MatchRecord);

    async fn on_abort(&self, record: AbortRecord);
}

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("player is not part of this match")]
    NotAParticipant,

    #[error("match has ended")]
    MatchEnded,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("unknown player")]
    UnknownPlayer,

    #[error("match has ended")]
    MatchEnded,
}

/// Outcome forced by the clock rather than by the rules
#[derive(Debug, Clone)]
struct Verdict {
    outcome: Outcome,
    method: &'static str,
}

enum Exit {
    Ended(MatchRecord),
    Aborted(AbortRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndCause {
    Outcome,
    ClockExpired,
}

/// What the worker does after deciding a move under the lock
enum Step {
    Reject(ErrorCode),
    Abort,
    DrawNotice(DrawOfferStatus),
    Quiet,
    Advance { arm: Option<Duration> },
}

struct MatchCore {
    ended: bool,
    started_at: Option<DateTime<Utc>>,
    logic: Box<dyn GameLogic>,
    verdict: Option<Verdict>,
    last_mover: Option<String>,
    exit: Option<Exit>,
}

pub struct Match {
    id: String,
    config: MatchConfig,
    starter: Side,
    players: Vec<Arc<Player>>,
    seats: HashMap<String, MatchPlayer>,
    core: Mutex<MatchCore>,
    clock: ClockTimer,
    moves_tx: Mutex<Option<mpsc::Sender<Move>>>,
    saves_tx: mpsc::UnboundedSender<MatchSnapshot>,
    closed: Notify,
    hooks: Arc<dyn MatchHooks>,
}

/// Owns the receiving end of the move queue. Exactly one exists per match.
pub struct MatchWorker {
    game: Arc<Match>,
    moves: mpsc::Receiver<Move>,
}

impl Match {
    /// Build a match and its worker. The clock starts armed for `arm`.
    pub fn new(
        id: impl Into<String>,
        config: MatchConfig,
        setup: MatchSetup,
        seats: Vec<MatchPlayer>,
        started_at: Option<DateTime<Utc>>,
        arm: Duration,
        hooks: Arc<dyn MatchHooks>,
    ) -> (Arc<Self>, MatchWorker) {
        let (moves_tx, moves) = mpsc::channel(MOVE_QUEUE_CAPACITY);
        let (saves_tx, saves_rx) = mpsc::unbounded_channel();

        let players = setup
            .seats
            .into_iter()
            .map(|seat| Arc::new(Player::new(seat.player_id, seat.side, seat.clock, seat.status)))
            .collect::<Vec<_>>();

        // A resumed match is already running: the side on turn pays from now,
        // in step with the clock armed for it.
        if started_at.is_some() {
            let turn = setup.logic.current_turn();
            if let Some(player) = players.iter().find(|p| p.side() == &turn) {
                player.set_turn_started_at(Utc::now());
            }
        }

        let game = Arc::new(Self {
            id: id.into(),
            config,
            starter: setup.starter,
            players,
            seats: seats.into_iter().map(|s| (s.id.clone(), s)).collect(),
            core: Mutex::new(MatchCore {
                ended: false,
                started_at,
                logic: setup.logic,
                verdict: None,
                last_mover: None,
                exit: None,
            }),
            clock: ClockTimer::new(arm),
            moves_tx: Mutex::new(Some(moves_tx)),
            saves_tx,
            closed: Notify::new(),
            hooks: hooks.clone(),
        });

        tokio::spawn(run_saver(hooks, saves_rx));

        let worker = MatchWorker {
            game: game.clone(),
            moves,
        };
        (game, worker)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn players(&self) -> &[Arc<Player>] {
        &self.players
    }

    pub fn player(&self, player_id: &str) -> Option<&Arc<Player>> {
        self.players.iter().find(|p| p.id() == player_id)
    }

    fn player_on(&self, side: &Side) -> Option<&Arc<Player>> {
        self.players.iter().find(|p| p.side() == side)
    }

    pub fn is_ended(&self) -> bool {
        self.core.lock().ended
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.core.lock().started_at
    }

    pub fn ply(&self) -> u32 {
        self.core.lock().logic.ply()
    }

    /// Time left on the match clock timer
    pub fn clock_remaining(&self) -> Duration {
        self.clock.remaining()
    }

    pub fn state_view(&self) -> GameStateView {
        let core = self.core.lock();
        self.view(&core)
    }

    /// Queue a move for the worker.
    pub async fn submit(&self, mv: Move) -> Result<(), SubmitError> {
        if self.player(&mv.player_id).is_none() {
            return Err(SubmitError::UnknownPlayer);
        }
        let tx = self
            .moves_tx
            .lock()
            .clone()
            .ok_or(SubmitError::MatchEnded)?;
        tx.send(mv).await.map_err(|_| SubmitError::MatchEnded)
    }

    /// Attach a connection for `player_id` and bring it up to date.
    pub async fn player_join(&self, player_id: &str, conn: ConnectionHandle) -> Result<(), JoinError> {
        let player = self
            .player(player_id)
            .cloned()
            .ok_or(JoinError::NotAParticipant)?;
        if self.is_ended() {
            return Err(JoinError::MatchEnded);
        }

        let previous = player.status();
        player.set_conn(Some(conn)).await;

        let now = Utc::now();
        let (started, arm, view) = {
            let mut core = self.core.lock();
            if core.ended {
                return Err(JoinError::MatchEnded);
            }

            let mut started = None;
            let mut arm = None;
            if core.started_at.is_none() {
                if player.side() == &self.starter && previous == PlayerStatus::Init {
                    core.started_at = Some(now);
                    started = Some(now);
                    if let Some(turn) = self.player_on(&core.logic.current_turn()) {
                        turn.set_turn_started_at(now);
                        arm = Some(turn.clock());
                    }
                }
            } else if previous != PlayerStatus::Connected {
                arm = Some(self.rearm_duration(&core, now));
            }

            core.logic.on_player_join(&player);
            core.logic.on_player_sync(&player);
            (started, arm, self.view(&core))
        };

        if let Some(duration) = arm {
            self.clock.reset(duration);
        }
        if let Some(at) = started {
            info!(match_id = %self.id, player_id = %player_id, "Match started");
            let hooks = self.hooks.clone();
            let match_id = self.id.clone();
            tokio::spawn(async move { hooks.on_start(&match_id, at).await });
        }

        info!(match_id = %self.id, player_id = %player_id, "Player joined");

        if let Err(e) = player.write_json(&ServerMsg::GameState { game: view }).await {
            debug!(match_id = %self.id, player_id = %player_id, error = %e, "Failed to sync joining player");
        }
        self.notify_others(
            &player,
            &ServerMsg::PlayerStatus {
                player_id: player_id.to_string(),
                status: PlayerStatus::Connected,
            },
        )
        .await;
        Ok(())
    }

    /// Detach `connection_id` from `player_id`. Ignored if the player has
    /// already reconnected on a newer connection.
    pub async fn player_disconnect(&self, player_id: &str, connection_id: u64) {
        let Some(player) = self.player(player_id).cloned() else {
            return;
        };
        if !player.release_conn(connection_id).await {
            debug!(match_id = %self.id, player_id = %player_id, "Stale connection released");
            return;
        }

        let now = Utc::now();
        let arm = {
            let mut core = self.core.lock();
            core.logic.on_player_leave(&player);
            if core.ended || core.started_at.is_none() {
                None
            } else {
                Some(self.rearm_duration(&core, now))
            }
        };
        if let Some(duration) = arm {
            self.clock.reset(duration);
        }

        info!(match_id = %self.id, player_id = %player_id, "Player disconnected");

        self.notify_others(
            &player,
            &ServerMsg::PlayerStatus {
                player_id: player_id.to_string(),
                status: PlayerStatus::Disconnected,
            },
        )
        .await;
    }

    /// Resend the current state to one player.
    pub async fn sync_player(&self, player_id: &str) {
        let Some(player) = self.player(player_id).cloned() else {
            return;
        };
        let view = {
            let mut core = self.core.lock();
            core.logic.on_player_sync(&player);
            self.view(&core)
        };
        if let Err(e) = player.write_json(&ServerMsg::GameState { game: view }).await {
            debug!(match_id = %self.id, player_id = %player_id, error = %e, "Sync write failed");
        }
    }

    /// Queue a snapshot of the current state. No-op once ended.
    pub fn save(&self) {
        let snapshot = {
            let mut core = self.core.lock();
            if core.ended {
                return;
            }
            let mut snapshot = self.snapshot(&core);
            core.logic.on_match_save(&mut snapshot);
            snapshot
        };
        if self.saves_tx.send(snapshot).is_err() {
            warn!(match_id = %self.id, "Snapshot queue closed");
        }
    }

    /// Terminate with the current outcome. Idempotent.
    pub async fn end(&self) {
        self.finish(EndCause::Outcome).await;
    }

    /// Cancel without a result. Idempotent.
    pub async fn abort(&self) {
        {
            let mut core = self.core.lock();
            if core.ended {
                return;
            }
            core.ended = true;
            self.moves_tx.lock().take();
            core.logic.on_match_abort();
            core.exit = Some(Exit::Aborted(AbortRecord {
                match_id: self.id.clone(),
                player_ids: self.players.iter().map(|p| p.id().to_string()).collect(),
            }));
        }
        self.clock.skip();

        info!(match_id = %self.id, "Match aborted");

        self.close_all(REASON_ABORTED).await;
        self.closed.notify_one();
    }

    async fn finish(&self, cause: EndCause) {
        let now = Utc::now();
        let (view, reason) = {
            let mut core = self.core.lock();
            if core.ended {
                return;
            }
            core.ended = true;
            self.moves_tx.lock().take();

            let reason = if self.outcome(&core).0.is_decided() {
                REASON_ENDED
            } else {
                self.apply_timeout_policy(&mut core, cause, now)
            };

            let mut record = self.record(&core, now);
            core.logic.on_match_end(&mut record);
            core.exit = Some(Exit::Ended(record));
            (self.view(&core), reason)
        };
        self.clock.skip();

        info!(
            match_id = %self.id,
            outcome = %view.outcome,
            method = %view.method,
            "Match ended"
        );

        self.broadcast(&ServerMsg::GameState { game: view }).await;
        self.close_all(reason).await;
        self.closed.notify_one();
    }

    /// Decide who lost to the clock. Returns the close reason.
    fn apply_timeout_policy(
        &self,
        core: &mut MatchCore,
        cause: EndCause,
        now: DateTime<Utc>,
    ) -> &'static str {
        if core.started_at.is_none() {
            return REASON_CANCELLED;
        }

        let turn = core.logic.current_turn();
        if let Some(player) = self.player_on(&turn) {
            let state = player.state();
            let spent = state.turn_started_at.map(|at| elapsed_since(at, now)).unwrap_or_default();
            player.set_clock(state.clock.saturating_sub(spent));
        }

        let absent: Vec<&Arc<Player>> = self
            .players
            .iter()
            .filter(|p| p.status() != PlayerStatus::Connected)
            .collect();

        core.verdict = match absent.as_slice() {
            [] if cause == EndCause::ClockExpired => {
                if let Some(player) = self.player_on(&turn) {
                    player.set_clock(Duration::ZERO);
                }
                Some(self.verdict_against(&turn, METHOD_OUT_OF_TIME))
            }
            [] => None,
            [one] if self.players.len() > 1 => {
                Some(self.verdict_against(one.side(), METHOD_DISCONNECT_TIMEOUT))
            }
            _ => Some(Verdict {
                outcome: Outcome::Draw,
                method: METHOD_DRAW_BY_TIMEOUT,
            }),
        };
        REASON_ENDED
    }

    /// Head-to-head: the lone opponent wins. With more sides it is a draw.
    fn verdict_against(&self, loser: &Side, method: &'static str) -> Verdict {
        let mut others = self.players.iter().filter(|p| p.side() != loser);
        let outcome = match (others.next(), others.next()) {
            (Some(winner), None) => Outcome::Win(winner.side().clone()),
            _ => Outcome::Draw,
        };
        Verdict { outcome, method }
    }

    fn outcome(&self, core: &MatchCore) -> (Outcome, String) {
        match &core.verdict {
            Some(verdict) => (verdict.outcome.clone(), verdict.method.to_string()),
            None => (core.logic.outcome(), core.logic.method()),
        }
    }

    /// Remaining time of the side on turn, net of time already spent
    fn turn_remaining(&self, core: &MatchCore, now: DateTime<Utc>) -> Duration {
        self.player_on(&core.logic.current_turn())
            .map(|p| {
                let state = p.state();
                let spent = state.turn_started_at.map(|at| elapsed_since(at, now)).unwrap_or_default();
                state.clock.saturating_sub(spent)
            })
            .unwrap_or_default()
    }

    /// Disconnect grace applies only while someone is still there to wait.
    fn rearm_duration(&self, core: &MatchCore, now: DateTime<Utc>) -> Duration {
        let remaining = self.turn_remaining(core, now);
        let connected = self
            .players
            .iter()
            .filter(|p| p.status() == PlayerStatus::Connected)
            .count();
        if connected == 0 || connected == self.players.len() {
            remaining
        } else {
            remaining.min(self.config.disconnect_timeout)
        }
    }

    fn view(&self, core: &MatchCore) -> GameStateView {
        let (outcome, method) = self.outcome(core);
        GameStateView {
            outcome: core.logic.describe_outcome(&outcome),
            method,
            position: core.logic.position(),
            player_states: self
                .players
                .iter()
                .map(|p| {
                    let state = p.state();
                    PlayerStateView {
                        id: p.id().to_string(),
                        status: state.status,
                        clock: state.clock.as_millis() as u64,
                    }
                })
                .collect(),
        }
    }

    fn snapshot(&self, core: &MatchCore) -> MatchSnapshot {
        let player_states: BTreeMap<String, SnapshotPlayerState> = self
            .players
            .iter()
            .map(|p| {
                let state = p.state();
                (
                    p.id().to_string(),
                    SnapshotPlayerState {
                        clock: state.clock,
                        status: state.status,
                    },
                )
            })
            .collect();

        let last_move = match (&core.last_mover, core.logic.last_move()) {
            (Some(player_id), Some(payload)) => Some(SnapshotMove {
                player_id: player_id.clone(),
                payload,
            }),
            _ => None,
        };

        MatchSnapshot {
            id: Uuid::new_v4(),
            match_id: self.id.clone(),
            player_states,
            game_state: core.logic.position(),
            last_move,
            ply: core.logic.ply(),
            timestamp: Utc::now(),
        }
    }

    fn record(&self, core: &MatchCore, now: DateTime<Utc>) -> MatchRecord {
        let (outcome, method) = self.outcome(core);
        let mut players = Vec::with_capacity(self.players.len());
        let mut results = Vec::with_capacity(self.players.len());

        for player in &self.players {
            let score = score_for(&outcome, player.side());
            let seat = self.seats.get(player.id()).cloned().unwrap_or_else(|| MatchPlayer {
                id: player.id().to_string(),
                rating: 0.0,
                rd: 0.0,
                new_ratings: Vec::new(),
                new_rds: Vec::new(),
            });
            players.push(project_rating(&seat, &outcome, score));
            results.push(score);
        }

        MatchRecord {
            match_id: self.id.clone(),
            players,
            pgn: core.logic.transcript(),
            started_at: core.started_at,
            ended_at: now,
            results,
            outcome: core.logic.describe_outcome(&outcome),
            method,
        }
    }

    async fn process(&self, mv: Move) {
        let Some(player) = self.player(&mv.player_id).cloned() else {
            warn!(match_id = %self.id, player_id = %mv.player_id, "Move from unknown player dropped");
            return;
        };

        let now = Utc::now();
        if is_from_future(mv.created_at, now) {
            debug!(match_id = %self.id, player_id = %mv.player_id, "Move stamped in the future dropped");
            return;
        }

        let step = {
            let mut core = self.core.lock();
            if core.ended {
                return;
            }
            self.decide(&mut core, &player, mv, now)
        };

        match step {
            Step::Reject(code) => {
                debug!(match_id = %self.id, player_id = %player.id(), error = %code, "Move rejected");
                if let Err(e) = player.write_json(&ServerMsg::error(code)).await {
                    debug!(match_id = %self.id, error = %e, "Failed to deliver rejection");
                }
            }
            Step::Abort => self.abort().await,
            Step::DrawNotice(status) => {
                self.notify_others(&player, &ServerMsg::DrawOffer { status, created_at: now })
                    .await;
            }
            Step::Quiet => {}
            Step::Advance { arm } => {
                if let Some(duration) = arm {
                    self.clock.reset(duration);
                }
                let view = self.state_view();
                self.broadcast(&ServerMsg::GameState { game: view }).await;
                self.save();

                if self.is_ended() {
                    return;
                }
                let decided = {
                    let core = self.core.lock();
                    self.outcome(&core).0.is_decided()
                };
                if decided {
                    self.end().await;
                }
            }
        }
    }

    fn decide(&self, core: &mut MatchCore, player: &Player, mv: Move, now: DateTime<Utc>) -> Step {
        let side = player.side();
        match mv.action {
            Action::Abort if core.logic.ply() > 1 => Step::Reject(ErrorCode::InvalidPly),
            Action::Abort => Step::Abort,
            Action::Resign => {
                core.logic.resign(side);
                Step::Advance { arm: None }
            }
            Action::OfferDraw => match core.logic.offer_draw(side, now) {
                DrawResponse::Agreed => Step::Advance { arm: None },
                DrawResponse::Pending => Step::DrawNotice(DrawOfferStatus::Pending),
                DrawResponse::Ignored => Step::Quiet,
            },
            Action::DeclineDraw => {
                if core.logic.decline_draw(side) {
                    Step::DrawNotice(DrawOfferStatus::Declined)
                } else {
                    Step::Quiet
                }
            }
            Action::Play(payload) => self.play(core, player, &payload, mv.created_at, now),
        }
    }

    fn play(
        &self,
        core: &mut MatchCore,
        player: &Player,
        payload: &str,
        sent_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Step {
        let turn = core.logic.current_turn();
        if &turn != player.side() {
            let want = self
                .player_on(&turn)
                .map(|p| p.id().to_string())
                .unwrap_or_default();
            return Step::Reject(ErrorCode::WrongTurn {
                want,
                got: player.id().to_string(),
            });
        }

        if let Err(e) = core.logic.handle_move(player.side(), payload) {
            debug!(match_id = %self.id, player_id = %player.id(), error = %e, "Invalid move");
            return Step::Reject(ErrorCode::InvalidMove);
        }
        core.last_mover = Some(player.id().to_string());

        let state = player.state();
        let charge = charge_move(
            state.clock,
            state.turn_started_at.unwrap_or(now),
            sent_at,
            now,
            self.config.clock_increment,
            self.config.max_lag_forgiven,
        );
        player.set_clock(charge.remaining);

        if charge.flagged {
            core.verdict = Some(self.verdict_against(player.side(), METHOD_OUT_OF_TIME));
            return Step::Advance { arm: None };
        }

        let arm = self.player_on(&core.logic.current_turn()).map(|next| {
            next.set_turn_started_at(now);
            next.clock()
        });
        Step::Advance { arm }
    }

    async fn broadcast(&self, msg: &ServerMsg) {
        let text = match serde_json::to_string(msg) {
            Ok(text) => text,
            Err(e) => {
                warn!(match_id = %self.id, error = %e, "Failed to encode broadcast");
                return;
            }
        };
        for player in &self.players {
            if let Err(e) = player.write_text(text.clone()).await {
                debug!(match_id = %self.id, player_id = %player.id(), error = %e, "Broadcast write failed");
            }
        }
    }

    async fn notify_others(&self, sender: &Player, msg: &ServerMsg) {
        for player in self.players.iter().filter(|p| p.id() != sender.id()) {
            if let Err(e) = player.write_json(msg).await {
                debug!(match_id = %self.id, player_id = %player.id(), error = %e, "Notice write failed");
            }
        }
    }

    async fn close_all(&self, reason: &str) {
        let deadline = Instant::now() + CLOSE_DEADLINE;
        for player in &self.players {
            if let Err(e) = player
                .write_control(ControlFrame::Close(reason.to_string()), deadline)
                .await
            {
                debug!(match_id = %self.id, player_id = %player.id(), error = %e, "Close frame not delivered");
            }
        }
    }
}

impl MatchWorker {
    /// Consume moves until the match ends, then run the exit hook.
    pub async fn run(mut self) {
        let watcher = {
            let game = self.game.clone();
            tokio::spawn(async move {
                game.clock.expired().await;
                game.finish(EndCause::ClockExpired).await;
            })
        };

        loop {
            tokio::select! {
                biased;
                _ = self.game.closed.notified() => break,
                next = self.moves.recv() => match next {
                    Some(mv) => {
                        self.game.process(mv).await;
                        if self.game.is_ended() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        // Drained without a verdict: close out normally.
        self.game.end().await;
        // The clock is skipped on every exit path, so the watcher finishes
        // its close frames and returns.
        if let Err(e) = watcher.await {
            warn!(match_id = %self.game.id, error = %e, "Clock watcher failed");
        }

        let exit = self.game.core.lock().exit.take();
        match exit {
            Some(Exit::Ended(record)) => self.game.hooks.on_end(record).await,
            Some(Exit::Aborted(record)) => self.game.hooks.on_abort(record).await,
            None => {}
        }
    }
}

async fn run_saver(hooks: Arc<dyn MatchHooks>, mut saves: mpsc::UnboundedReceiver<MatchSnapshot>) {
    while let Some(snapshot) = saves.recv().await {
        hooks.on_save(snapshot).await;
    }
}
