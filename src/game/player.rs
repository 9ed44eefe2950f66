//! Player handle shared by a match and its connection's read pump

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::logic::Side;

/// Bound on how long a single frame may wait for the writer task
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound buffer per connection
pub const OUTBOUND_CAPACITY: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerStatus {
    Init,
    Connected,
    Disconnected,
}

/// Frame handed to a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Normal-closure close frame; the writer gives up after `deadline`
    Close { reason: String, deadline: Instant },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    Close(String),
}

/// Sending half of one socket's writer task, tagged with a unique id so a
/// stale read pump can't tear down a newer connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    tx: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Handle plus the receiver a writer task should drain
    pub fn channel() -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlayerWriteError {
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("connection closed")]
    Closed,

    #[error("write timed out")]
    Timeout,
}

/// Mutable per-player match state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerState {
    pub clock: Duration,
    pub status: PlayerStatus,
    pub turn_started_at: Option<DateTime<Utc>>,
}

pub struct Player {
    id: String,
    side: Side,
    state: parking_lot::Mutex<PlayerState>,
    /// Doubles as the write mutex: every frame is sent with this held.
    conn: tokio::sync::Mutex<Option<ConnectionHandle>>,
}

impl Player {
    pub fn new(id: impl Into<String>, side: Side, clock: Duration, status: PlayerStatus) -> Self {
        Self {
            id: id.into(),
            side,
            state: parking_lot::Mutex::new(PlayerState {
                clock,
                status,
                turn_started_at: None,
            }),
            conn: tokio::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn side(&self) -> &Side {
        &self.side
    }

    pub fn state(&self) -> PlayerState {
        self.state.lock().clone()
    }

    pub fn status(&self) -> PlayerStatus {
        self.state.lock().status
    }

    pub fn clock(&self) -> Duration {
        self.state.lock().clock
    }

    pub fn set_clock(&self, clock: Duration) {
        self.state.lock().clock = clock;
    }

    pub fn set_turn_started_at(&self, at: DateTime<Utc>) {
        self.state.lock().turn_started_at = Some(at);
    }

    /// Swap the connection; `Some` marks the player connected, `None` disconnected.
    pub async fn set_conn(&self, conn: Option<ConnectionHandle>) {
        let mut slot = self.conn.lock().await;
        let status = if conn.is_some() {
            PlayerStatus::Connected
        } else {
            PlayerStatus::Disconnected
        };
        *slot = conn;
        self.state.lock().status = status;
    }

    /// Drop the connection only if it is still `connection_id`.
    /// Returns false when a newer connection has already replaced it.
    pub async fn release_conn(&self, connection_id: u64) -> bool {
        let mut slot = self.conn.lock().await;
        match slot.as_ref() {
            Some(conn) if conn.id == connection_id => {
                *slot = None;
                self.state.lock().status = PlayerStatus::Disconnected;
                true
            }
            _ => false,
        }
    }

    pub async fn write_json<T: Serialize>(&self, msg: &T) -> Result<(), PlayerWriteError> {
        let text = serde_json::to_string(msg)?;
        self.write_text(text).await
    }

    /// Queue an already encoded frame. No-op while disconnected.
    pub async fn write_text(&self, text: String) -> Result<(), PlayerWriteError> {
        let slot = self.conn.lock().await;
        let Some(conn) = slot.as_ref() else {
            return Ok(());
        };
        conn.tx
            .send_timeout(Outbound::Text(text), WRITE_TIMEOUT)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => PlayerWriteError::Timeout,
                mpsc::error::SendTimeoutError::Closed(_) => PlayerWriteError::Closed,
            })
    }

    pub async fn write_control(
        &self,
        frame: ControlFrame,
        deadline: Instant,
    ) -> Result<(), PlayerWriteError> {
        let slot = self.conn.lock().await;
        let Some(conn) = slot.as_ref() else {
            return Ok(());
        };
        let ControlFrame::Close(reason) = frame;
        let outbound = Outbound::Close { reason, deadline };
        match tokio::time::timeout_at(deadline, conn.tx.send(outbound)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PlayerWriteError::Closed),
            Err(_) => Err(PlayerWriteError::Timeout),
        }
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("id", &self.id)
            .field("side", &self.side)
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player() -> Player {
        Player::new("p1", Side::new("white"), Duration::from_secs(60), PlayerStatus::Init)
    }

    #[tokio::test]
    async fn writes_without_connection_are_noops() {
        let player = player();
        assert!(player.write_json(&serde_json::json!({"type": "x"})).await.is_ok());
        assert!(player
            .write_control(ControlFrame::Close("bye".into()), Instant::now())
            .await
            .is_ok());
        assert_eq!(player.status(), PlayerStatus::Init);
    }

    #[tokio::test]
    async fn set_conn_flips_status() {
        let player = player();
        let (conn, mut rx) = ConnectionHandle::channel();

        player.set_conn(Some(conn)).await;
        assert_eq!(player.status(), PlayerStatus::Connected);

        player.write_json(&serde_json::json!({"type": "ping"})).await.unwrap();
        assert_eq!(rx.recv().await, Some(Outbound::Text(r#"{"type":"ping"}"#.into())));

        player.set_conn(None).await;
        assert_eq!(player.status(), PlayerStatus::Disconnected);
    }

    #[tokio::test]
    async fn dead_socket_returns_error() {
        let player = player();
        let (conn, rx) = ConnectionHandle::channel();
        player.set_conn(Some(conn)).await;
        drop(rx);

        let result = player.write_text("hello".into()).await;
        assert!(matches!(result, Err(PlayerWriteError::Closed)));
    }

    #[tokio::test]
    async fn stale_release_keeps_newer_connection() {
        let player = player();
        let (old, _old_rx) = ConnectionHandle::channel();
        let (new, mut new_rx) = ConnectionHandle::channel();
        let old_id = old.id();

        player.set_conn(Some(old)).await;
        player.set_conn(Some(new.clone())).await;

        assert!(!player.release_conn(old_id).await);
        assert_eq!(player.status(), PlayerStatus::Connected);

        player.write_text("still here".into()).await.unwrap();
        assert_eq!(new_rx.recv().await, Some(Outbound::Text("still here".into())));

        assert!(player.release_conn(new.id()).await);
        assert_eq!(player.status(), PlayerStatus::Disconnected);
    }

    #[tokio::test]
    async fn close_frame_carries_deadline() {
        let player = player();
        let (conn, mut rx) = ConnectionHandle::channel();
        player.set_conn(Some(conn)).await;

        let deadline = Instant::now() + Duration::from_secs(5);
        player
            .write_control(ControlFrame::Close("match ended".into()), deadline)
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(Outbound::Close {
                reason: "match ended".into(),
                deadline
            })
        );
    }
}
