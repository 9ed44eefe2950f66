//! WebSocket upgrade handler for `/game/{match_id}`

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::app::AppState;
use crate::game::player::OUTBOUND_CAPACITY;
use crate::game::r#match::CLOSE_DEADLINE;
use crate::game::{ConnectionHandle, Inbound, LoadError, Match, Outbound, SubmitError};
use crate::http::middleware::authenticate;
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::ws::protocol::{ErrorCode, ServerMsg};

/// Close reason when the match can't be built
pub const REASON_LOAD_FAILED: &str = "match failed to load";
/// Close reason for undecodable frames
pub const REASON_BAD_MESSAGE: &str = "invalid message";

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(match_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    // Verify the token before upgrading
    match authenticate(&headers, state.auth.as_ref()).await {
        Ok(user) => {
            info!(match_id = %match_id, player_id = %user.user_id, "WebSocket upgrade for authenticated player");
            ws.on_upgrade(move |socket| handle_socket(socket, match_id, user.user_id, state))
        }
        Err(e) => {
            warn!(match_id = %match_id, error = %e, "WebSocket auth failed");
            e.into_response()
        }
    }
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, match_id: String, player_id: String, state: AppState) {
    let (mut ws_sink, ws_stream) = socket.split();

    let game = match state.registry.load(&match_id).await {
        Ok(game) => game,
        Err(e) => {
            let reason = match &e {
                LoadError::NotFound => {
                    info!(match_id = %match_id, player_id = %player_id, reason = %e, "Refusing connection");
                    e.to_string()
                }
                LoadError::Expired => {
                    info!(match_id = %match_id, player_id = %player_id, reason = %e, "Refusing connection");
                    REASON_LOAD_FAILED.to_string()
                }
                LoadError::Store(_) | LoadError::Setup(_) => {
                    error!(match_id = %match_id, error = %e, "Failed to load match");
                    REASON_LOAD_FAILED.to_string()
                }
            };
            send_close(&mut ws_sink, reason, Instant::now() + CLOSE_DEADLINE).await;
            return;
        }
    };

    let (tx, outbound) = mpsc::channel(OUTBOUND_CAPACITY);
    let conn = ConnectionHandle::new(tx.clone());
    let conn_id = conn.id();
    let mut writer = tokio::spawn(run_writer(ws_sink, outbound, player_id.clone()));

    if let Err(e) = game.player_join(&player_id, conn).await {
        info!(match_id = %match_id, player_id = %player_id, reason = %e, "Join refused");
        close_via(&tx, e.to_string()).await;
        game.player_disconnect(&player_id, conn_id).await;
        drop(tx);
        match tokio::time::timeout(CLOSE_DEADLINE, writer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(match_id = %match_id, player_id = %player_id, error = %e, "Writer task failed"),
            Err(_) => debug!(match_id = %match_id, player_id = %player_id, "Writer did not finish before close deadline"),
        }
        return;
    }

    let writer_done = run_session(&game, &player_id, ws_stream, &tx, &mut writer, &state).await;

    game.player_disconnect(&player_id, conn_id).await;
    drop(tx);
    if !writer_done && tokio::time::timeout(CLOSE_DEADLINE, &mut writer).await.is_err() {
        writer.abort();
    }

    info!(match_id = %match_id, player_id = %player_id, "WebSocket connection closed");
}

/// Read pump. Returns true once the writer task has finished.
async fn run_session(
    game: &Match,
    player_id: &str,
    mut ws_stream: SplitStream<WebSocket>,
    tx: &mpsc::Sender<Outbound>,
    writer: &mut tokio::task::JoinHandle<()>,
    state: &AppState,
) -> bool {
    let rate_limiter = ConnectionRateLimiter::new();

    loop {
        let result = tokio::select! {
            frame = ws_stream.next() => frame,
            _ = &mut *writer => {
                debug!(match_id = %game.id(), player_id = %player_id, "Writer finished, dropping reader");
                return true;
            }
        };

        let text = match result {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(_))) => {
                warn!(player_id = %player_id, "Received binary message, ignoring");
                continue;
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) => {
                info!(match_id = %game.id(), player_id = %player_id, "Client initiated close");
                return false;
            }
            Some(Err(e)) => {
                debug!(match_id = %game.id(), player_id = %player_id, error = %e, "WebSocket error");
                return false;
            }
            None => return false,
        };

        if !rate_limiter.check_input() {
            warn!(player_id = %player_id, "Rate limited input message");
            continue;
        }

        match state.rules.on_handle_message(player_id, &text) {
            Ok(Inbound::Move(mv)) => match game.submit(mv).await {
                Ok(()) => {}
                Err(SubmitError::UnknownPlayer) => {
                    let msg = ServerMsg::error(ErrorCode::InvalidPlayerId);
                    match serde_json::to_string(&msg) {
                        Ok(json) => {
                            if tx.send(Outbound::Text(json)).await.is_err() {
                                debug!(match_id = %game.id(), player_id = %player_id, "Writer gone, error not sent");
                            }
                        }
                        Err(e) => debug!(player_id = %player_id, error = %e, "Failed to encode error message"),
                    }
                }
                Err(SubmitError::MatchEnded) => {
                    debug!(match_id = %game.id(), player_id = %player_id, "Move after match end dropped");
                }
            },
            Ok(Inbound::Sync) => game.sync_player(player_id).await,
            Ok(Inbound::Ignore) => {}
            Err(e) => {
                warn!(match_id = %game.id(), player_id = %player_id, error = %e, "Failed to parse client message");
                close_via(tx, REASON_BAD_MESSAGE.to_string()).await;
                return false;
            }
        }
    }
}

/// Writer task: drains the connection's outbound queue into the socket.
async fn run_writer(
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    player_id: String,
) {
    while let Some(frame) = outbound.recv().await {
        match frame {
            Outbound::Text(text) => {
                if let Err(e) = ws_sink.send(Message::Text(text)).await {
                    debug!(player_id = %player_id, error = %e, "WebSocket send failed");
                    return;
                }
            }
            Outbound::Close { reason, deadline } => {
                send_close(&mut ws_sink, reason, deadline).await;
                return;
            }
        }
    }
}

async fn close_via(tx: &mpsc::Sender<Outbound>, reason: String) {
    let deadline = Instant::now() + CLOSE_DEADLINE;
    match tokio::time::timeout_at(deadline, tx.send(Outbound::Close { reason, deadline })).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => debug!("Writer gone, close not queued"),
        Err(_) => debug!("Close not queued before deadline"),
    }
}

/// Send a normal-closure close frame, giving up at `deadline`.
async fn send_close(sink: &mut SplitSink<WebSocket, Message>, reason: String, deadline: Instant) {
    let frame = CloseFrame {
        code: close_code::NORMAL,
        reason: reason.into(),
    };
    match tokio::time::timeout_at(deadline, sink.send(Message::Close(Some(frame)))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Close frame not delivered"),
        Err(_) => debug!("Close frame timed out"),
    }
}
