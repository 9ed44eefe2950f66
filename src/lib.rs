//! Match Server - authoritative realtime server for turn-based matches
//!
//! - WebSocket connections for live play on pre-created matches
//! - Per-match state machine with game clocks, lag credit and disconnect timeouts
//! - Snapshot persistence, final records and resume after restart
//! - Task protection while any match is live
//! - Ticket-based matchmaking that seeds matches into the store

pub mod app;
pub mod config;
pub mod game;
pub mod http;
pub mod matchmaking;
pub mod persist;
pub mod protection;
pub mod store;
pub mod util;
pub mod ws;
