//! WebSocket surface: upgrade handler and wire protocol

pub mod handler;
pub mod protocol;
