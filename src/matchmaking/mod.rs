//! Matchmaking: ticket pool pairing and match seeding

pub mod notify;
pub mod service;
pub mod ticket;

pub use notify::{NoopNotifier, QueueNotifier, ServerPool, StaticServerPool, WebhookNotifier};
pub use service::{Matchmaker, MatchmakingError, MatchmakingOutcome};
pub use ticket::{FlatRatingProjector, RatingProjector, TicketError, TicketRequest};
