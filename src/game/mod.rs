//! Match lifecycle: clocks, players, the per-match state machine and the
//! process-wide registry of live matches

pub mod clock;
pub mod logic;
pub mod r#match;
pub mod mode;
pub mod player;
pub mod record;
pub mod reference;
pub mod registry;

pub use clock::ClockTimer;
pub use logic::{
    Action, DrawResponse, GameError, GameLogic, GameRules, Inbound, MatchSetup, Move,
    MoveRejected, Outcome, Seat, Side,
};
pub use mode::{GameMode, MatchConfig};
pub use player::{ConnectionHandle, Outbound, Player, PlayerStatus};
pub use r#match::{JoinError, Match, MatchHooks, MatchWorker, SubmitError};
pub use record::{AbortRecord, MatchRecord, RecordPlayer};
pub use registry::{LoadError, MatchRegistry};
