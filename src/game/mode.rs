//! Game modes ("10+5") and the per-match timing they imply

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Grace period before an unstarted match is cancelled
pub const CANCEL_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a disconnected player may stay away on their own turn
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(120);
/// Default ceiling on the transit time credited back per move
pub const DEFAULT_MAX_LAG_FORGIVEN: Duration = Duration::from_millis(200);

/// Modes a ticket may ask for, as `<minutes>+<increment seconds>`
pub const SUPPORTED_MODES: &[&str] = &[
    "1+0", "1+1", "1+2", "2+1", "2+2", "3+0", "3+2", "5+0", "5+3", "5+5", "10+0", "10+5",
    "15+10", "25+10", "30+0", "45+15", "60+30",
];

/// Timing configuration of one match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchConfig {
    pub match_duration: Duration,
    pub clock_increment: Duration,
    pub cancel_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub max_lag_forgiven: Duration,
}

impl MatchConfig {
    /// How long a started match may stay in the store before it counts as abandoned
    pub fn expiry_horizon(&self) -> Duration {
        self.match_duration * 2 + Duration::from_secs(2 * 60)
    }

    /// Protection horizon requested when this match goes live
    pub fn protection_horizon(&self) -> Duration {
        self.match_duration * 2 + Duration::from_secs(5 * 60)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameMode {
    pub minutes: u32,
    pub increment_secs: u32,
}

impl GameMode {
    pub fn config(&self, max_lag_forgiven: Duration) -> MatchConfig {
        MatchConfig {
            match_duration: Duration::from_secs(u64::from(self.minutes) * 60),
            clock_increment: Duration::from_secs(u64::from(self.increment_secs)),
            cancel_timeout: CANCEL_TIMEOUT,
            disconnect_timeout: DISCONNECT_TIMEOUT,
            max_lag_forgiven,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported game mode: {0:?}")]
pub struct UnknownGameMode(pub String);

impl FromStr for GameMode {
    type Err = UnknownGameMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !SUPPORTED_MODES.contains(&s) {
            return Err(UnknownGameMode(s.to_string()));
        }
        let (minutes, increment) = s
            .split_once('+')
            .ok_or_else(|| UnknownGameMode(s.to_string()))?;
        Ok(Self {
            minutes: minutes.parse().map_err(|_| UnknownGameMode(s.to_string()))?,
            increment_secs: increment
                .parse()
                .map_err(|_| UnknownGameMode(s.to_string()))?,
        })
    }
}

impl fmt::Display for GameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.minutes, self.increment_secs)
    }
}
