//! Resettable one-shot timer and per-move clock arithmetic

use std::pin::pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::util::time::millis_between;

/// One-shot timer that knows its own deadline.
///
/// `reset(Duration::ZERO)` makes any pending [`ClockTimer::expired`] resolve
/// immediately, which is how callers skip a deadline.
pub struct ClockTimer {
    inner: Mutex<TimerState>,
    changed: Notify,
}

struct TimerState {
    deadline: Instant,
    stopped: bool,
}

impl ClockTimer {
    pub fn new(duration: Duration) -> Self {
        Self {
            inner: Mutex::new(TimerState {
                deadline: Instant::now() + duration,
                stopped: false,
            }),
            changed: Notify::new(),
        }
    }

    /// Move the deadline to `now + duration` and re-arm a stopped timer.
    pub fn reset(&self, duration: Duration) {
        {
            let mut state = self.inner.lock();
            state.deadline = Instant::now() + duration;
            state.stopped = false;
        }
        self.changed.notify_waiters();
    }

    /// Disarm without firing. `expired()` keeps waiting until the next reset.
    pub fn stop(&self) {
        self.inner.lock().stopped = true;
        self.changed.notify_waiters();
    }

    /// Fire now.
    pub fn skip(&self) {
        self.reset(Duration::ZERO);
    }

    pub fn remaining(&self) -> Duration {
        let state = self.inner.lock();
        if state.stopped {
            return Duration::ZERO;
        }
        state.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    /// Resolves once the current deadline passes, following any resets made
    /// while waiting.
    pub async fn expired(&self) {
        loop {
            let mut notified = pin!(self.changed.notified());
            notified.as_mut().enable();

            let (deadline, stopped) = {
                let state = self.inner.lock();
                (state.deadline, state.stopped)
            };

            if stopped {
                notified.await;
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let state = self.inner.lock();
                    if !state.stopped && state.deadline <= Instant::now() {
                        return;
                    }
                }
                _ = notified => {}
            }
        }
    }
}

/// Result of charging one move against the mover's clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockCharge {
    /// New clock value, never below zero
    pub remaining: Duration,
    pub time_taken: Duration,
    pub lag_forgiven: Duration,
    /// The mover ran out of time on this move
    pub flagged: bool,
}

/// True when the client stamped a message later than the server's clock.
pub fn is_from_future(sent_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    millis_between(sent_at, now) < 0
}

/// `clock - taken + lag + increment`, where lag is the transit time the
/// client claims, capped by `max_lag` and by the time actually taken.
pub fn charge_move(
    clock: Duration,
    turn_started_at: DateTime<Utc>,
    sent_at: DateTime<Utc>,
    now: DateTime<Utc>,
    increment: Duration,
    max_lag: Duration,
) -> ClockCharge {
    let taken_ms = millis_between(turn_started_at, now).max(0);
    let transit_ms = millis_between(sent_at, now).max(0);
    let lag_ms = transit_ms.min(max_lag.as_millis() as i64).min(taken_ms);

    let new_ms = clock.as_millis() as i64 - taken_ms + lag_ms + increment.as_millis() as i64;

    ClockCharge {
        remaining: Duration::from_millis(new_ms.max(0) as u64),
        time_taken: Duration::from_millis(taken_ms as u64),
        lag_forgiven: Duration::from_millis(lag_ms as u64),
        flagged: new_ms <= 0,
    }
}
