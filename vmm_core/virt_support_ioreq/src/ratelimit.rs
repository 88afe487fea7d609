// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Rate-limited logging for events the guest or device model can trigger at
//! will.

use parking_lot::Mutex;
use std::time::Duration;
use std::time::Instant;

const PERIOD: Duration = Duration::from_secs(5);
const EVENTS_PER_PERIOD: u32 = 10;

/// Admits at most a fixed number of events per period.
pub(crate) struct RateLimiter {
    state: Mutex<State>,
}

struct State {
    start: Option<Instant>,
    events: u32,
    missed: u64,
}

/// The event was suppressed.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct RateLimited;

impl RateLimiter {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(State {
                start: None,
                events: 0,
                missed: 0,
            }),
        }
    }

    /// Returns `Ok(missed)` if the event should be logged, where `missed` is
    /// the number of events dropped since the last logged one, if any.
    pub fn event(&self) -> Result<Option<u64>, RateLimited> {
        self.event_at(Instant::now())
    }

    fn event_at(&self, now: Instant) -> Result<Option<u64>, RateLimited> {
        // A contended limiter means another VP is logging the same event.
        let mut state = self.state.try_lock().ok_or(RateLimited)?;
        let start = state.start.get_or_insert(now);
        if now.saturating_duration_since(*start) > PERIOD {
            *start = now;
            state.events = 0;
        }
        if state.events >= EVENTS_PER_PERIOD {
            state.missed += 1;
            return Err(RateLimited);
        }
        state.events += 1;
        let missed = std::mem::take(&mut state.missed);
        Ok((missed != 0).then_some(missed))
    }
}

/// As [`tracing::warn!`], but rate limited per call site.
macro_rules! warn_ratelimited {
    ($($rest:tt)*) => {{
        static RATE_LIMITER: $crate::ratelimit::RateLimiter = $crate::ratelimit::RateLimiter::new();
        if let Ok(dropped) = RATE_LIMITER.event() {
            ::tracing::warn!(dropped_ratelimited = dropped, $($rest)*);
        }
    }};
}

/// As [`tracing::error!`], but rate limited per call site.
macro_rules! error_ratelimited {
    ($($rest:tt)*) => {{
        static RATE_LIMITER: $crate::ratelimit::RateLimiter = $crate::ratelimit::RateLimiter::new();
        if let Ok(dropped) = RATE_LIMITER.event() {
            ::tracing::error!(dropped_ratelimited = dropped, $($rest)*);
        }
    }};
}

pub(crate) use error_ratelimited;
pub(crate) use warn_ratelimited;
