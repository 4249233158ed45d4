//! Fixed-window rate limiting for the dispatch entry point.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One-minute windows, matching a per-minute configured limit.
const WINDOW: Duration = Duration::from_secs(60);

/// A fixed-window rate limiter: the token count resets to `max` at discrete
/// window boundaries rather than refilling continuously. The reset is lazy,
/// evaluated on each [`RateLimiter::allow`] call; there is no background
/// timer. Safe for concurrent use.
///
/// Known coarseness: a burst of `max` requests at the end of one window
/// followed by `max` more at the start of the next all pass.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<State>,
    max: u32,
    window: Duration,
}

#[derive(Debug)]
struct State {
    tokens: u32,
    window_start: Instant,
}

impl RateLimiter {
    /// Create a rate limiter allowing `requests_per_minute` requests per
    /// one-minute window.
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            state: Mutex::new(State {
                tokens: requests_per_minute,
                window_start: Instant::now(),
            }),
            max: requests_per_minute,
            window: WINDOW,
        }
    }

    /// Consume one token, returning false if the limit for the current
    /// window has been reached.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    /// [`RateLimiter::allow`] with an explicit clock, so tests can advance
    /// time without sleeping. The lock is held only for the arithmetic
    /// check-and-decrement.
    pub fn allow_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");

        if now.duration_since(state.window_start) >= self.window {
            state.tokens = self.max;
            state.window_start = now;
        }

        if state.tokens == 0 {
            return false;
        }
        state.tokens -= 1;
        true
    }
}
