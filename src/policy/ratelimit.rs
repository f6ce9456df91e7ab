// src/policy/ratelimit.rs
// =============================================================================
// Fixed-window rate limiting.
//
// A RateLimiter counts admissions per key (an origin, or a client id) and
// wipes every counter at a fixed schedule: start, start + period,
// start + 2 * period, ... A key that has used up its `limit` for the current
// window is denied until the next reset. Denials never touch the counters.
//
// Time is always passed in, so callers (and tests) decide what "now" is.
// The policy guard drives the reset with reset_if_due before each admission;
// try_acquire repeats the check under the same lock as its increment.
// release() hands back an admission that a later check turned down.
// =============================================================================

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Rate limit decision for one admission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allow,
    /// The key is at its limit; `retry_after` is the time left until the
    /// next reset.
    Deny { retry_after: Duration },
}

#[derive(Debug)]
struct Window {
    counts: HashMap<String, u32>,
    next_reset: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    period: Duration,
    window: Mutex<Window>,
}

impl RateLimiter {
    // `period` must be non-zero; Config::validate makes sure of that.
    pub fn new(limit: u32, period: Duration, now: Instant) -> Self {
        Self {
            limit,
            period,
            window: Mutex::new(Window {
                counts: HashMap::new(),
                next_reset: now + period,
            }),
        }
    }

    /// Clears every counter if `now` has reached the scheduled reset.
    pub fn reset_if_due(&self, now: Instant) {
        let mut window = self.lock();
        Self::reset_locked(&mut window, self.period, now);
    }

    /// Admits `key` if it is under its limit, counting the admission.
    pub fn try_acquire(&self, key: &str, now: Instant) -> RateLimitDecision {
        let mut window = self.lock();
        Self::reset_locked(&mut window, self.period, now);

        let count = window.counts.get(key).copied().unwrap_or(0);
        if count >= self.limit {
            return RateLimitDecision::Deny {
                retry_after: window.next_reset.saturating_duration_since(now),
            };
        }
        window.counts.insert(key.to_string(), count + 1);
        RateLimitDecision::Allow
    }

    /// Gives back one admission of `key` in the current window.
    pub fn release(&self, key: &str) {
        let mut window = self.lock();
        if let Some(count) = window.counts.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                window.counts.remove(key);
            }
        }
    }

    #[cfg(test)]
    pub fn count(&self, key: &str) -> u32 {
        self.lock().counts.get(key).copied().unwrap_or(0)
    }

    fn reset_locked(window: &mut Window, period: Duration, now: Instant) {
        if now < window.next_reset || period.is_zero() {
            return;
        }
        window.counts.clear();
        // stay on the fixed schedule even if several periods went by unobserved
        while window.next_reset <= now {
            window.next_reset += period;
        }
    }

    // A panic while holding the lock can't leave the counters half-updated,
    // so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
