//! Per-hook launch budget over a sliding window
//!
//! A slot is reserved before the hook runs so concurrent requests cannot
//! overshoot the budget, and handed back when nothing was launched.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::hook::RateLimit;

#[derive(Debug, Default)]
pub struct RateLimiter {
    /// launch timestamps per hook name
    launches: HashMap<String, Vec<Instant>>,
}

/// A slot held for one dispatch. Give it back with [`RateLimiter::release`]
/// when the dispatch launched nothing.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct Reservation {
    hook: String,
    at: Instant,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a slot for `hook`, or `None` when the window is already full.
    pub fn reserve(&mut self, hook: &str, limit: RateLimit) -> Option<Reservation> {
        self.reserve_at(hook, limit, Instant::now())
    }

    fn reserve_at(&mut self, hook: &str, limit: RateLimit, now: Instant) -> Option<Reservation> {
        let window = Duration::from_secs(limit.window_secs);
        let launches = self.launches.entry(hook.to_string()).or_default();

        // Drop launches that fell out of the window
        launches.retain(|&t| now.duration_since(t) < window);

        if launches.len() >= limit.max {
            return None;
        }
        launches.push(now);
        Some(Reservation {
            hook: hook.to_string(),
            at: now,
        })
    }

    /// Roll back a slot whose dispatch never launched a command.
    pub fn release(&mut self, reservation: Reservation) {
        if let Some(launches) = self.launches.get_mut(&reservation.hook) {
            if let Some(pos) = launches.iter().position(|&t| t == reservation.at) {
                launches.remove(pos);
            }
        }
    }

    /// Slots currently held for `hook`.
    pub fn in_use(&self, hook: &str) -> usize {
        self.launches.get(hook).map_or(0, Vec::len)
    }
}
