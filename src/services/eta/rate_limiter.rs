//! Sliding-window budget for routing provider calls

use std::collections::VecDeque;
use tokio::time::{Duration, Instant};

#[derive(Debug)]
pub struct RateLimiter {
    max_per_window: usize,
    window: Duration,
    /// Start times of calls still inside the window, oldest first
    calls: VecDeque<Instant>,
    /// Set when the provider itself reported rate limiting
    exhausted_until: Option<Instant>,
}

impl RateLimiter {
    pub fn new(max_per_window: usize, window: Duration) -> Self {
        Self { max_per_window, window, calls: VecDeque::new(), exhausted_until: None }
    }

    pub fn per_minute(max_calls: usize) -> Self {
        Self::new(max_calls, Duration::from_secs(60))
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.calls.front() {
            if now.duration_since(oldest) >= self.window {
                self.calls.pop_front();
            } else {
                break;
            }
        }
        if self.exhausted_until.is_some_and(|until| now >= until) {
            self.exhausted_until = None;
        }
    }

    /// Consume one call from the budget if any is left
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.evict(now);
        if self.exhausted_until.is_some() || self.calls.len() >= self.max_per_window {
            return false;
        }
        self.calls.push_back(now);
        true
    }

    /// Block further calls until the current window has elapsed
    pub fn exhaust(&mut self, now: Instant) {
        let window_start = self.calls.front().copied().unwrap_or(now);
        self.exhausted_until = Some(window_start + self.window);
    }

    /// Calls counted in the current window
    pub fn in_window(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.calls.len()
    }

    pub fn is_limited(&mut self, now: Instant) -> bool {
        self.evict(now);
        self.exhausted_until.is_some() || self.calls.len() >= self.max_per_window
    }

    pub fn max_per_window(&self) -> usize {
        self.max_per_window
    }
}
