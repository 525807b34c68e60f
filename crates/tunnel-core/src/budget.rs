//! Shared API request budget
//!
//! One [`ApiBudget`] is created per process and handed to every DNS provider
//! instance, so concurrent tunnel attempts on different ports draw from a single
//! coordinated allowance instead of each hammering the provider on its own.
//!
//! The budget is mutated only by provider clients: they consume a request slot
//! before every call and record a cooldown when the provider throttles them.
//! The reconciliation engine never touches it directly; it backs off on the
//! `retry_after` carried by [`Error::RateLimited`](crate::Error::RateLimited).

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::DnsConfig;

/// Cooldown applied when the provider throttles without a `Retry-After`
const DEFAULT_THROTTLE_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct BudgetState {
    window_start: Instant,
    used: u32,
    cooldown_until: Option<Instant>,
}

/// Fixed-window request budget with a provider-reported cooldown
#[derive(Debug)]
pub struct ApiBudget {
    per_window: u32,
    window: Duration,
    state: Mutex<BudgetState>,
}

impl ApiBudget {
    /// Create a budget allowing `per_window` requests every `window`
    pub fn new(per_window: u32, window: Duration) -> Self {
        Self {
            per_window,
            window,
            state: Mutex::new(BudgetState {
                window_start: Instant::now(),
                used: 0,
                cooldown_until: None,
            }),
        }
    }

    /// Create a budget from DNS configuration
    pub fn from_config(config: &DnsConfig) -> Self {
        Self::new(
            config.api_budget_per_window,
            Duration::from_secs(config.api_budget_window_secs),
        )
    }

    /// Consume one request slot
    ///
    /// Returns `Err(wait)` with the time until a slot frees up when the window
    /// is exhausted or a throttle cooldown is active.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(until) = state.cooldown_until {
            if until > now {
                return Err(until - now);
            }
            state.cooldown_until = None;
        }

        if now.duration_since(state.window_start) >= self.window {
            state.window_start = now;
            state.used = 0;
        }

        if state.used >= self.per_window {
            let reset = state.window_start + self.window;
            return Err(reset.saturating_duration_since(now));
        }

        state.used += 1;
        Ok(())
    }

    /// Record that the provider throttled a request
    pub fn record_throttle(&self, retry_after: Option<Duration>) {
        let cooldown = retry_after.unwrap_or(DEFAULT_THROTTLE_COOLDOWN);
        let until = Instant::now() + cooldown;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.cooldown_until = Some(match state.cooldown_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
        tracing::warn!(?cooldown, "API budget entering cooldown");
    }

    /// Remaining cooldown, if one is active
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .cooldown_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Request slots left in the current window
    pub fn remaining(&self) -> u32 {
        let now = Instant::now();
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if now.duration_since(state.window_start) >= self.window {
            self.per_window
        } else {
            self.per_window.saturating_sub(state.used)
        }
    }
}

impl Default for ApiBudget {
    fn default() -> Self {
        Self::from_config(&DnsConfig::default())
    }
}
