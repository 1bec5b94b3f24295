//! Caller-side rate limiting for the paginated source
//!
//! Sliding-window admission with a windowed reset: once `max_calls` calls fall inside
//! the trailing `period`, the next caller sleeps until the oldest call leaves the
//! window, the window is cleared, and a fresh burst of up to `max_calls` follows.
//!
//! The limiter is cheap to clone; clones share one window, so several fetchers can
//! draw from the same budget.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Calls per period allowed by the paginated source
pub const DEFAULT_MAX_CALLS: usize = 10;

pub const DEFAULT_PERIOD: Duration = Duration::from_secs(1);

/// Rate limiting configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_calls: usize,
    pub period: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: DEFAULT_MAX_CALLS,
            period: DEFAULT_PERIOD,
        }
    }
}

/// Timestamps of admitted calls, oldest first
#[derive(Debug, Default)]
struct RateWindow {
    calls: VecDeque<Instant>,
}

impl RateWindow {
    fn expire(&mut self, now: Instant, period: Duration) {
        while let Some(&oldest) = self.calls.front() {
            if now.duration_since(oldest) >= period {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Shared sliding-window rate limiter
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Arc<Mutex<RateWindow>>,
}

impl RateLimiter {
    /// `max_calls` must be at least 1; configuration validation enforces this.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            window: Arc::new(Mutex::new(RateWindow::default())),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Wait until one more call fits in the window, then record it.
    ///
    /// The window lock is held across the sleep so concurrent callers are admitted
    /// one at a time and the limit holds for all of them together.
    pub async fn admit(&self) {
        let mut window = self.window.lock().await;
        let now = Instant::now();
        window.expire(now, self.config.period);

        if window.calls.len() >= self.config.max_calls {
            if let Some(&oldest) = window.calls.front() {
                let wait = self
                    .config
                    .period
                    .saturating_sub(now.duration_since(oldest));
                if !wait.is_zero() {
                    debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
                    tokio::time::sleep(wait).await;
                }
            }
            window.calls.clear();
        }

        window.calls.push_back(Instant::now());
    }

    /// Calls currently counted against the window
    pub async fn in_window(&self) -> usize {
        let mut window = self.window.lock().await;
        window.expire(Instant::now(), self.config.period);
        window.calls.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
