//! Tracks remaining Helix request budget from response headers, decides wait
//! duration on 429, and raises throttled warnings.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::warn;

use crate::error::RateLimitSnapshot;
use crate::transport::RateLimitHeaders;
use crate::util::now_epoch_ms;

const DEFAULT_WARNING_COOLDOWN: Duration = Duration::from_secs(60);
const MAX_BACKOFF_MS: u64 = 30_000;

/// `{ limit, remaining, resetAt, consecutiveHits }`.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitState {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at_ms: i64,
    pub consecutive_hits: u32,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self {
            limit: u32::MAX,
            remaining: u32::MAX,
            reset_at_ms: 0,
            consecutive_hits: 0,
        }
    }
}

struct Inner {
    state: RateLimitState,
    last_warning: Option<Instant>,
}

/// Shared by every call a [`crate::helix::HelixClient`] makes.
pub struct RateLimitManager {
    inner: Mutex<Inner>,
    warning_cooldown: Duration,
}

impl Default for RateLimitManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitManager {
    pub fn new() -> Self {
        Self::with_warning_cooldown(DEFAULT_WARNING_COOLDOWN)
    }

    /// As [`RateLimitManager::new`], but with the "budget running low"
    /// warning's cooldown overridden (the `helix.rate_limit_warning_cooldown_secs`
    /// config knob).
    pub fn with_warning_cooldown(warning_cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: RateLimitState::default(),
                last_warning: None,
            }),
            warning_cooldown,
        }
    }

    pub async fn on_request_attempt(&self, headers: &RateLimitHeaders) {
        let mut inner = self.inner.lock().await;
        inner.state.limit = headers.limit;
        inner.state.remaining = headers.remaining;
        inner.state.reset_at_ms = headers.reset * 1000;

        if headers.limit > 0 && headers.remaining < headers.limit / 10 {
            let should_warn = inner
                .last_warning
                .map(|t| t.elapsed() >= self.warning_cooldown)
                .unwrap_or(true);
            if should_warn {
                warn!(
                    remaining = headers.remaining,
                    limit = headers.limit,
                    "Helix rate-limit budget running low"
                );
                inner.last_warning = Some(Instant::now());
            }
        }
    }

    pub async fn on_rate_limit_hit(&self) -> Duration {
        let mut inner = self.inner.lock().await;
        inner.state.consecutive_hits += 1;
        let hits = inner.state.consecutive_hits;

        if hits == 1 {
            warn!("Helix request was rate-limited (429)");
            inner.last_warning = Some(Instant::now());
        }

        let reset_wait = (inner.state.reset_at_ms - now_epoch_ms()).max(0) as u64;
        let backoff = (1000u64.saturating_mul(1 << (hits - 1).min(5))).min(MAX_BACKOFF_MS);

        Duration::from_millis(reset_wait.max(backoff))
    }

    pub async fn on_successful_request(&self) {
        let mut inner = self.inner.lock().await;
        inner.state.consecutive_hits = 0;
    }

    pub async fn rate_limit_state(&self) -> RateLimitState {
        self.inner.lock().await.state
    }

    pub async fn snapshot(&self) -> RateLimitSnapshot {
        let state = self.rate_limit_state().await;
        RateLimitSnapshot {
            limit: state.limit,
            remaining: state.remaining,
            reset_at_ms: state.reset_at_ms,
        }
    }
}
