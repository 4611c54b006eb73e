//! Fixed-window request limits for the sync endpoints, keyed per user

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tasksync_core::util::user_fingerprint;
use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::error::AppError;

/// Windows tracked before expired ones are swept
const SWEEP_THRESHOLD: usize = 4_096;

/// Shared limiter for `/sync/push` and `/sync/pull`.
///
/// Each (endpoint, user) pair gets its own window; a push burst never eats
/// into the same user's pull allowance.
#[derive(Clone)]
pub struct EndpointRateLimiter {
    windows: Arc<Mutex<HashMap<(ProtectedEndpoint, String), RateWindow>>>,
    window: Duration,
    push_limit: u32,
    pull_limit: u32,
    push: Arc<EndpointCounters>,
    pull: Arc<EndpointCounters>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtectedEndpoint {
    Push,
    Pull,
}

#[derive(Default)]
struct EndpointCounters {
    allowed: AtomicU64,
    limited: AtomicU64,
}

/// Admission counters reported by the health route
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub push_allowed: u64,
    pub push_limited: u64,
    pub pull_allowed: u64,
    pub pull_limited: u64,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started_at: Instant,
    count: u32,
}

impl RateWindow {
    const fn open(now: Instant) -> Self {
        Self {
            started_at: now,
            count: 0,
        }
    }

    fn expired(&self, now: Instant, window: Duration) -> bool {
        now.duration_since(self.started_at) >= window
    }

    /// Admit one request, or return how long until the window reopens
    fn admit(&mut self, now: Instant, window: Duration, limit: u32) -> Result<(), Duration> {
        if self.expired(now, window) {
            *self = Self::open(now);
        }
        if self.count >= limit {
            return Err(window.saturating_sub(now.duration_since(self.started_at)));
        }
        self.count += 1;
        Ok(())
    }
}

impl EndpointRateLimiter {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.rate_limit_window,
            config.push_rate_limit_per_window,
            config.pull_rate_limit_per_window,
        )
    }

    fn new(window: Duration, push_limit: u32, pull_limit: u32) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            window,
            push_limit,
            pull_limit,
            push: Arc::default(),
            pull: Arc::default(),
        }
    }

    /// Count one request against the user's fixed window for `endpoint`
    pub async fn check(&self, endpoint: ProtectedEndpoint, user_id: &str) -> Result<(), AppError> {
        let now = Instant::now();
        let admitted = {
            let mut windows = self.windows.lock().await;
            if windows.len() >= SWEEP_THRESHOLD {
                windows.retain(|_, tracked| !tracked.expired(now, self.window));
            }
            windows
                .entry((endpoint, user_id.to_string()))
                .or_insert_with(|| RateWindow::open(now))
                .admit(now, self.window, self.limit_for(endpoint))
        };

        let counters = self.counters(endpoint);
        match admitted {
            Ok(()) => {
                counters.allowed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(retry_after) => {
                counters.limited.fetch_add(1, Ordering::Relaxed);
                let retry_after_secs = retry_after.as_secs();
                tracing::warn!(
                    endpoint = endpoint.label(),
                    user = user_fingerprint(user_id),
                    retry_after_secs,
                    "Rate limit exceeded"
                );
                Err(AppError::too_many_requests(
                    format!("Rate limit exceeded for {}", endpoint.label()),
                    retry_after_secs,
                ))
            }
        }
    }

    pub fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            push_allowed: self.push.allowed.load(Ordering::Relaxed),
            push_limited: self.push.limited.load(Ordering::Relaxed),
            pull_allowed: self.pull.allowed.load(Ordering::Relaxed),
            pull_limited: self.pull.limited.load(Ordering::Relaxed),
        }
    }

    const fn limit_for(&self, endpoint: ProtectedEndpoint) -> u32 {
        match endpoint {
            ProtectedEndpoint::Push => self.push_limit,
            ProtectedEndpoint::Pull => self.pull_limit,
        }
    }

    fn counters(&self, endpoint: ProtectedEndpoint) -> &EndpointCounters {
        match endpoint {
            ProtectedEndpoint::Push => &self.push,
            ProtectedEndpoint::Pull => &self.pull,
        }
    }
}

impl ProtectedEndpoint {
    /// Name used in log fields and 429 bodies
    pub const fn label(self) -> &'static str {
        match self {
            Self::Push => "sync_push",
            Self::Pull => "sync_pull",
        }
    }
}
