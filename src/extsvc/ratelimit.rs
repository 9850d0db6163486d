//! Passive tracking of code-host rate-limit headers.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::gauge;
use reqwest::header::HeaderMap;

use super::header_str;

/// Header names a code host uses to report its budget.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitHeaders {
    pub limit: &'static str,
    pub remaining: &'static str,
    pub reset: &'static str,
}

pub const GITHUB_HEADERS: RateLimitHeaders = RateLimitHeaders {
    limit: "X-RateLimit-Limit",
    remaining: "X-RateLimit-Remaining",
    reset: "X-RateLimit-Reset",
};

pub const GITLAB_HEADERS: RateLimitHeaders = RateLimitHeaders {
    limit: "RateLimit-Limit",
    remaining: "RateLimit-Remaining",
    reset: "RateLimit-Reset",
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitState {
    pub limit: i64,
    pub remaining: i64,
    pub reset: DateTime<Utc>,
}

/// Last observed rate-limit budget for one client.
#[derive(Debug)]
pub struct RateLimitMonitor {
    client: &'static str,
    headers: RateLimitHeaders,
    state: Mutex<Option<RateLimitState>>,
}

impl RateLimitMonitor {
    pub fn new(client: &'static str, headers: RateLimitHeaders) -> Self {
        Self {
            client,
            headers,
            state: Mutex::new(None),
        }
    }

    /// Record the budget reported by a response. Responses without the headers are ignored.
    pub fn update(&self, headers: &HeaderMap) {
        let parse = |name| header_str(headers, name).and_then(|v| v.parse::<i64>().ok());
        let (Some(limit), Some(remaining), Some(reset)) = (
            parse(self.headers.limit),
            parse(self.headers.remaining),
            parse(self.headers.reset),
        ) else {
            return;
        };
        let Some(reset) = DateTime::from_timestamp(reset, 0) else {
            return;
        };

        gauge!("permsync_codehost_rate_limit_remaining", "client" => self.client)
            .set(remaining as f64);
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
            Some(RateLimitState {
                limit,
                remaining,
                reset,
            });
    }

    pub fn get(&self) -> Option<RateLimitState> {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// How long to wait before spending `cost` requests.
    pub fn recommended_wait(&self, cost: i64) -> Duration {
        self.recommended_wait_at(cost, Utc::now())
    }

    fn recommended_wait_at(&self, cost: i64, now: DateTime<Utc>) -> Duration {
        let Some(state) = self.get() else {
            return Duration::ZERO;
        };
        let until_reset = (state.reset - now).to_std().unwrap_or(Duration::ZERO);
        if until_reset.is_zero() {
            return Duration::ZERO;
        }

        let left_after = state.remaining - cost;
        if left_after < 0 {
            return until_reset;
        }
        // More than half the budget left: no need to slow down.
        if left_after >= state.limit / 2 {
            return Duration::ZERO;
        }
        // Spread the remaining budget evenly over the time left in the window.
        let share = cost.max(1) as u32;
        until_reset * share / (left_after as u32 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(limit: i64, remaining: i64, reset: DateTime<Utc>) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert("X-RateLimit-Limit", HeaderValue::from(limit));
        map.insert("X-RateLimit-Remaining", HeaderValue::from(remaining));
        map.insert("X-RateLimit-Reset", HeaderValue::from(reset.timestamp()));
        map
    }

    #[test]
    fn unknown_budget_means_no_wait() {
        let monitor = RateLimitMonitor::new("github", GITHUB_HEADERS);
        assert_eq!(monitor.recommended_wait(1), Duration::ZERO);

        monitor.update(&HeaderMap::new());
        assert!(monitor.get().is_none());
    }

    #[test]
    fn plentiful_budget_means_no_wait() {
        let now = Utc::now();
        let monitor = RateLimitMonitor::new("github", GITHUB_HEADERS);
        monitor.update(&headers(5000, 4000, now + chrono::Duration::minutes(30)));

        let state = monitor.get().unwrap();
        assert_eq!(state.limit, 5000);
        assert_eq!(state.remaining, 4000);
        assert_eq!(monitor.recommended_wait_at(1, now), Duration::ZERO);
    }

    #[test]
    fn exhausted_budget_waits_until_reset() {
        let now = Utc::now();
        let monitor = RateLimitMonitor::new("github", GITHUB_HEADERS);
        monitor.update(&headers(5000, 0, now + chrono::Duration::seconds(120)));

        let wait = monitor.recommended_wait_at(1, now);
        assert!(wait > Duration::from_secs(100) && wait <= Duration::from_secs(120));
    }

    #[test]
    fn low_budget_spreads_requests() {
        let now = Utc::now();
        let monitor = RateLimitMonitor::new("github", GITHUB_HEADERS);
        monitor.update(&headers(5000, 100, now + chrono::Duration::seconds(1000)));

        let wait = monitor.recommended_wait_at(1, now);
        assert!(wait > Duration::ZERO && wait < Duration::from_secs(20));
    }
}
