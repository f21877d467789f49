//! Discord rate-limit handling.
//!
//! A 429 carries `Retry-After` and, when the whole bot is throttled,
//! `X-RateLimit-Global`. The gate remembers both so later requests wait
//! instead of hammering the API.

use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Wait used when a 429 carries no usable `Retry-After`.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

const GLOBAL_HEADER: &str = "x-ratelimit-global";

/// Parse a `Retry-After` value given in (possibly fractional) seconds.
///
/// Values that do not fit a [`Duration`] are rejected.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let seconds: f64 = value.trim().parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(seconds).ok()
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// What a 429 response told us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub retry_after: Duration,
    pub global: bool,
}

impl RateLimitInfo {
    /// Read the backoff from response headers.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let retry_after = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after)
            .unwrap_or(DEFAULT_RETRY_AFTER);

        let global = headers
            .get(GLOBAL_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        Self {
            retry_after,
            global,
        }
    }

    /// Limit the backoff to `cap`.
    #[must_use]
    pub fn capped(self, cap: Duration) -> Self {
        Self {
            retry_after: self.retry_after.min(cap),
            ..self
        }
    }
}

/// Remembers active backoffs, globally and per route.
#[derive(Debug, Default)]
pub struct BackoffGate {
    global_until: Mutex<Option<Instant>>,
    routes: Mutex<HashMap<String, Instant>>,
}

impl BackoffGate {
    /// Create an open gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a 429 for `route`.
    pub async fn record(&self, route: &str, info: RateLimitInfo) {
        let Some(until) = Instant::now().checked_add(info.retry_after) else {
            warn!(route = %route, "Backoff beyond the clock's range, ignoring");
            return;
        };
        if info.global {
            let mut global = self.global_until.lock().await;
            *global = Some(global.map_or(until, |current| current.max(until)));
        } else {
            self.routes.lock().await.insert(route.to_string(), until);
        }
    }

    /// How long `route` must still wait, if at all.
    pub async fn remaining(&self, route: &str) -> Option<Duration> {
        let now = Instant::now();
        let global = *self.global_until.lock().await;
        let route_until = self.routes.lock().await.get(route).copied();

        [global, route_until]
            .into_iter()
            .flatten()
            .filter(|until| *until > now)
            .max()
            .map(|until| until - now)
    }

    /// Sleep until `route` may be called, waiting at most `cap`.
    pub async fn wait(&self, route: &str, cap: Duration) {
        if let Some(remaining) = self.remaining(route).await {
            let wait = remaining.min(cap);
            debug!(route = %route, wait_ms = millis(wait), "Waiting out Discord backoff");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Log a rate-limit hit.
pub(crate) fn log_rate_limited(route: &str, info: &RateLimitInfo, attempt: u32) {
    warn!(
        route = %route,
        attempt,
        global = info.global,
        retry_after_ms = millis(info.retry_after),
        "Rate limited (429) by Discord"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after("0.5"), Some(Duration::from_millis(500)));
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after(""), None);
    }

    #[test]
    fn test_parse_retry_after_out_of_range() {
        assert_eq!(parse_retry_after("1e30"), None);
        assert_eq!(parse_retry_after("inf"), None);
        assert_eq!(parse_retry_after("NaN"), None);
        assert!(parse_retry_after("1e18").is_some());
    }

    #[test]
    fn test_huge_retry_after_is_capped() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("1e18"));
        let info = RateLimitInfo::from_headers(&headers).capped(Duration::from_secs(60));
        assert_eq!(info.retry_after, Duration::from_secs(60));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("1e30"));
        let info = RateLimitInfo::from_headers(&headers);
        assert_eq!(info.retry_after, DEFAULT_RETRY_AFTER);
    }

    #[test]
    fn test_info_defaults_without_headers() {
        let info = RateLimitInfo::from_headers(&HeaderMap::new());
        assert_eq!(info.retry_after, DEFAULT_RETRY_AFTER);
        assert!(!info.global);
    }

    #[test]
    fn test_info_reads_global_flag() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("1.25"));
        headers.insert(GLOBAL_HEADER, HeaderValue::from_static("true"));
        let info = RateLimitInfo::from_headers(&headers);
        assert_eq!(info.retry_after, Duration::from_millis(1250));
        assert!(info.global);
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_backoff_is_scoped() {
        let gate = BackoffGate::new();
        gate.record(
            "members",
            RateLimitInfo {
                retry_after: Duration::from_secs(3),
                global: false,
            },
        )
        .await;

        assert!(gate.remaining("members").await.is_some());
        assert!(gate.remaining("roles").await.is_none());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(gate.remaining("members").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_backoff_is_ignored() {
        let gate = BackoffGate::new();
        gate.record(
            "members",
            RateLimitInfo {
                retry_after: Duration::MAX,
                global: true,
            },
        )
        .await;
        assert!(gate.remaining("members").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_backoff_applies_everywhere() {
        let gate = BackoffGate::new();
        gate.record(
            "members",
            RateLimitInfo {
                retry_after: Duration::from_secs(2),
                global: true,
            },
        )
        .await;

        assert!(gate.remaining("roles").await.is_some());

        let start = Instant::now();
        gate.wait("roles", Duration::from_secs(10)).await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
