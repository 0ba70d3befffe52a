//! Rate-limit telemetry and the pre-request throttle.
//!
//! Snapshots are advisory: they are overwritten after every completed vendor call and read
//! before the next one on the same runtime key. Concurrent writers race, last one wins.

use crate::error::{LlmError, Result};
use crate::settings::EffectiveSettings;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_THROTTLE_THRESHOLD_PERCENT: f64 = 10.0;
pub const DEFAULT_THROTTLE_MAX_WAIT: Duration = Duration::from_secs(60);

/// Absent fields mean "unknown", never zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub requests_limit: Option<u64>,
    pub requests_remaining: Option<u64>,
    pub requests_reset: Option<DateTime<Utc>>,
    pub tokens_limit: Option<u64>,
    pub tokens_remaining: Option<u64>,
    pub tokens_reset: Option<DateTime<Utc>>,
    pub input_tokens_limit: Option<u64>,
    pub input_tokens_remaining: Option<u64>,
}

impl RateLimitSnapshot {
    /// Read `{vendor}-ratelimit-*` headers. Header names must already be lowercase.
    pub fn from_headers(headers: &HashMap<String, String>, vendor: &str) -> Self {
        let number = |field: &str| {
            headers
                .get(&format!("{vendor}-ratelimit-{field}"))
                .and_then(|v| v.trim().parse::<u64>().ok())
        };
        let timestamp = |field: &str| {
            headers
                .get(&format!("{vendor}-ratelimit-{field}"))
                .and_then(|v| parse_reset(v))
        };
        Self {
            requests_limit: number("requests-limit"),
            requests_remaining: number("requests-remaining"),
            requests_reset: timestamp("requests-reset"),
            tokens_limit: number("tokens-limit"),
            tokens_remaining: number("tokens-remaining"),
            tokens_reset: timestamp("tokens-reset"),
            input_tokens_limit: number("input-tokens-limit"),
            input_tokens_remaining: number("input-tokens-remaining"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

fn parse_reset(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleConfig {
    pub enabled: bool,
    pub threshold_percent: f64,
    pub max_wait: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_percent: DEFAULT_THROTTLE_THRESHOLD_PERCENT,
            max_wait: DEFAULT_THROTTLE_MAX_WAIT,
        }
    }
}

impl ThrottleConfig {
    pub fn from_settings(settings: &EffectiveSettings) -> Self {
        let defaults = Self::default();
        Self {
            enabled: settings
                .get_bool("rate-limit-throttle")
                .unwrap_or(defaults.enabled),
            threshold_percent: settings
                .get_f64("rate-limit-throttle-threshold")
                .unwrap_or(defaults.threshold_percent),
            max_wait: settings
                .get_u64("rate-limit-max-wait")
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_wait),
        }
    }
}

/// How long to wait before the next request, if at all.
///
/// Waits only when a quota (requests or tokens) is below the threshold and its reset is still
/// in the future; never longer than `max_wait`.
pub fn throttle_delay(
    snapshot: Option<&RateLimitSnapshot>,
    config: &ThrottleConfig,
    now: DateTime<Utc>,
) -> Option<Duration> {
    if !config.enabled {
        return None;
    }
    let snapshot = snapshot?;
    let quotas = [
        (
            snapshot.requests_remaining,
            snapshot.requests_limit,
            snapshot.requests_reset,
        ),
        (
            snapshot.tokens_remaining,
            snapshot.tokens_limit,
            snapshot.tokens_reset,
        ),
    ];

    quotas
        .into_iter()
        .filter_map(|(remaining, limit, reset)| {
            let (remaining, limit, reset) = (remaining?, limit?, reset?);
            if limit == 0 {
                return None;
            }
            let percent = remaining as f64 / limit as f64 * 100.0;
            if percent >= config.threshold_percent || reset <= now {
                return None;
            }
            (reset - now).to_std().ok()
        })
        .max()
        .map(|wait| wait.min(config.max_wait))
        .filter(|wait| !wait.is_zero())
}

/// Snapshots keyed by runtime (session or caller identity).
#[derive(Debug, Default)]
pub struct RateLimitRegistry {
    snapshots: DashMap<String, RateLimitSnapshot>,
}

impl RateLimitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, runtime: &str, snapshot: RateLimitSnapshot) {
        self.snapshots.insert(runtime.to_string(), snapshot);
    }

    pub fn snapshot(&self, runtime: &str) -> Option<RateLimitSnapshot> {
        self.snapshots.get(runtime).map(|s| s.value().clone())
    }

    pub fn remove(&self, runtime: &str) {
        self.snapshots.remove(runtime);
    }

    pub fn clear(&self) {
        self.snapshots.clear();
    }

    /// Sleep per [`throttle_delay`] for `runtime`. Returns the time waited.
    pub async fn throttle(
        &self,
        runtime: &str,
        config: &ThrottleConfig,
        cancel: &CancellationToken,
    ) -> Result<Duration> {
        let snapshot = self.snapshot(runtime);
        let Some(wait) = throttle_delay(snapshot.as_ref(), config, Utc::now()) else {
            return Ok(Duration::ZERO);
        };
        tracing::info!(
            runtime,
            wait_ms = wait.as_millis() as u64,
            "rate limit nearly exhausted; waiting for reset"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LlmError::Cancelled),
            _ = tokio::time::sleep(wait) => Ok(wait),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn low_requests(now: DateTime<Utc>, reset_in: chrono::Duration) -> RateLimitSnapshot {
        RateLimitSnapshot {
            requests_limit: Some(100),
            requests_remaining: Some(4),
            requests_reset: Some(now + reset_in),
            ..Default::default()
        }
    }

    #[test]
    fn parses_anthropic_headers() {
        let h = headers(&[
            ("anthropic-ratelimit-requests-limit", "50"),
            ("anthropic-ratelimit-requests-remaining", "49"),
            ("anthropic-ratelimit-requests-reset", "2026-10-18T12:00:30Z"),
            ("anthropic-ratelimit-tokens-limit", "80000"),
            ("anthropic-ratelimit-tokens-remaining", "79000"),
            ("anthropic-ratelimit-tokens-reset", "not a date"),
            ("anthropic-ratelimit-input-tokens-limit", "40000"),
            ("anthropic-ratelimit-input-tokens-remaining", "39000"),
        ]);
        let s = RateLimitSnapshot::from_headers(&h, "anthropic");
        assert_eq!(s.requests_limit, Some(50));
        assert_eq!(s.requests_remaining, Some(49));
        assert_eq!(
            s.requests_reset.map(|d| d.to_rfc3339()),
            Some("2026-10-18T12:00:30+00:00".to_string())
        );
        assert_eq!(s.tokens_reset, None);
        assert_eq!(s.input_tokens_remaining, Some(39000));
        assert!(RateLimitSnapshot::from_headers(&HashMap::new(), "anthropic").is_empty());
    }

    #[test]
    fn throttles_until_reset_when_below_threshold() {
        let now = Utc::now();
        let snapshot = low_requests(now, chrono::Duration::seconds(5));
        let wait = throttle_delay(Some(&snapshot), &ThrottleConfig::default(), now)
            .expect("should throttle");
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_millis(5000));
    }

    #[test]
    fn never_throttles_without_reason() {
        let now = Utc::now();
        let config = ThrottleConfig::default();

        assert_eq!(throttle_delay(None, &config, now), None);

        let past = low_requests(now, chrono::Duration::seconds(-5));
        assert_eq!(throttle_delay(Some(&past), &config, now), None);

        let mut healthy = low_requests(now, chrono::Duration::seconds(5));
        healthy.requests_remaining = Some(50);
        assert_eq!(throttle_delay(Some(&healthy), &config, now), None);

        let disabled = ThrottleConfig {
            enabled: false,
            ..config
        };
        let low = low_requests(now, chrono::Duration::seconds(5));
        assert_eq!(throttle_delay(Some(&low), &disabled, now), None);

        let unknown_limit = RateLimitSnapshot {
            requests_remaining: Some(0),
            requests_reset: Some(now + chrono::Duration::seconds(5)),
            ..Default::default()
        };
        assert_eq!(throttle_delay(Some(&unknown_limit), &config, now), None);
    }

    #[test]
    fn wait_is_capped_by_max_wait() {
        let now = Utc::now();
        let snapshot = low_requests(now, chrono::Duration::minutes(10));
        let config = ThrottleConfig {
            max_wait: Duration::from_secs(2),
            ..ThrottleConfig::default()
        };
        assert_eq!(
            throttle_delay(Some(&snapshot), &config, now),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn config_reads_settings() {
        let settings = EffectiveSettings::default()
            .with("rate-limit-throttle", "off")
            .with("rate-limit-throttle-threshold", 25)
            .with("rate-limit-max-wait", 1500);
        let config = ThrottleConfig::from_settings(&settings);
        assert!(!config.enabled);
        assert!((config.threshold_percent - 25.0).abs() < f64::EPSILON);
        assert_eq!(config.max_wait, Duration::from_millis(1500));
    }

    #[test]
    fn registry_isolates_runtimes() {
        let registry = RateLimitRegistry::new();
        let now = Utc::now();
        registry.record("session-a", low_requests(now, chrono::Duration::seconds(5)));
        assert!(registry.snapshot("session-a").is_some());
        assert!(registry.snapshot("session-b").is_none());
        registry.clear();
        assert!(registry.snapshot("session-a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_sleeps_then_returns() {
        let registry = RateLimitRegistry::new();
        registry.record(
            "rt",
            low_requests(Utc::now(), chrono::Duration::seconds(3)),
        );
        let waited = registry
            .throttle("rt", &ThrottleConfig::default(), &CancellationToken::new())
            .await
            .expect("throttle");
        assert!(waited > Duration::ZERO && waited <= Duration::from_secs(3));

        let none = registry
            .throttle("other", &ThrottleConfig::default(), &CancellationToken::new())
            .await
            .expect("throttle");
        assert_eq!(none, Duration::ZERO);
    }
}
