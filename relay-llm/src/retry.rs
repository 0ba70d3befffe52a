//! Bounded retry with exponential backoff and jitter.
//!
//! [`retry_stream`] drives one logical call as a sequence of attempts. Items an attempt has
//! already yielded stay yielded; a retry reissues the original request and the caller only
//! sees items that had not been forwarded yet.

use crate::error::{LlmError, Result};
use crate::settings::EffectiveSettings;
use futures_util::{Stream, StreamExt};
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;
pub const DEFAULT_BASE_WAIT: Duration = Duration::from_millis(4000);
pub const DEFAULT_JITTER: f64 = 0.3;
const BACKOFF_MULTIPLIER: f64 = 2.0;

pub type AttemptStream<T> = Pin<Box<dyn Stream<Item = Result<T>> + Send>>;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_wait: Duration,
    pub multiplier: f64,
    /// Fraction of the expected wait, applied symmetrically.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_wait: DEFAULT_BASE_WAIT,
            multiplier: BACKOFF_MULTIPLIER,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// `retries` and `retrywait` (ms) override the compiled defaults.
    pub fn from_settings(settings: &EffectiveSettings) -> Self {
        let mut policy = Self::default();
        if let Some(n) = settings.get_u64("retries") {
            policy.max_attempts = u32::try_from(n).unwrap_or(u32::MAX).max(1);
        }
        if let Some(ms) = settings.get_u64("retrywait") {
            policy.base_wait = Duration::from_millis(ms);
        }
        policy
    }

    /// Expected wait before retry number `retry` (1-based), without jitter.
    pub fn expected_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let ms = self.base_wait.as_millis() as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(ms as u64)
    }

    /// Wait before retry number `retry` with jitter in `[1 - jitter, 1 + jitter]` applied.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let expected = self.expected_delay(retry).as_millis() as f64;
        let band = expected * self.jitter;
        let jittered = if band > 0.0 {
            expected + rand::thread_rng().gen_range(-band..=band)
        } else {
            expected
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    pub fn should_retry(&self, error: &LlmError, attempt: u32) -> bool {
        attempt < self.max_attempts && error.is_retryable()
    }
}

/// Run `attempt` until one completes, a fatal error occurs, or attempts run out.
///
/// `attempt` receives the 1-based attempt number and must build its vendor call from the
/// unmodified original request. The last error is surfaced unchanged.
pub fn retry_stream<T, F, Fut>(
    policy: RetryPolicy,
    cancel: CancellationToken,
    label: &'static str,
    mut attempt: F,
) -> impl Stream<Item = Result<T>> + Send
where
    T: Send + 'static,
    F: FnMut(u32) -> Fut + Send + 'static,
    Fut: Future<Output = Result<AttemptStream<T>>> + Send,
{
    async_stream::stream! {
        let mut n: u32 = 1;
        loop {
            let mut yielded = 0usize;
            let failure = 'attempt: {
                let opened = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(LlmError::Cancelled),
                    r = attempt(n) => r,
                };
                let mut inner = match opened {
                    Ok(s) => s,
                    Err(e) => break 'attempt e,
                };
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Some(Err(LlmError::Cancelled)),
                        item = inner.next() => item,
                    };
                    match next {
                        Some(Ok(item)) => {
                            yielded += 1;
                            yield Ok(item);
                        }
                        Some(Err(e)) => break 'attempt e,
                        None => {
                            if n > 1 {
                                tracing::debug!(provider = label, attempt = n, "retry succeeded");
                            }
                            return;
                        }
                    }
                }
            };

            if !policy.should_retry(&failure, n) {
                if failure.is_retryable() {
                    tracing::error!(
                        provider = label,
                        attempts = n,
                        error = %failure,
                        "retries exhausted"
                    );
                }
                yield Err(failure);
                return;
            }

            let delay = policy.delay_for_retry(n);
            tracing::warn!(
                provider = label,
                attempt = n,
                max_attempts = policy.max_attempts,
                yielded,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "retrying after transient error"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    yield Err(LlmError::Cancelled);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            n += 1;
        }
    }
}
