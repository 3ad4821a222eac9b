//! Bounded-attempt retry with exponential backoff.
//!
//! Wraps any fallible async operation. Cancellation is never retried; when
//! attempts run out the wrapper raises [`ProviderError::RetryExhausted`]
//! carrying the attempt count and the last underlying error.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use ema_core::config::RetrySettings;

use crate::ProviderError;

/// Retry policy. Built from [`RetrySettings`] or assembled directly in tests.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            enabled: settings.enabled,
            max_attempts: settings.max_attempts.max(1),
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            backoff_factor: settings.backoff_factor,
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

impl RetryConfig {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt as i32 - 1);
        let delay = self.initial_delay.mul_f64(factor.max(0.0));
        delay.min(self.max_delay)
    }
}

/// Run `op` up to `config.max_attempts` times.
///
/// A [`ProviderError::Cancelled`] outcome is returned immediately, whatever
/// attempt it happens on. With retries disabled the operation runs once and
/// its error passes through untouched.
pub async fn retry_async<T, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    if !config.enabled {
        return op().await;
    }

    let mut last_error: Option<ProviderError> = None;
    for attempt in 1..=config.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
            Err(e) => {
                if attempt < config.max_attempts {
                    let delay = config.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        max_attempts = config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "LLM call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_error = Some(e);
            }
        }
    }

    Err(ProviderError::RetryExhausted {
        attempts: config.max_attempts,
        last_error: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".into()),
    })
}
