use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::ProviderError;

/// Retry policy applied to a single model identifier before falling back.
#[derive(Debug, Clone)]
pub enum RetryPolicy {
    /// Advance to the next model on any retryable failure.
    Immediate,
    /// One extra attempt on the same model after a rate-limit response, after a jittered delay.
    RateLimitRetry(RetryConfig),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::RateLimitRetry(RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        if cfg.rate_limit_retry {
            Self::RateLimitRetry(cfg.clone())
        } else {
            Self::Immediate
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying the same model, or `None` to move on.
    /// `retries_used` counts same-model retries already spent on this identifier.
    pub fn same_model_delay(&self, err: &ProviderError, retries_used: u32) -> Option<Duration> {
        match self {
            Self::Immediate => None,
            Self::RateLimitRetry(cfg) => {
                if retries_used > 0 || !err.is_rate_limit() {
                    return None;
                }
                Some(jittered(cfg))
            }
        }
    }
}

fn jittered(cfg: &RetryConfig) -> Duration {
    let base = cfg.initial_delay_ms as f64;
    let spread = cfg.jitter_factor.clamp(0.0, 1.0);
    let factor = if spread > 0.0 {
        rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread))
    } else {
        1.0
    };
    let delay = Duration::from_millis((base * factor) as u64);
    std::cmp::min(delay, Duration::from_millis(cfg.max_delay_ms))
}
