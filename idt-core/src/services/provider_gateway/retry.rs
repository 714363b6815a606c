//! Retry decisions and backoff delays for provider calls

use idt_common::{BackoffConfig, ProviderConfig};
use rand::Rng;
use std::time::Duration;

/// Retry policy derived from a provider config
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: BackoffConfig,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: BackoffConfig) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(config.max_retries, config.backoff.clone())
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether retry number `retry` (0-based) is allowed
    pub fn should_retry(&self, retry: u32) -> bool {
        retry < self.max_retries
    }

    /// Delay before retry number `retry` (0-based)
    ///
    /// Exponential with jitter. A provider's Retry-After hint wins when it asks for
    /// a longer wait, but never beyond the configured cap.
    pub fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let delay = apply_jitter(self.backoff.nominal_delay(retry), self.backoff.jitter);
        let cap = Duration::from_millis(self.backoff.max_delay_ms);
        match hint {
            Some(hint) if hint > delay => hint.min(cap),
            _ => delay,
        }
    }
}

/// Spread `delay` uniformly over `[delay * (1 - jitter), delay * (1 + jitter)]`
pub fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            BackoffConfig {
                base_delay_ms: 100,
                max_delay_ms: 1000,
                jitter: 0.2,
            },
        )
    }

    #[test]
    fn test_should_retry_bound() {
        let p = policy(2);
        assert!(p.should_retry(0));
        assert!(p.should_retry(1));
        assert!(!p.should_retry(2));
        assert!(!policy(0).should_retry(0));
    }

    #[test]
    fn test_jitter_stays_within_twenty_percent() {
        let base = Duration::from_millis(1000);
        for _ in 0..200 {
            let d = apply_jitter(base, 0.2);
            assert!(d >= Duration::from_millis(800), "{:?}", d);
            assert!(d <= Duration::from_millis(1200), "{:?}", d);
        }
        assert_eq!(apply_jitter(base, 0.0), base);
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let p = policy(10);
        let first = p.delay_for(0, None);
        assert!(first <= Duration::from_millis(120));
        let late = p.delay_for(8, None);
        assert!(late <= Duration::from_millis(1200));
        assert!(late >= Duration::from_millis(800));
    }

    #[test]
    fn test_retry_after_hint_respected_up_to_cap() {
        let p = policy(3);
        assert_eq!(
            p.delay_for(0, Some(Duration::from_millis(700))),
            Duration::from_millis(700)
        );
        assert_eq!(
            p.delay_for(0, Some(Duration::from_secs(60))),
            Duration::from_millis(1000)
        );
    }
}
