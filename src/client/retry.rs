//! Retry configuration and delay policies.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::request::Request;

/// Decides whether a failed attempt may be retried.
pub type RetryIfFunc = Arc<dyn Fn(&Request, &crate::Error) -> bool + Send + Sync>;

/// Computes the pause before attempt `attempts + 1`.
pub type DelayPolicyFn = Arc<dyn Fn(u32, &RetryConfig) -> Duration + Send + Sync>;

#[derive(Clone)]
pub struct RetryConfig {
    /// Total attempts, first try included. 1 disables retrying.
    pub max_attempt_times: u32,
    /// Base delay fed to the delay policies.
    pub delay: Duration,
    /// Hard cap applied to whatever the policy computes; zero disables the
    /// cap.
    pub max_delay: Duration,
    /// Upper bound of the random policy's jitter.
    pub max_jitter: Duration,
    pub delay_policy: DelayPolicyFn,
    pub retry_if: Option<RetryIfFunc>,
}

impl Default for RetryConfig {
    fn default() -> RetryConfig {
        RetryConfig {
            max_attempt_times: 1,
            delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(100),
            max_jitter: Duration::ZERO,
            delay_policy: Arc::new(default_delay_policy),
            retry_if: None,
        }
    }
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempt_times", &self.max_attempt_times)
            .field("delay", &self.delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

impl RetryConfig {
    /// The policy's delay for the given zero-based attempt count, capped by
    /// `max_delay`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let delay = (self.delay_policy)(attempts, self);
        if !self.max_delay.is_zero() && delay > self.max_delay {
            self.max_delay
        } else {
            delay
        }
    }
}

/// Always `config.delay`.
pub fn fixed_delay_policy(_attempts: u32, config: &RetryConfig) -> Duration {
    config.delay
}

/// Uniform in `[0, max_jitter)`; zero when no jitter is configured.
pub fn random_delay_policy(_attempts: u32, config: &RetryConfig) -> Duration {
    let jitter = config.max_jitter.as_nanos() as u64;
    if jitter == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..jitter))
}

/// `config.delay << attempts`, shift capped at 62, saturating at
/// `i64::MAX` nanoseconds.
pub fn backoff_delay_policy(attempts: u32, config: &RetryConfig) -> Duration {
    if config.delay.is_zero() {
        return Duration::ZERO;
    }
    let shift = attempts.min(62);
    let base = config.delay.as_nanos().min(i64::MAX as u128) as u64;
    let nanos = if base > (i64::MAX as u64) >> shift {
        i64::MAX as u64
    } else {
        base << shift
    };
    Duration::from_nanos(nanos)
}

/// No pause between attempts.
pub fn default_delay_policy(_attempts: u32, _config: &RetryConfig) -> Duration {
    Duration::ZERO
}

/// Sums the delays of `policies`, saturating at `i64::MAX` nanoseconds.
pub fn combine_delay(policies: Vec<DelayPolicyFn>) -> DelayPolicyFn {
    Arc::new(move |attempts, config| {
        let mut total: i64 = 0;
        for policy in &policies {
            let d = policy(attempts, config).as_nanos();
            let d = if d > i64::MAX as u128 {
                i64::MAX
            } else {
                d as i64
            };
            total = total.saturating_add(d);
        }
        Duration::from_nanos(total as u64)
    })
}

/// The default transient-failure test: connection-level errors on
/// idempotent requests.
pub fn default_retry_if(req: &Request, err: &crate::Error) -> bool {
    let transient = err.is_closed() || err.is_timeout() || err.is_incomplete_message();
    if !transient {
        return false;
    }
    matches!(
        *req.method(),
        http::Method::GET
            | http::Method::HEAD
            | http::Method::PUT
            | http::Method::DELETE
            | http::Method::OPTIONS
            | http::Method::TRACE
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(delay_ms: u64) -> RetryConfig {
        RetryConfig {
            delay: Duration::from_millis(delay_ms),
            max_delay: Duration::ZERO,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let cfg = config(1);
        assert_eq!(
            backoff_delay_policy(0, &cfg),
            Duration::from_millis(1)
        );
        assert_eq!(
            backoff_delay_policy(3, &cfg),
            Duration::from_millis(8)
        );
    }

    #[test]
    fn backoff_caps_shift_at_62() {
        let cfg = config(1);
        assert_eq!(
            backoff_delay_policy(100, &cfg),
            backoff_delay_policy(62, &cfg)
        );
    }

    #[test]
    fn backoff_saturates_instead_of_wrapping() {
        // 1ms << 62 exceeds i64::MAX nanoseconds; the policy must pin at
        // the ceiling, never wrap back toward zero.
        let cfg = config(1);
        assert_eq!(
            backoff_delay_policy(100, &cfg),
            Duration::from_nanos(i64::MAX as u64)
        );
        assert!(backoff_delay_policy(100, &cfg) > backoff_delay_policy(10, &cfg));
    }

    #[test]
    fn backoff_zero_delay_is_zero() {
        let cfg = config(0);
        assert_eq!(backoff_delay_policy(10, &cfg), Duration::ZERO);
    }

    #[test]
    fn combine_sums_and_saturates() {
        let cfg = config(1);
        let combined = combine_delay(vec![
            Arc::new(fixed_delay_policy),
            Arc::new(fixed_delay_policy),
        ]);
        assert_eq!(combined(0, &cfg), Duration::from_millis(2));

        let huge: DelayPolicyFn = Arc::new(|_, _| Duration::from_nanos(i64::MAX as u64));
        let saturated = combine_delay(vec![huge.clone(), huge]);
        assert_eq!(saturated(0, &cfg), Duration::from_nanos(i64::MAX as u64));
    }

    #[test]
    fn max_delay_caps_policy_output() {
        let mut cfg = config(1);
        cfg.delay_policy = Arc::new(backoff_delay_policy);
        cfg.max_delay = Duration::from_millis(4);
        assert_eq!(cfg.delay_for(10), Duration::from_millis(4));
        assert_eq!(cfg.delay_for(1), Duration::from_millis(2));
    }

    #[test]
    fn random_policy_without_jitter_is_zero() {
        let cfg = config(1);
        assert_eq!(random_delay_policy(0, &cfg), Duration::ZERO);
    }

    #[test]
    fn random_policy_bounded_by_jitter() {
        let mut cfg = config(1);
        cfg.max_jitter = Duration::from_millis(5);
        for _ in 0..100 {
            assert!(random_delay_policy(0, &cfg) < Duration::from_millis(5));
        }
    }

    #[test]
    fn default_retry_if_is_method_aware() {
        let err = crate::Error::new_closed();
        let get = Request::new(http::Method::GET, "/".parse().unwrap());
        let post = Request::new(http::Method::POST, "/".parse().unwrap());
        assert!(default_retry_if(&get, &err));
        assert!(!default_retry_if(&post, &err));
        assert!(!default_retry_if(&get, &crate::Error::new_too_large()));
    }
}
