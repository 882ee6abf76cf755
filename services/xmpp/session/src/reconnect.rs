//! Reconnection policy and backoff.

use rand::Rng;
use std::time::Duration;

/// Capped exponential backoff
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on the exponential part
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub factor: f64,
    /// Extra random delay as a fraction of the computed delay
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Reject inconsistent bounds
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_delay.is_zero() {
            return Err("Initial reconnect delay must be > 0".to_string());
        }
        if self.max_delay.is_zero() {
            return Err("Max reconnect delay must be > 0".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err("Max reconnect delay must be >= initial reconnect delay".to_string());
        }
        if self.factor < 1.0 || !self.factor.is_finite() {
            return Err("Backoff factor must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) || !self.jitter.is_finite() {
            return Err("Jitter must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }
}

/// Delay before attempt `attempt` (1-based)
pub fn calculate_backoff(config: BackoffConfig, attempt: u32) -> Duration {
    let initial = config.initial_delay.as_secs_f64();
    let max = config.max_delay.as_secs_f64();
    let exponent = config.factor.powf(f64::from(attempt.saturating_sub(1)));
    let base = (initial * exponent).min(max);

    if config.jitter == 0.0 {
        return Duration::from_secs_f64(base);
    }

    let mut rng = rand::thread_rng();
    let extra = rng.gen_range(0.0..=base * config.jitter);
    Duration::from_secs_f64(base + extra)
}

/// When and how often to reconnect after an unexpected loss
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconnectPolicy {
    /// Reconnect at all
    pub enabled: bool,
    /// Give up after this many attempts; `None` retries forever
    pub max_attempts: Option<u32>,
    /// Delay between attempts
    pub backoff: BackoffConfig,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: Some(10),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ReconnectPolicy {
    /// Policy that never reconnects
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Whether attempt `attempt` (1-based) may run
    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = no_jitter();
        assert_eq!(calculate_backoff(config, 1), Duration::from_millis(100));
        assert_eq!(calculate_backoff(config, 2), Duration::from_millis(200));
        assert_eq!(calculate_backoff(config, 3), Duration::from_millis(400));
        assert_eq!(calculate_backoff(config, 5), Duration::from_secs(1));
        assert_eq!(calculate_backoff(config, 50), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_bounds() {
        let config = BackoffConfig {
            jitter: 0.5,
            ..no_jitter()
        };
        for _ in 0..100 {
            let delay = calculate_backoff(config, 2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_validate() {
        assert!(BackoffConfig::default().validate().is_ok());
        let bad = BackoffConfig {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(1),
            ..BackoffConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = BackoffConfig {
            jitter: 1.5,
            ..BackoffConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_policy_allows() {
        let policy = ReconnectPolicy {
            max_attempts: Some(2),
            ..ReconnectPolicy::default()
        };
        assert!(policy.allows(1));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
        assert!(!ReconnectPolicy::disabled().allows(1));
        let forever = ReconnectPolicy {
            max_attempts: None,
            ..ReconnectPolicy::default()
        };
        assert!(forever.allows(u32::MAX));
    }
}
