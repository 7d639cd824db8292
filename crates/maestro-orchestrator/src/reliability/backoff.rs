use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shape of the delay curve between retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base_delay` every time.
    Fixed,
    /// `base_delay * attempt`.
    Linear,
    /// `base_delay * multiplier^(attempt - 1)`.
    #[default]
    Exponential,
    /// `base_delay * fib(attempt)` with `fib(1) = fib(2) = 1`.
    Fibonacci,
}

/// Delay schedule applied before a failed task is retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Shape of the delay curve.
    pub strategy: BackoffStrategy,
    /// Delay of the first retry.
    #[serde(with = "maestro_core::duration_ms")]
    pub base_delay: Duration,
    /// Upper bound on any delay.
    #[serde(with = "maestro_core::duration_ms")]
    pub max_delay: Duration,
    /// Growth factor of the exponential strategy.
    pub multiplier: f64,
    /// Randomise each delay by ±25 %.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy without any delay, for callers that retry immediately.
    pub fn immediate() -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay before retry number `attempt` (1 for the first retry).
    ///
    /// Never exceeds `max_delay`, jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_ms = self.base_delay.as_secs_f64() * 1000.0;
        let raw_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Linear => base_ms * f64::from(attempt),
            BackoffStrategy::Exponential => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                base_ms * self.multiplier.max(1.0).powi(exponent)
            }
            BackoffStrategy::Fibonacci => base_ms * fibonacci(attempt),
        };

        let max_ms = self.max_delay.as_secs_f64() * 1000.0;
        let mut delay_ms = if raw_ms.is_finite() { raw_ms.min(max_ms) } else { max_ms };
        if self.jitter && delay_ms > 0.0 {
            delay_ms *= rand::thread_rng().gen_range(0.75..=1.25);
            delay_ms = delay_ms.min(max_ms);
        }
        Duration::from_micros((delay_ms.max(0.0) * 1000.0).round() as u64)
    }
}

fn fibonacci(n: u32) -> f64 {
    let (mut a, mut b) = (0.0_f64, 1.0_f64);
    for _ in 1..n {
        let next = a + b;
        a = b;
        b = next;
        if !b.is_finite() {
            break;
        }
    }
    b
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            strategy,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
        }
    }

    fn delays(policy: &RetryPolicy) -> Vec<u128> {
        (1..=6).map(|a| policy.delay_for(a).as_millis()).collect()
    }

    #[test]
    fn test_fixed() {
        assert_eq!(delays(&policy(BackoffStrategy::Fixed)), vec![100; 6]);
    }

    #[test]
    fn test_linear() {
        assert_eq!(
            delays(&policy(BackoffStrategy::Linear)),
            vec![100, 200, 300, 400, 500, 600]
        );
    }

    #[test]
    fn test_exponential() {
        assert_eq!(
            delays(&policy(BackoffStrategy::Exponential)),
            vec![100, 200, 400, 800, 1600, 3200]
        );
    }

    #[test]
    fn test_fibonacci() {
        assert_eq!(
            delays(&policy(BackoffStrategy::Fibonacci)),
            vec![100, 100, 200, 300, 500, 800]
        );
    }

    #[test]
    fn test_capped_at_max_delay() {
        let mut p = policy(BackoffStrategy::Exponential);
        p.max_delay = Duration::from_millis(250);
        assert_eq!(p.delay_for(10), Duration::from_millis(250));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_millis(250));
    }

    #[test]
    fn test_jitter_stays_in_band_and_under_cap() {
        let mut p = policy(BackoffStrategy::Fixed);
        p.jitter = true;
        for _ in 0..200 {
            let ms = p.delay_for(1).as_millis();
            assert!((75..=125).contains(&ms), "jittered delay {ms}ms out of band");
        }
        p.max_delay = Duration::from_millis(100);
        for _ in 0..200 {
            assert!(p.delay_for(1) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_immediate_policy() {
        assert_eq!(RetryPolicy::immediate().delay_for(5), Duration::ZERO);
    }

    #[test]
    fn test_strategy_deserializes_snake_case() {
        let p: RetryPolicy =
            serde_json::from_str(r#"{"strategy":"fibonacci","base_delay":50}"#).unwrap_or_default();
        assert_eq!(p.strategy, BackoffStrategy::Fibonacci);
        assert_eq!(p.base_delay, Duration::from_millis(50));
    }
}
