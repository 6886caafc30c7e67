use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Bounded exponential backoff with jitter, used for reconnect attempts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Backoff {
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.2,
        }
    }
}

impl Backoff {
    /// Delay to wait before attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        // base * 2^attempt, capped
        let exp_ms = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt.min(31) as i32);
        let capped = exp_ms.min(self.max_delay.as_millis() as f64);

        // delay * (1 ± jitter_factor)
        let jitter_range = capped * self.jitter_factor.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> Backoff {
        Backoff {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn exponential_growth() {
        let backoff = no_jitter();
        assert_eq!(backoff.delay(0).as_millis(), 100);
        assert_eq!(backoff.delay(1).as_millis(), 200);
        assert_eq!(backoff.delay(2).as_millis(), 400);
    }

    #[test]
    fn capped_at_max() {
        let backoff = Backoff {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            ..no_jitter()
        };
        assert_eq!(backoff.delay(10).as_millis(), 5000);
        assert_eq!(backoff.delay(u32::MAX).as_millis(), 5000);
    }

    #[test]
    fn jitter_stays_in_range() {
        let backoff = Backoff {
            base_delay: Duration::from_secs(1),
            jitter_factor: 0.2,
            ..no_jitter()
        };
        for _ in 0..100 {
            let ms = backoff.delay(0).as_millis();
            assert!((800..=1200).contains(&ms), "got {ms}");
        }
    }

    #[test]
    fn attempt_budget() {
        let backoff = no_jitter();
        assert!(backoff.allows(0));
        assert!(backoff.allows(4));
        assert!(!backoff.allows(5));
    }

    #[test]
    fn defaults() {
        let backoff = Backoff::default();
        assert_eq!(backoff.max_attempts, 5);
        assert_eq!(backoff.base_delay, Duration::from_secs(2));
        assert_eq!(backoff.max_delay, Duration::from_secs(60));
        assert!((backoff.jitter_factor - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn serde_uses_millis() {
        let json = serde_json::to_value(no_jitter()).unwrap();
        assert_eq!(json["baseDelay"], 100);
        let parsed: Backoff = serde_json::from_value(serde_json::json!({"maxAttempts": 2})).unwrap();
        assert_eq!(parsed.max_attempts, 2);
        assert_eq!(parsed.base_delay, Duration::from_secs(2));
    }
}
