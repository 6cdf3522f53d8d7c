use std::time::Duration;

use rand::Rng;
use tempo_core::SyncConfig;

/// Reconnect schedule: `min(base * 2^attempts, max) + jitter`.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Upper bound of the uniformly random extra delay.
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            max_attempts: config.max_attempts,
            jitter: config.jitter(),
        }
    }

    /// Deterministic part of the delay before retry number `attempts`.
    pub fn base_for(&self, attempts: u32) -> Duration {
        let factor = 2u64.checked_pow(attempts).unwrap_or(u64::MAX);
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor)).min(self.max_delay)
    }

    /// Full delay including jitter.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        self.base_for(attempts) + self.random_jitter()
    }

    /// True once `failures` consecutive connect failures have used up the
    /// `max_attempts` budget.
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }

    fn random_jitter(&self) -> Duration {
        let max_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}
