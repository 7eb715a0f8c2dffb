//! Reconnect delays: capped exponential backoff with optional jitter.

use crate::config::RelayConfig;
use rand::Rng;
use std::time::Duration;

/// How much randomness to add to each delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Jitter {
    /// Always the capped exponential delay.
    None,
    /// Uniform in `[0, capped_delay]`.
    Full,
}

/// Delay sequence for reconnect attempts against one relay.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    /// `None` = unlimited
    max_attempts: Option<u32>,
    jitter: Jitter,
    attempt: u32,
}

impl ExponentialBackoff {
    /// `max_attempts` of 0 means unlimited attempts.
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts: (max_attempts > 0).then_some(max_attempts),
            jitter: Jitter::Full,
            attempt: 0,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            config.reconnect_delay,
            config.max_reconnect_delay,
            config.max_reconnect_attempts,
        )
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Next delay, or `None` once the attempts are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let capped = self.base_delay.saturating_mul(factor).min(self.max_delay);
        self.attempt = self.attempt.saturating_add(1);

        Some(match self.jitter {
            Jitter::None => capped,
            Jitter::Full => {
                let millis = u64::try_from(capped.as_millis()).unwrap_or(u64::MAX);
                Duration::from_millis(rand::rng().random_range(0..=millis))
            }
        })
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempt >= max)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}
