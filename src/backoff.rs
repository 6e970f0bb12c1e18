// ===============================
// src/backoff.rs
// ===============================
//
// Exponential backoff + jitter for loop-level store failures:
// 0.5s, 1s, 2s ... capped at 32s, plus up to 250ms of jitter.
// `reset()` after the first successful iteration.
//
use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::warn;

use crate::metrics::STORE_RETRIES;

#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    base_ms: u64,
    max_shift: u32,
    jitter_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { attempt: 0, base_ms: 500, max_shift: 6, jitter_ms: 250 }
    }
}

impl Backoff {
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for the current attempt (without jitter).
    pub fn current_delay(&self) -> Duration {
        let shift = self.attempt.min(self.max_shift);
        Duration::from_millis(self.base_ms.saturating_mul(1u64 << shift))
    }

    /// Sleeps for the current delay and advances to the next attempt.
    pub async fn wait(&mut self, component: &str) {
        let base = self.current_delay();
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        let delay = base + Duration::from_millis(jitter);
        warn!(component, attempt = self.attempt, delay_ms = delay.as_millis() as u64, "store error, backing off");
        STORE_RETRIES.with_label_values(&[component]).inc();
        self.attempt = self.attempt.saturating_add(1);
        sleep(delay).await;
    }
}
