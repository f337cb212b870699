use rand::Rng;
use std::time::Duration;

/// Exponential backoff used for transport-level retries of idempotent reads.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    jitter: bool,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64, jitter: bool) -> Self {
        Self {
            base_ms,
            max_ms,
            jitter,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let shift = attempt.min(16);
        let exp = self.base_ms.saturating_mul(1u64 << shift).min(self.max_ms);
        let delay_ms = if self.jitter { rng.gen_range(0..=exp) } else { exp };
        Duration::from_millis(delay_ms)
    }
}
