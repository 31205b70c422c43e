use rand::Rng;
use std::time::Duration;

/// Base delay before the first redial.
pub const BASE_DELAY: Duration = Duration::from_secs(1);
/// Additive jitter ceiling per attempt.
pub const JITTER_MS: u64 = 500;

/// Per-connection exponential backoff: base 1 s, doubling, additive jitter,
/// capped. State lives and dies with one `Connection`; a fresh connection
/// always starts at the base delay.
#[derive(Debug)]
pub struct Backoff {
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(max: Duration) -> Self {
        Self { max, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for the next redial: `base * 2^(n-1)` capped at `max`, plus
    /// jitter in `[0, JITTER_MS]`.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let exp = BASE_DELAY
            .checked_mul(1u32 << (self.attempt - 1).min(20))
            .unwrap_or(self.max)
            .min(self.max);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=JITTER_MS));
        exp + jitter
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
