use std::{
    cmp,
    time::Duration,
};

use rand::Rng;

/// Capped exponential backoff with jitter.
///
/// Delays double per recorded failure up to `cap`, then each delay is scaled
/// into `[0.5, 1.0)` of its nominal value so simultaneous retries spread out
/// while staying strictly positive.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            failures: 0,
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn next_delay(&mut self, rng: &mut impl Rng) -> Duration {
        let exponent = 2u32.checked_pow(self.failures).unwrap_or(u32::MAX);
        self.failures += 1;
        let nominal = cmp::min(self.base.checked_mul(exponent).unwrap_or(self.cap), self.cap);
        nominal.mul_f32(0.5 + rng.random::<f32>() / 2.0)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
