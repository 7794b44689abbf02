//! Reconnect backoff: 1 s doubling to a 60 s cap, with ±20 % jitter so a
//! fleet of shards does not stampede the gateway after an outage.

use rand::Rng;
use std::time::Duration;

const BASE_MS: u64 = 1_000;
const CAP_MS: u64 = 60_000;
const JITTER: f64 = 0.2;

#[derive(Debug, Default)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before the next reconnect attempt.
    pub fn next_delay(&mut self) -> Duration {
        let exp = BASE_MS.saturating_mul(1u64 << self.attempt.min(6));
        let capped = exp.min(CAP_MS);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = rand::thread_rng().gen_range(-JITTER..=JITTER);
        let with_jitter = (capped as f64 * (1.0 + jitter)).max(0.0);
        Duration::from_millis(with_jitter as u64)
    }

    /// Call once a connection reaches the running state.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Uniform random delay in `[low, high]` seconds, used for the
/// invalid-session wait.
pub fn jittered_delay_secs(low: u64, high: u64) -> Duration {
    let ms = rand::thread_rng().gen_range(low * 1_000..=high * 1_000);
    Duration::from_millis(ms)
}

/// Uniform random fraction of the heartbeat interval, applied to the
/// first beat of each connection.
pub fn heartbeat_jitter() -> f64 {
    rand::thread_rng().gen_range(0.0..1.0)
}
