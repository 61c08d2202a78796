// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Capped exponential backoff with jitter.
//!
//! Delay for attempt `n` is `min(cap, 2^n)` seconds, jittered down by up to
//! 20%. Once `n` exceeds `2·log2(cap)` the exponential would overflow long
//! before mattering, so the delay is drawn directly from `[0.8·cap, cap]`.
//! A service-supplied `retry-after` hint acts as a lower bound, itself
//! jittered upward by up to 20% so that a fleet of workers does not retry in
//! lock-step.

use std::time::Duration;

use rand::Rng;

const JITTER_FRACTION: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct Backoff {
    cap: Duration,
}

impl Backoff {
    pub fn new(cap: Duration) -> Self {
        Self { cap }
    }

    /// Delay for the given zero-based attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let cap = self.cap.as_secs_f64().max(1.0);
        let base = if f64::from(attempt) > 2.0 * cap.log2() {
            cap
        } else {
            2f64.powi(attempt as i32).min(cap)
        };
        let jittered = rand::rng().random_range((1.0 - JITTER_FRACTION) * base..=base);
        Duration::from_secs_f64(jittered)
    }

    /// Delay for the given attempt, raised to at least `floor` when the
    /// service supplied a retry-after hint.
    pub fn delay_with_floor(&self, attempt: u32, floor: Option<Duration>) -> Duration {
        let delay = self.delay(attempt);
        match floor {
            Some(floor) if delay < floor => {
                let bump = rand::rng().random_range(0.0..=JITTER_FRACTION * floor.as_secs_f64());
                floor + Duration::from_secs_f64(bump)
            }
            _ => delay,
        }
    }
}

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;
