//! Exponential backoff with a cap. The base sequence is deterministic
//! and non-decreasing; jitter is applied only to the actual sleep so
//! callers can still reason about (and test) the schedule.

use std::time::Duration;

use rand::Rng as _;

#[derive(Debug, Clone)]
pub struct ExpBackoff {
    init: Duration,
    max: Duration,
    current: Duration,
}

impl ExpBackoff {
    pub fn new(init: Duration, max: Duration) -> Self {
        let init = init.max(Duration::from_millis(1));
        Self {
            init,
            max: max.max(init),
            current: Duration::ZERO,
        }
    }

    /// Next base delay: init, 2*init, 4*init, ... capped at max.
    pub fn next_delay(&mut self) -> Duration {
        self.current = if self.current.is_zero() {
            self.init
        } else {
            (self.current * 2).min(self.max)
        };
        self.current
    }

    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }

    /// The sleep actually taken: base delay plus up to 10% jitter.
    pub fn jittered(delay: Duration) -> Duration {
        let extra_ms = delay.as_millis() as u64 / 10;
        if extra_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=extra_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_monotonic_and_capped() {
        let mut b = ExpBackoff::new(Duration::from_secs(1), Duration::from_secs(8));
        let delays: Vec<u64> = (0..6).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_is_bounded() {
        let base = Duration::from_secs(10);
        for _ in 0..32 {
            let j = ExpBackoff::jittered(base);
            assert!(j >= base);
            assert!(j <= base + Duration::from_secs(1));
        }
    }
}
