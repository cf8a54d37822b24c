use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Selects which credits are cancelled after a delay.
///
/// Selection draws from its own seeded generator in issue order, so a seeded run cancels the
/// same credits every time.
#[derive(Debug, Clone)]
pub struct CancellationStrategy {
    /// Percentage of credits to cancel, 0 to 100
    rate: f64,
    delay: Duration,
    rng: StdRng,
}

impl CancellationStrategy {
    pub fn new(rate: f64, delay: Duration, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rate, delay, rng }
    }

    pub fn disabled() -> Self {
        Self::new(0.0, Duration::ZERO, Some(0))
    }

    pub fn is_enabled(&self) -> bool {
        self.rate > 0.0
    }

    /// Whether the next issued credit should be cancelled.
    pub fn should_cancel(&mut self) -> bool {
        if self.rate <= 0.0 {
            false
        } else if self.rate >= 100.0 {
            true
        } else {
            self.rng.r#gen::<f64>() * 100.0 < self.rate
        }
    }

    /// Time after the request is sent at which it is cancelled.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// The `cancel_after` value for the next credit.
    pub fn next_cancel_after(&mut self) -> Option<Duration> {
        self.should_cancel().then_some(self.delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_never_cancels() {
        let mut strategy = CancellationStrategy::disabled();
        assert!(!strategy.is_enabled());
        assert!((0..1000).all(|_| !strategy.should_cancel()));
    }

    #[test]
    fn test_full_rate_always_cancels() {
        let mut strategy = CancellationStrategy::new(100.0, Duration::ZERO, None);
        assert!((0..1000).all(|_| strategy.should_cancel()));
        assert_eq!(strategy.next_cancel_after(), Some(Duration::ZERO));
    }

    #[test]
    fn test_seeded_selection_is_deterministic() {
        let draw = || {
            let mut s = CancellationStrategy::new(25.0, Duration::from_millis(50), Some(7));
            (0..500).map(|_| s.should_cancel()).collect::<Vec<_>>()
        };
        let first = draw();
        assert_eq!(first, draw());

        let cancelled = first.iter().filter(|c| **c).count();
        assert!((75..=175).contains(&cancelled), "cancelled {cancelled} of 500");
    }
}
