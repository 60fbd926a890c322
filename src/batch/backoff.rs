use rand::Rng;
use std::time::Duration;

/// Cooperative delay applied before a sub-batch when the target table is
/// contended.
///
/// The n-th consecutive contended check waits
/// `min(max_delay, base_delay * 2^(n-1))`, spread by `±jitter` of itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction in `[0, 1]`.
    pub jitter: f64,
    /// Lock count above which the target counts as contended.
    pub lock_threshold: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            jitter: 0.2,
            lock_threshold: 50,
        }
    }
}

impl BackoffPolicy {
    pub fn is_contended(&self, lock_count: u64) -> bool {
        lock_count > self.lock_threshold
    }

    /// Delay for the `consecutive`-th contended check, before jitter.
    pub fn delay_for(&self, consecutive: u32) -> Duration {
        if consecutive == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(consecutive - 1).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn with_jitter<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rng.gen_range(-self.jitter..=self.jitter);
        delay.mul_f64((1.0 + spread).max(0.0))
    }
}

/// Tracks consecutive contended checks for one coordinator.
#[derive(Debug, Clone)]
pub struct Throttle {
    policy: BackoffPolicy,
    consecutive: u32,
}

impl Throttle {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, consecutive: 0 }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Returns how long to wait given the current lock count, or `None`
    /// when the target is not contended.
    pub fn assess(&mut self, lock_count: u64) -> Option<Duration> {
        if !self.policy.is_contended(lock_count) {
            self.consecutive = 0;
            return None;
        }
        self.consecutive = self.consecutive.saturating_add(1);
        let delay = self.policy.delay_for(self.consecutive);
        Some(self.policy.with_jitter(delay, &mut rand::thread_rng()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter: 0.0,
            lock_threshold: 10,
        }
    }

    #[test]
    fn delay_doubles_up_to_cap() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::ZERO);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(4), Duration::from_millis(800));
        assert_eq!(p.delay_for(5), Duration::from_millis(1000));
        assert_eq!(p.delay_for(64), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let p = BackoffPolicy { jitter: 0.2, ..policy() };
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let d = p.with_jitter(Duration::from_millis(1000), &mut rng);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200), "{:?}", d);
        }
    }

    #[test]
    fn uncontended_check_resets_streak() {
        let mut throttle = Throttle::new(policy());
        assert_eq!(throttle.assess(10), None);
        assert_eq!(throttle.assess(11), Some(Duration::from_millis(100)));
        assert_eq!(throttle.assess(50), Some(Duration::from_millis(200)));
        assert_eq!(throttle.consecutive(), 2);
        assert_eq!(throttle.assess(0), None);
        assert_eq!(throttle.assess(11), Some(Duration::from_millis(100)));
    }
}
