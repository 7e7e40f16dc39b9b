//! Reconnect policy for remote members.
//!
//! A [`ReconnectTracker`] counts consecutive failed connection attempts to one
//! node and spaces out further attempts. After too many failures while the
//! local node believes it is connected to the network, the node is flagged as
//! unreachable from the network rather than just unreachable from us.

use std::time::{Duration, Instant};

/// Default consecutive failures before a node is flagged unreachable.
pub const DEFAULT_MAX_FAILURES: u32 = 15;

/// Wait after the first failure.
pub const BASE_RETRY_DELAY: Duration = Duration::from_secs(15);

/// Longest wait between two attempts, before spread.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(600);

/// Wait before the next attempt after `failures` consecutive failures.
///
/// The wait doubles per failure from [`BASE_RETRY_DELAY`] up to
/// [`MAX_RETRY_DELAY`]. `spread` in `0.0..=1.0` stretches it by up to a
/// fifth, so nodes that lost the same peer do not retry together.
pub fn retry_delay(failures: u32, spread: f64) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let doublings = (failures - 1).min(16);
    let delay = BASE_RETRY_DELAY
        .saturating_mul(1u32 << doublings)
        .min(MAX_RETRY_DELAY);
    delay + delay.mul_f64(spread.clamp(0.0, 1.0) / 5.0)
}

/// Uniform value in `0.0..=1.0`; zero when the OS random source fails.
fn random_spread() -> f64 {
    let mut bytes = [0u8; 2];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => f64::from(u16::from_le_bytes(bytes)) / f64::from(u16::MAX),
        Err(_) => 0.0,
    }
}

/// Consecutive-failure bookkeeping for one remote node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectTracker {
    max_failures: u32,
    failures: u32,
    unreachable_from_network: bool,
    last_failure: Option<Instant>,
    delay: Duration,
}

impl ReconnectTracker {
    /// Create a tracker that flags after `max_failures` consecutive failures.
    pub fn new(max_failures: u32) -> Self {
        Self {
            max_failures,
            failures: 0,
            unreachable_from_network: false,
            last_failure: None,
            delay: Duration::ZERO,
        }
    }

    /// Record a failed attempt.
    ///
    /// `connected_to_network` is whether the local node currently believes it
    /// has network connectivity. Returns `true` exactly when this failure
    /// flips the node to unreachable-from-network.
    pub fn record_failure(&mut self, connected_to_network: bool) -> bool {
        self.record_failure_at(connected_to_network, Instant::now())
    }

    fn record_failure_at(&mut self, connected_to_network: bool, at: Instant) -> bool {
        self.failures = self.failures.saturating_add(1);
        self.last_failure = Some(at);
        self.delay = retry_delay(self.failures, random_spread());
        if connected_to_network
            && !self.unreachable_from_network
            && self.failures >= self.max_failures
        {
            self.unreachable_from_network = true;
            return true;
        }
        false
    }

    /// Record a successful connection; clears all failure state.
    pub fn record_success(&mut self) {
        self.failures = 0;
        self.unreachable_from_network = false;
        self.last_failure = None;
        self.delay = Duration::ZERO;
    }

    /// Number of consecutive failures so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether the node was flagged unreachable from the network.
    pub fn is_unreachable_from_network(&self) -> bool {
        self.unreachable_from_network
    }

    /// Wait chosen at the last failure.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Whether the wait after the last failure has passed by `now`.
    pub fn is_retry_due(&self, now: Instant) -> bool {
        match self.last_failure {
            Some(failed) => now.saturating_duration_since(failed) >= self.delay,
            None => true,
        }
    }
}

impl Default for ReconnectTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FAILURES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_capped() {
        assert_eq!(retry_delay(0, 0.0), Duration::ZERO);
        assert_eq!(retry_delay(1, 0.0), Duration::from_secs(15));
        assert_eq!(retry_delay(2, 0.0), Duration::from_secs(30));
        assert_eq!(retry_delay(4, 0.0), Duration::from_secs(120));
        assert_eq!(retry_delay(7, 0.0), MAX_RETRY_DELAY);
        assert_eq!(retry_delay(u32::MAX, 0.0), MAX_RETRY_DELAY);
    }

    #[test]
    fn spread_stretches_by_a_fifth_at_most() {
        assert_eq!(retry_delay(1, 1.0), Duration::from_secs(18));
        assert_eq!(retry_delay(1, 7.0), Duration::from_secs(18));
        assert_eq!(retry_delay(7, 0.5), Duration::from_secs(660));
    }

    #[test]
    fn retry_waits_for_the_delay() {
        let mut tracker = ReconnectTracker::new(5);
        let start = Instant::now();
        assert!(tracker.is_retry_due(start));

        tracker.record_failure_at(true, start);
        let delay = tracker.delay();
        assert!(delay >= BASE_RETRY_DELAY);
        assert!(!tracker.is_retry_due(start));
        assert!(!tracker.is_retry_due(start + delay - Duration::from_millis(1)));
        assert!(tracker.is_retry_due(start + delay));

        tracker.record_failure_at(true, start + delay);
        assert!(tracker.delay() >= Duration::from_secs(30));
        assert!(!tracker.is_retry_due(start + delay + Duration::from_secs(20)));
    }

    #[test]
    fn flags_after_max_failures_when_online() {
        let mut tracker = ReconnectTracker::new(3);
        assert!(!tracker.record_failure(true));
        assert!(!tracker.record_failure(true));
        assert!(tracker.record_failure(true));
        assert!(tracker.is_unreachable_from_network());

        // Only flips once
        assert!(!tracker.record_failure(true));
        assert_eq!(tracker.failures(), 4);
    }

    #[test]
    fn offline_failures_never_flag() {
        let mut tracker = ReconnectTracker::new(2);
        for _ in 0..10 {
            assert!(!tracker.record_failure(false));
        }
        assert!(!tracker.is_unreachable_from_network());
    }

    #[test]
    fn success_resets() {
        let mut tracker = ReconnectTracker::new(1);
        tracker.record_failure(true);
        assert!(tracker.is_unreachable_from_network());
        assert!(!tracker.is_retry_due(Instant::now()));

        tracker.record_success();
        assert_eq!(tracker.failures(), 0);
        assert!(!tracker.is_unreachable_from_network());
        assert!(tracker.is_retry_due(Instant::now()));
    }

    #[test]
    fn default_uses_fifteen() {
        let mut tracker = ReconnectTracker::default();
        for _ in 0..14 {
            assert!(!tracker.record_failure(true));
        }
        assert!(tracker.record_failure(true));
    }
}
