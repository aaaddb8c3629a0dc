//! Consecutive-failure circuit breaker shared across worker tasks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Trips once `limit` failures arrive in a row. A success resets the streak
/// but never un-trips the breaker. A limit of 0 disables it.
#[derive(Debug)]
pub struct CircuitBreaker {
    limit: usize,
    streak: AtomicUsize,
    tripped: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            streak: AtomicUsize::new(0),
            tripped: AtomicBool::new(false),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn record_success(&self) {
        self.streak.store(0, Ordering::SeqCst);
    }

    /// Returns true if this failure tripped the breaker.
    pub fn record_failure(&self) -> bool {
        let streak = self.streak.fetch_add(1, Ordering::SeqCst) + 1;
        if self.limit > 0 && streak >= self.limit {
            return !self.tripped.swap(true, Ordering::SeqCst);
        }
        false
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    pub fn streak(&self) -> usize {
        self.streak.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trips_at_limit() {
        let breaker = CircuitBreaker::new(3);
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(breaker.record_failure());
        assert!(breaker.is_tripped());
        // Only the first crossing reports the trip.
        assert!(!breaker.record_failure());
    }

    #[test]
    fn test_success_resets_streak() {
        let breaker = CircuitBreaker::new(2);
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(!breaker.is_tripped());
        assert_eq!(breaker.streak(), 1);
    }

    #[test]
    fn test_zero_limit_never_trips() {
        let breaker = CircuitBreaker::new(0);
        for _ in 0..100 {
            breaker.record_failure();
        }
        assert!(!breaker.is_tripped());
    }
}
