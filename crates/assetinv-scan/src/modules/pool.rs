//! Bounded worker pool for per-host module probes.
//!
//! At most `workers` probes run at once. Submissions are staggered by a
//! fixed delay, and the shared breaker is checked before each one; once it
//! trips, nothing new is submitted and in-flight probes are drained.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::breaker::CircuitBreaker;

/// Result of one per-host probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    /// Local failure (timeout, unparsable output). Does not feed the breaker.
    Failure,
    /// Rejected credentials. Counts toward the breaker.
    AuthFailure,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolSummary {
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub auth_failures: usize,
    /// Items never submitted because the breaker tripped.
    pub skipped: usize,
    pub halted: bool,
}

pub struct WorkerPool {
    workers: usize,
    submit_delay: Duration,
    breaker: Arc<CircuitBreaker>,
}

impl WorkerPool {
    pub fn new(workers: usize, submit_delay: Duration, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            workers: workers.max(1),
            submit_delay,
            breaker,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn run<T, F, Fut>(&self, items: Vec<T>, probe: F) -> PoolSummary
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        let probe = Arc::new(probe);
        let slots = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut summary = PoolSummary::default();
        let total = items.len();

        for (i, item) in items.into_iter().enumerate() {
            if self.breaker.is_tripped() {
                summary.halted = true;
                summary.skipped = total - i;
                break;
            }
            if i > 0 && !self.submit_delay.is_zero() {
                tokio::time::sleep(self.submit_delay).await;
            }
            let Ok(permit) = slots.clone().acquire_owned().await else {
                break;
            };
            // The breaker may have tripped while waiting for a slot.
            if self.breaker.is_tripped() {
                summary.halted = true;
                summary.skipped = total - i;
                break;
            }

            let probe = probe.clone();
            let breaker = self.breaker.clone();
            tasks.spawn(async move {
                let outcome = (*probe)(item).await;
                match outcome {
                    TaskOutcome::Success => breaker.record_success(),
                    TaskOutcome::AuthFailure => {
                        if breaker.record_failure() {
                            tracing::warn!(
                                limit = breaker.limit(),
                                "Consecutive logon failure limit reached, halting submissions"
                            );
                        }
                    }
                    TaskOutcome::Failure => {}
                }
                drop(permit);
                outcome
            });
            summary.submitted += 1;
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(TaskOutcome::Success) => summary.succeeded += 1,
                Ok(TaskOutcome::Failure) => summary.failed += 1,
                Ok(TaskOutcome::AuthFailure) => summary.auth_failures += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "Worker task panicked");
                    summary.failed += 1;
                }
            }
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_all_items_processed() {
        let pool = WorkerPool::new(3, Duration::ZERO, Arc::new(CircuitBreaker::new(3)));
        let summary = pool
            .run((0..10).collect(), |n: u32| async move {
                if n % 2 == 0 {
                    TaskOutcome::Success
                } else {
                    TaskOutcome::Failure
                }
            })
            .await;
        assert_eq!(summary.submitted, 10);
        assert_eq!(summary.succeeded, 5);
        assert_eq!(summary.failed, 5);
        assert!(!summary.halted);
    }

    #[tokio::test]
    async fn test_breaker_halts_submission() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        // One worker, so each probe finishes before the next is submitted.
        let pool = WorkerPool::new(1, Duration::from_millis(5), Arc::new(CircuitBreaker::new(2)));
        let summary = pool
            .run((0..10).collect::<Vec<u32>>(), move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    TaskOutcome::AuthFailure
                }
            })
            .await;

        assert!(summary.halted);
        assert!(pool.breaker().is_tripped());
        assert!(summary.submitted < 10);
        assert_eq!(summary.submitted + summary.skipped, 10);
        assert_eq!(calls.load(Ordering::SeqCst), summary.submitted);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let pool = WorkerPool::new(2, Duration::ZERO, Arc::new(CircuitBreaker::new(0)));
        let summary = pool.run(Vec::<u8>::new(), |_| async { TaskOutcome::Success }).await;
        assert_eq!(summary, PoolSummary::default());
    }
}
