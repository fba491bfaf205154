use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::Error;
use crate::poller::deadline_after;

/// A failure attributed to one worker.
#[derive(Debug)]
pub struct WorkerFailure {
    pub device_id: String,
    pub error: Error,
}

/// Run-scoped pass/fail flag shared by every worker of one coordinator run.
/// Starts passing; the first `mark_failed` flips it for good.
#[derive(Debug, Default)]
pub struct AggregateOutcome {
    failed: AtomicBool,
    failures: Mutex<Vec<WorkerFailure>>,
}

impl AggregateOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `error` against `device_id`. Returns `true` for the failure
    /// that flipped the outcome.
    pub fn mark_failed(&self, device_id: &str, error: Error) -> bool {
        let first = !self.failed.swap(true, Ordering::AcqRel);
        log::error!("Worker for {} failed: {}", device_id, error);
        match self.failures.lock() {
            Ok(mut failures) => failures.push(WorkerFailure {
                device_id: device_id.to_string(),
                error,
            }),
            Err(e) => log::error!("Failure list lock poisoned, dropping failure for {}: {}", device_id, e),
        }
        first
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn take_failures(&self) -> Vec<WorkerFailure> {
        match self.failures.lock() {
            Ok(mut failures) => std::mem::take(&mut *failures),
            Err(e) => {
                log::error!("Failure list lock poisoned: {}", e);
                Vec::new()
            }
        }
    }
}

/// Countdown gate that opens when every worker has reported, or as soon as
/// anyone calls [`CompletionGate::release_all`].
#[derive(Debug)]
pub struct CompletionGate {
    remaining: AtomicUsize,
    notify: Notify,
}

impl CompletionGate {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            notify: Notify::new(),
        }
    }

    pub fn count_down(&self) {
        let _ = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if self.remaining() == 0 {
            self.notify.notify_waiters();
        }
    }

    /// Opens the gate regardless of how many workers are still running.
    pub fn release_all(&self) {
        self.remaining.store(0, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// `true` if the gate opened before `timeout`.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.remaining() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.remaining() == 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn first_failure_flips_outcome_once() {
        let outcome = AggregateOutcome::new();
        assert!(!outcome.is_failed());
        assert!(outcome.mark_failed("a", Error::NotConnected));
        assert!(!outcome.mark_failed("b", Error::NotConnected));
        assert!(outcome.is_failed());
        let failures = outcome.take_failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].device_id, "a");
    }

    #[test]
    fn count_down_saturates_at_zero() {
        let gate = CompletionGate::new(1);
        gate.count_down();
        gate.count_down();
        assert_eq!(gate.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_opens_when_all_count_down() {
        let gate = Arc::new(CompletionGate::new(3));
        for _ in 0..3 {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.count_down() });
        }
        assert!(gate.wait(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn release_all_opens_early() {
        let gate = Arc::new(CompletionGate::new(3));
        gate.count_down();
        {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                gate.release_all();
            });
        }
        let start = Instant::now();
        assert!(gate.wait(Duration::from_secs(300)).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out() {
        let gate = CompletionGate::new(2);
        gate.count_down();
        assert!(!gate.wait(Duration::from_secs(2)).await);
        assert_eq!(gate.remaining(), 1);
    }
}
