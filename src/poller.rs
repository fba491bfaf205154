//! Bounded waits.
//!
//! Every wait in the harness goes through [`BoundedPoller`]: a fixed check
//! interval, a hard deadline, and a shared [`CancelFlag`] that ends the wait
//! early when the enclosing run has already failed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::Error;
use crate::signal::{Completion, CompletionSignal};

/// Run-scoped cancellation flag. Cloning shares the flag.
#[derive(Debug, Clone)]
pub struct CancelFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called, immediately if it already was.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `wait_for` cannot observe a closed channel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// `now + after`, clamped to a distant instant for durations that would
/// overflow the clock.
pub fn deadline_after(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after).unwrap_or_else(|| now + FAR_FUTURE)
}

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    Fired(Completion),
    TimedOut,
    Cancelled,
}

/// Result of polling an arbitrary check. `TimedOut` keeps the last
/// observation so callers can report how close they got.
#[derive(Debug, Clone, PartialEq)]
pub enum Polled<T> {
    Satisfied(T),
    TimedOut(T),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedPoller {
    pub interval: Duration,
    pub timeout: Duration,
}

impl BoundedPoller {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Waits for `signal` to fire. A latched signal is always reported as
    /// `Fired`, even if the deadline or cancellation raced with it.
    pub async fn wait_for(&self, signal: &CompletionSignal, cancel: &CancelFlag) -> PollResult {
        let deadline = deadline_after(self.timeout);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if let Some(completion) = signal.completion() {
                return PollResult::Fired(completion);
            }
            if cancel.is_cancelled() {
                return PollResult::Cancelled;
            }
            if Instant::now() >= deadline {
                return PollResult::TimedOut;
            }
            tokio::select! {
                _ = signal.fired() => {}
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Calls `check` once per interval until it reports `(true, value)`, the
    /// deadline passes, or the run is cancelled. Errors from `check` abort
    /// the poll.
    pub async fn poll_until<T, F, Fut>(&self, cancel: &CancelFlag, mut check: F) -> Result<Polled<T>, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(bool, T), Error>>,
    {
        let deadline = deadline_after(self.timeout);

        loop {
            if cancel.is_cancelled() {
                return Ok(Polled::Cancelled);
            }
            let (done, value) = check().await?;
            if done {
                return Ok(Polled::Satisfied(value));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Polled::TimedOut(value));
            }
            let next = (now + self.interval).min(deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(next) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Outcome;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn poller() -> BoundedPoller {
        BoundedPoller::new(Duration::from_millis(100), Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_no_earlier_than_timeout() {
        let signal = CompletionSignal::new();
        let cancel = CancelFlag::new();
        let start = Instant::now();
        let result = poller().wait_for(&signal, &cancel).await;
        assert_eq!(result, PollResult::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(5) + Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn fires_within_one_interval() {
        let signal = Arc::new(CompletionSignal::new());
        let cancel = CancelFlag::new();
        {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(750)).await;
                signal.signal(Completion::success());
            });
        }
        let start = Instant::now();
        let result = poller().wait_for(&signal, &cancel).await;
        assert_eq!(result, PollResult::Fired(Completion::success()));
        assert!(start.elapsed() <= Duration::from_millis(750) + Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn fired_failure_is_distinct_from_timeout() {
        let signal = CompletionSignal::new();
        signal.signal(Completion::failure());
        let result = poller().wait_for(&signal, &CancelFlag::new()).await;
        match result {
            PollResult::Fired(c) => assert_eq!(c.outcome, Outcome::Failure),
            other => panic!("expected Fired, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_returns_promptly() {
        let signal = CompletionSignal::new();
        let cancel = CancelFlag::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                cancel.cancel();
            });
        }
        let start = Instant::now();
        let long = BoundedPoller::new(Duration::from_millis(100), Duration::from_secs(300));
        assert_eq!(long.wait_for(&signal, &cancel).await, PollResult::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_reports_last_observation() {
        let calls = AtomicUsize::new(0);
        let result = BoundedPoller::new(Duration::from_millis(500), Duration::from_secs(2))
            .poll_until(&CancelFlag::new(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok((false, n)) }
            })
            .await
            .unwrap();
        match result {
            Polled::TimedOut(n) => assert!(n >= 3),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_stops_when_satisfied() {
        let calls = AtomicUsize::new(0);
        let result = poller()
            .poll_until(&CancelFlag::new(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok((n == 3, n)) }
            })
            .await
            .unwrap();
        assert_eq!(result, Polled::Satisfied(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
