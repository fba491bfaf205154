//! Latched completion of asynchronous callbacks.
//!
//! A [`CompletionSignal`] is written once by whichever thread delivers a
//! callback and read by a waiting poller. The first `signal` wins; later calls
//! are rejected, so a duplicated callback can never turn a latched failure
//! into a success. Status is latched, not edge-triggered: a waiter that
//! arrives after the signal still observes it.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio::sync::Notify;

use crate::message::IotHubStatusCode;
use crate::transport::StatusCallback;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// The terminal state of one callback: verdict plus the status code that was
/// delivered, when there was one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub outcome: Outcome,
    pub status: Option<IotHubStatusCode>,
}

impl Completion {
    pub fn success() -> Self {
        Self { outcome: Outcome::Success, status: None }
    }

    pub fn failure() -> Self {
        Self { outcome: Outcome::Failure, status: None }
    }

    pub fn with_status(outcome: Outcome, status: IotHubStatusCode) -> Self {
        Self { outcome, status: Some(status) }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

#[derive(Default)]
pub struct CompletionSignal {
    slot: OnceLock<Completion>,
    notify: Notify,
}

impl fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("completion", &self.slot.get())
            .finish()
    }
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latches `completion`. Returns `false` if the signal had already fired,
    /// in which case the stored completion is left untouched.
    pub fn signal(&self, completion: Completion) -> bool {
        let latched = self.slot.set(completion).is_ok();
        if latched {
            self.notify.notify_waiters();
        } else {
            log::debug!(
                "Duplicate completion {:?} ignored; already latched {:?}",
                completion,
                self.slot.get()
            );
        }
        latched
    }

    pub fn was_fired(&self) -> bool {
        self.slot.get().is_some()
    }

    pub fn completion(&self) -> Option<Completion> {
        self.slot.get().copied()
    }

    /// Resolves once the signal has fired, including when it fired before
    /// this call.
    pub async fn fired(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.was_fired() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Send,
    MethodInvoke,
    TwinPatch,
    FileUpload,
}

/// One outstanding asynchronous call: what was submitted, which status it
/// must be acknowledged with, and the signal its callback latches.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub kind: OperationKind,
    pub sequence: u64,
    pub expected: IotHubStatusCode,
    signal: Arc<CompletionSignal>,
}

impl PendingOperation {
    pub fn new(kind: OperationKind, sequence: u64, expected: IotHubStatusCode) -> Self {
        Self {
            kind,
            sequence,
            expected,
            signal: Arc::new(CompletionSignal::new()),
        }
    }

    pub fn signal(&self) -> &CompletionSignal {
        &self.signal
    }

    /// Callback that succeeds only on exactly `expected`.
    pub fn callback(&self) -> StatusCallback {
        let signal = Arc::clone(&self.signal);
        let expected = self.expected;
        Box::new(move |status: IotHubStatusCode| {
            let outcome = if status == expected { Outcome::Success } else { Outcome::Failure };
            signal.signal(Completion::with_status(outcome, status));
        })
    }

    /// Callback that accepts either `OK` or `OK_EMPTY`.
    pub fn lenient_callback(&self) -> StatusCallback {
        let signal = Arc::clone(&self.signal);
        Box::new(move |status: IotHubStatusCode| {
            let outcome = if status.is_success() { Outcome::Success } else { Outcome::Failure };
            signal.signal(Completion::with_status(outcome, status));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn failure_is_never_overwritten() {
        let signal = CompletionSignal::new();
        assert!(!signal.was_fired());
        assert!(signal.signal(Completion::failure()));
        assert!(!signal.signal(Completion::success()));
        assert_eq!(signal.completion(), Some(Completion::failure()));
    }

    #[test]
    fn exactly_one_signaler_wins() {
        let signal = Arc::new(CompletionSignal::new());
        let wins: usize = (0..8)
            .map(|_| {
                let signal = Arc::clone(&signal);
                std::thread::spawn(move || signal.signal(Completion::success()))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn waiter_after_signal_is_not_missed() {
        let signal = CompletionSignal::new();
        signal.signal(Completion::success());
        tokio::time::timeout(Duration::from_secs(1), signal.fired())
            .await
            .expect("latched signal should resolve immediately");
    }

    #[tokio::test]
    async fn waiter_before_signal_is_woken() {
        let signal = Arc::new(CompletionSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.fired().await })
        };
        tokio::task::yield_now().await;
        signal.signal(Completion::failure());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[test]
    fn pending_operation_callback_checks_status() {
        let op = PendingOperation::new(OperationKind::Send, 0, IotHubStatusCode::OkEmpty);
        (op.callback())(IotHubStatusCode::Ok);
        let completion = op.signal().completion().unwrap();
        assert_eq!(completion.outcome, Outcome::Failure);
        assert_eq!(completion.status, Some(IotHubStatusCode::Ok));

        let op = PendingOperation::new(OperationKind::TwinPatch, 1, IotHubStatusCode::OkEmpty);
        (op.lenient_callback())(IotHubStatusCode::Ok);
        assert!(op.signal().completion().unwrap().is_success());
    }
}
