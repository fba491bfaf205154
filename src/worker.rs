//! Per-device telemetry worker.
//!
//! A worker owns one logical connection on the shared transport and sends a
//! bounded series of messages, waiting for each acknowledgement before the
//! next. It never retries: retries are the transport's job, the worker only
//! detects and reports.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::message::{IotHubStatusCode, Message};
use crate::outcome::{AggregateOutcome, CompletionGate};
use crate::poller::{BoundedPoller, CancelFlag, PollResult};
use crate::scenario::TestScenario;
use crate::signal::{OperationKind, PendingOperation};
use crate::transport::DeviceTransport;

pub const MESSAGE_COUNT_PROPERTY: &str = "messageCount";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerParams {
    /// K: messages sent per device.
    pub messages_per_device: usize,
    /// M: distinct properties attached to each message.
    pub keys_per_message: usize,
    #[serde(with = "crate::transport::millis")]
    pub poll_interval: Duration,
    /// T: how long one message may stay unacknowledged.
    #[serde(with = "crate::transport::millis")]
    pub send_timeout: Duration,
}

impl Default for WorkerParams {
    fn default() -> Self {
        Self {
            messages_per_device: crate::NUM_MESSAGES_PER_CONNECTION,
            keys_per_message: crate::NUM_KEYS_PER_MESSAGE,
            poll_interval: crate::RETRY_INTERVAL,
            send_timeout: crate::SEND_TIMEOUT,
        }
    }
}

impl WorkerParams {
    pub fn poller(&self) -> BoundedPoller {
        BoundedPoller::new(self.poll_interval, self.send_timeout)
    }
}

/// State shared by every worker of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub outcome: Arc<AggregateOutcome>,
    pub gate: Arc<CompletionGate>,
    pub cancel: CancelFlag,
}

impl RunContext {
    pub fn new(workers: usize) -> Self {
        Self {
            outcome: Arc::new(AggregateOutcome::new()),
            gate: Arc::new(CompletionGate::new(workers)),
            cancel: CancelFlag::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub device_id: String,
    pub acknowledged: usize,
    pub failed: bool,
    pub cancelled: bool,
}

/// Message `sequence` for `scenario`: a per-device body, the sequence marker
/// and `keys` properties `key{j} = value{j}`.
pub fn build_message(scenario: &TestScenario, sequence: u64, keys: usize) -> Message {
    let mut message = Message::new(format!(
        "Rust client {} test e2e message over {} protocol",
        scenario.device_id(),
        scenario.protocol
    ));
    message.set_property(MESSAGE_COUNT_PROPERTY, sequence.to_string());
    for j in 0..keys {
        message.set_property(format!("key{}", j), format!("value{}", j));
    }
    message
}

/// Submits `message` and waits until it is acknowledged with `OK_EMPTY`.
///
/// # Parameters
/// * `transport`: The connection the device's identity is registered on.
/// * `scenario`: Identifies the device and feeds the correlation context.
/// * `message`: The message to submit.
/// * `sequence`: Position of `message` in the device's series, used in errors.
/// * `poller`: Interval and timeout of the wait for the acknowledgement.
/// * `cancel`: Ends the wait early with `Error::Cancelled`.
///
/// # Returns
/// `Ok(())` on `OK_EMPTY`. Otherwise `UnexpectedStatusCode` for any other
/// status, `AcknowledgementTimeout` when the callback never ran, or
/// `Communication` when the transport refused the message outright.
pub async fn send_and_confirm(
    transport: &dyn DeviceTransport,
    scenario: &TestScenario,
    message: Message,
    sequence: u64,
    poller: &BoundedPoller,
    cancel: &CancelFlag,
) -> Result<(), Error> {
    let context = scenario.correlation().with_sequence(sequence);
    let pending = PendingOperation::new(OperationKind::Send, sequence, IotHubStatusCode::OkEmpty);

    transport
        .send_event_async(scenario.device_id(), message, pending.callback())
        .await
        .map_err(|e| Error::Communication(format!("send rejected [{}]: {}", context, e)))?;

    match poller.wait_for(pending.signal(), cancel).await {
        PollResult::Fired(completion) if completion.is_success() => Ok(()),
        PollResult::Fired(completion) => Err(Error::UnexpectedStatusCode {
            context,
            expected: pending.expected,
            actual: completion.status.unwrap_or(IotHubStatusCode::Error),
        }),
        PollResult::TimedOut => Err(Error::AcknowledgementTimeout {
            context,
            expected: pending.expected,
            timeout: poller.timeout,
        }),
        PollResult::Cancelled => Err(Error::Cancelled { context }),
    }
}

/// The worker loop on its own: sends `params.messages_per_device` messages
/// for `scenario`, each confirmed before the next. `on_ack` sees the sequence
/// number of every acknowledged message. Also used for single-client
/// telemetry and around error injection.
pub async fn send_messages(
    transport: &dyn DeviceTransport,
    scenario: &TestScenario,
    params: &WorkerParams,
    cancel: &CancelFlag,
    mut on_ack: impl FnMut(u64) + Send,
) -> Result<(), Error> {
    let poller = params.poller();
    for i in 0..params.messages_per_device as u64 {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                context: scenario.correlation().with_sequence(i),
            });
        }
        let message = build_message(scenario, i, params.keys_per_message);
        send_and_confirm(transport, scenario, message, i, &poller, cancel).await?;
        on_ack(i);
        log::debug!("{}: message {} acknowledged", scenario.device_id(), i);
    }
    Ok(())
}

#[derive(Debug)]
pub struct DeviceWorker {
    scenario: TestScenario,
    transport: Arc<dyn DeviceTransport>,
    params: WorkerParams,
    run: RunContext,
    acknowledged: usize,
}

impl DeviceWorker {
    pub fn new(
        scenario: TestScenario,
        transport: Arc<dyn DeviceTransport>,
        params: WorkerParams,
        run: RunContext,
    ) -> Self {
        Self {
            scenario,
            transport,
            params,
            run,
            acknowledged: 0,
        }
    }

    pub fn device_id(&self) -> &str {
        self.scenario.device_id()
    }

    /// Messages confirmed so far.
    ///
    /// # Returns
    /// The number of messages acknowledged with `OK_EMPTY`. Never exceeds
    /// `messages_per_device`.
    pub fn acknowledged(&self) -> usize {
        self.acknowledged
    }

    /// Sends all K messages in order, stopping at the first failure.
    pub async fn send_messages(&mut self) -> Result<(), Error> {
        let acknowledged = &mut self.acknowledged;
        send_messages(
            self.transport.as_ref(),
            &self.scenario,
            &self.params,
            &self.run.cancel,
            |_| *acknowledged += 1,
        )
        .await
    }

    /// Runs the worker to completion and always reports to the gate. A real
    /// failure marks the shared outcome and opens the gate for everyone.
    pub async fn run(mut self) -> WorkerReport {
        let result = self.send_messages().await;
        let device_id = self.device_id().to_string();
        let mut report = WorkerReport {
            device_id: device_id.clone(),
            acknowledged: self.acknowledged,
            failed: false,
            cancelled: false,
        };
        match result {
            Ok(()) => {
                log::info!(
                    "{}: all {} message(s) acknowledged over {}",
                    device_id,
                    self.acknowledged,
                    self.scenario.protocol
                );
                self.run.gate.count_down();
            }
            Err(e) if e.is_cancellation() => {
                log::info!("{}: stopped after {} message(s), run cancelled", device_id, self.acknowledged);
                report.cancelled = true;
                self.run.gate.count_down();
            }
            Err(e) => {
                report.failed = true;
                self.run.outcome.mark_failed(&device_id, e);
                self.run.gate.release_all();
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{DeviceIdentity, Protocol};

    #[test]
    fn message_carries_sequence_and_distinct_keys() {
        let scenario = TestScenario::new(Protocol::Amqps, DeviceIdentity::with_symmetric_key("dev-0", "k"));
        let message = build_message(&scenario, 2, 10);
        assert_eq!(message.property(MESSAGE_COUNT_PROPERTY), Some("2"));
        assert_eq!(message.properties.len(), 11);
        assert_eq!(message.property("key9"), Some("value9"));
        assert!(message.body.contains("dev-0"));
        assert!(message.body.contains("AMQPS"));
    }

    #[test]
    fn default_params_match_harness_constants() {
        let params = WorkerParams::default();
        assert_eq!(params.messages_per_device, 3);
        assert_eq!(params.keys_per_message, 10);
        assert_eq!(params.poll_interval, Duration::from_millis(100));
        assert_eq!(params.send_timeout, Duration::from_secs(300));
    }
}
