//! Error injection: ask the hub to break the connection, then watch the
//! client's connection-status stream recover (or give up) within a bound.
//!
//! The injection request is an ordinary telemetry message whose properties
//! name the fault and its window. The hub acknowledges it like any other
//! message, waits `delay_secs`, then applies the fault for `duration_secs`.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::Error;
use crate::message::Message;
use crate::poller::{BoundedPoller, CancelFlag, Polled};
use crate::scenario::TestScenario;
use crate::transport::{ConnectionStatus, ConnectionStatusCallback, ConnectionStatusReason, DeviceTransport, RetryPolicy};
use crate::worker::{build_message, send_and_confirm};

pub const FAULT_OPERATION_TYPE: &str = "AzIoTHub_FaultOperationType";
pub const FAULT_OPERATION_CLOSE_REASON: &str = "AzIoTHub_FaultOperationCloseReason";
pub const FAULT_OPERATION_DELAY_IN_SECS: &str = "AzIoTHub_FaultOperationDelayInSecs";
pub const FAULT_OPERATION_DURATION_IN_SECS: &str = "AzIoTHub_FaultOperationDurationInSecs";
pub const DEFAULT_CLOSE_REASON: &str = "boom";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultType {
    KillTcp,
    KillAmqpConnection,
    KillAmqpSession,
    KillAmqpCbsLinkReq,
    KillAmqpCbsLinkResp,
    KillAmqpD2cLink,
    KillAmqpC2dLink,
    KillAmqpTwinLinkReq,
    KillAmqpTwinLinkResp,
    KillAmqpMethodReqLink,
    KillAmqpMethodRespLink,
    InvokeThrottling,
    InvokeMaxMessageQuota,
    InvokeAuthError,
    ShutDownAmqp,
    ShutDownMqtt,
}

impl FaultType {
    pub const ALL: [FaultType; 16] = [
        FaultType::KillTcp,
        FaultType::KillAmqpConnection,
        FaultType::KillAmqpSession,
        FaultType::KillAmqpCbsLinkReq,
        FaultType::KillAmqpCbsLinkResp,
        FaultType::KillAmqpD2cLink,
        FaultType::KillAmqpC2dLink,
        FaultType::KillAmqpTwinLinkReq,
        FaultType::KillAmqpTwinLinkResp,
        FaultType::KillAmqpMethodReqLink,
        FaultType::KillAmqpMethodRespLink,
        FaultType::InvokeThrottling,
        FaultType::InvokeMaxMessageQuota,
        FaultType::InvokeAuthError,
        FaultType::ShutDownAmqp,
        FaultType::ShutDownMqtt,
    ];

    /// Wire name carried in the fault-type property.
    pub fn as_str(self) -> &'static str {
        match self {
            FaultType::KillTcp => "KillTcp",
            FaultType::KillAmqpConnection => "KillAmqpConnection",
            FaultType::KillAmqpSession => "KillAmqpSession",
            FaultType::KillAmqpCbsLinkReq => "KillAmqpCBSLinkReq",
            FaultType::KillAmqpCbsLinkResp => "KillAmqpCBSLinkResp",
            FaultType::KillAmqpD2cLink => "KillAmqpD2CLink",
            FaultType::KillAmqpC2dLink => "KillAmqpC2DLink",
            FaultType::KillAmqpTwinLinkReq => "KillAmqpTwinLinkReq",
            FaultType::KillAmqpTwinLinkResp => "KillAmqpTwinLinkResp",
            FaultType::KillAmqpMethodReqLink => "KillAmqpMethodReqLink",
            FaultType::KillAmqpMethodRespLink => "KillAmqpMethodRespLink",
            FaultType::InvokeThrottling => "InvokeThrottling",
            FaultType::InvokeMaxMessageQuota => "InvokeMaxMessageQuota",
            FaultType::InvokeAuthError => "InvokeAuthError",
            FaultType::ShutDownAmqp => "ShutDownAmqp",
            FaultType::ShutDownMqtt => "ShutDownMqtt",
        }
    }

    /// Throttling and quota faults slow the hub down without dropping the
    /// connection.
    pub fn drops_connection(self) -> bool {
        !matches!(self, FaultType::InvokeThrottling | FaultType::InvokeMaxMessageQuota)
    }
}

impl fmt::Display for FaultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaultType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FaultType::ALL
            .into_iter()
            .find(|fault| fault.as_str() == s)
            .ok_or_else(|| Error::InvalidParameter {
                context: "FaultType".to_string(),
                reason: format!("unknown fault type '{}'", s),
            })
    }
}

/// When the fault starts and how long it lasts, in whole seconds as the hub
/// expects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorInjectionWindow {
    pub delay_secs: u64,
    pub duration_secs: u64,
}

impl Default for ErrorInjectionWindow {
    fn default() -> Self {
        Self {
            delay_secs: crate::ERROR_INJECTION_DEFAULT_DELAY.as_secs(),
            duration_secs: crate::ERROR_INJECTION_DEFAULT_DURATION.as_secs(),
        }
    }
}

impl ErrorInjectionWindow {
    pub fn new(delay_secs: u64, duration_secs: u64) -> Self {
        Self {
            delay_secs,
            duration_secs,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// Latest point, relative to submission, by which the connection must
    /// have settled.
    pub fn bound(&self, grace: Duration) -> Duration {
        self.delay().saturating_add(self.duration()).saturating_add(grace)
    }

    /// Earliest instant the hub can apply a fault submitted at `submitted_at`.
    /// Status changes before it belong to something else.
    pub fn fault_starts_at(&self, submitted_at: Instant) -> Instant {
        submitted_at.checked_add(self.delay()).unwrap_or(submitted_at)
    }
}

pub fn error_injection_message(fault: FaultType, window: ErrorInjectionWindow) -> Message {
    Message::new(format!("error injection: {}", fault))
        .with_property(FAULT_OPERATION_TYPE, fault.as_str())
        .with_property(FAULT_OPERATION_CLOSE_REASON, DEFAULT_CLOSE_REASON)
        .with_property(FAULT_OPERATION_DELAY_IN_SECS, window.delay_secs.to_string())
        .with_property(FAULT_OPERATION_DURATION_IN_SECS, window.duration_secs.to_string())
}

/// `Ok(None)` for ordinary messages, `Err` for malformed injection requests.
pub fn parse_error_injection(message: &Message) -> Result<Option<(FaultType, ErrorInjectionWindow)>, Error> {
    let Some(fault) = message.property(FAULT_OPERATION_TYPE) else {
        return Ok(None);
    };
    let fault = fault.parse::<FaultType>()?;
    let secs = |key: &str| -> Result<u64, Error> {
        let raw = message.property(key).ok_or_else(|| Error::InvalidParameter {
            context: "error injection message".to_string(),
            reason: format!("missing {}", key),
        })?;
        raw.parse().map_err(|_| Error::InvalidParameter {
            context: "error injection message".to_string(),
            reason: format!("{} is not a number of seconds: '{}'", key, raw),
        })
    };
    let window = ErrorInjectionWindow::new(
        secs(FAULT_OPERATION_DELAY_IN_SECS)?,
        secs(FAULT_OPERATION_DURATION_IN_SECS)?,
    );
    Ok(Some((fault, window)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEvent {
    pub status: ConnectionStatus,
    pub reason: ConnectionStatusReason,
    pub at: Instant,
    pub timestamp: DateTime<Utc>,
}

/// Collects a device's connection-status callbacks.
#[derive(Debug, Default)]
pub struct ConnectionStatusRecorder {
    events: Mutex<Vec<StatusEvent>>,
}

impl ConnectionStatusRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, status: ConnectionStatus, reason: ConnectionStatusReason) {
        let event = StatusEvent {
            status,
            reason,
            at: Instant::now(),
            timestamp: Utc::now(),
        };
        log::info!("Connection status {} ({:?}) at {}", status, reason, event.timestamp.to_rfc3339());
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(e) => log::error!("Status recorder lock poisoned, dropping {}: {}", status, e),
        }
    }

    pub fn callback(self: &Arc<Self>) -> ConnectionStatusCallback {
        let recorder = Arc::clone(self);
        Arc::new(move |status: ConnectionStatus, reason: ConnectionStatusReason| {
            recorder.record(status, reason)
        })
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    /// First in-order occurrence of `expected` among the events recorded at
    /// or after `since`. Unrelated events in between are skipped.
    pub fn find_transitions(&self, expected: &[ConnectionStatus], since: Instant) -> Option<Vec<StatusEvent>> {
        let events = self.events();
        let mut wanted = expected.iter().peekable();
        let mut found = Vec::with_capacity(expected.len());
        for event in events.into_iter().filter(|e| e.at >= since) {
            match wanted.peek() {
                Some(status) if **status == event.status => {
                    found.push(event);
                    wanted.next();
                }
                Some(_) => {}
                None => break,
            }
        }
        (found.len() == expected.len()).then_some(found)
    }

    pub fn render(&self) -> String {
        render_statuses(self.events().iter().map(|e| e.status))
    }
}

fn render_statuses(statuses: impl Iterator<Item = ConnectionStatus>) -> String {
    let rendered: Vec<String> = statuses.map(|s| s.to_string()).collect();
    format!("[{}]", rendered.join(" -> "))
}

/// What the status stream should show after the fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryExpectation {
    /// Drop, then reconnect.
    Recover,
    /// Drop, then give up.
    Unrecoverable,
    /// No drop at all; messages keep flowing once the fault clears.
    NoDrop,
}

impl RecoveryExpectation {
    pub fn for_fault(fault: FaultType, policy: &RetryPolicy) -> Self {
        if !fault.drops_connection() {
            RecoveryExpectation::NoDrop
        } else if policy.retries() {
            RecoveryExpectation::Recover
        } else {
            RecoveryExpectation::Unrecoverable
        }
    }

    pub fn transitions(self) -> &'static [ConnectionStatus] {
        match self {
            RecoveryExpectation::Recover => &[ConnectionStatus::DisconnectedRetrying, ConnectionStatus::Connected],
            RecoveryExpectation::Unrecoverable => {
                &[ConnectionStatus::DisconnectedRetrying, ConnectionStatus::Disconnected]
            }
            RecoveryExpectation::NoDrop => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorInjectionConfig {
    pub window: ErrorInjectionWindow,
    #[serde(with = "crate::transport::millis")]
    pub grace: Duration,
    #[serde(with = "crate::transport::millis")]
    pub poll_interval: Duration,
    #[serde(with = "crate::transport::millis")]
    pub send_timeout: Duration,
}

impl Default for ErrorInjectionConfig {
    fn default() -> Self {
        Self {
            window: ErrorInjectionWindow::default(),
            grace: crate::ERROR_INJECTION_GRACE,
            poll_interval: crate::RETRY_INTERVAL,
            send_timeout: crate::SEND_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub fault: FaultType,
    pub expectation: RecoveryExpectation,
    pub transitions: Vec<StatusEvent>,
    /// Submission to the first `DISCONNECTED_RETRYING`.
    pub disconnected_after: Option<Duration>,
    /// Submission to the terminal status of the expected sequence.
    pub settled_after: Option<Duration>,
    pub follow_up_acknowledged: bool,
}

#[derive(Debug)]
pub struct ErrorInjectionDriver {
    transport: Arc<dyn DeviceTransport>,
    scenario: TestScenario,
    config: ErrorInjectionConfig,
    cancel: CancelFlag,
}

impl ErrorInjectionDriver {
    pub fn new(transport: Arc<dyn DeviceTransport>, scenario: TestScenario, config: ErrorInjectionConfig) -> Self {
        Self {
            transport,
            scenario,
            config,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Installs `policy`, submits the injection for `fault` and verifies the
    /// connection-status transitions the policy implies. When the connection
    /// is expected to survive, a follow-up message must also be acknowledged.
    pub async fn run(&self, fault: FaultType, policy: RetryPolicy) -> Result<RecoveryReport, Error> {
        if !self.scenario.protocol.supports_persistent_channels() {
            return Err(Error::Unsupported(format!(
                "{} has no connection-status channel",
                self.scenario.protocol
            )));
        }
        let device_id = self.scenario.device_id();
        let expectation = RecoveryExpectation::for_fault(fault, &policy);
        self.transport.set_retry_policy(policy).await?;

        let recorder = Arc::new(ConnectionStatusRecorder::new());
        self.transport
            .on_connection_status(device_id, recorder.callback())
            .await?;

        let window = self.config.window;
        let bound = window.bound(self.config.grace);
        let send_poller = BoundedPoller::new(self.config.poll_interval, self.config.send_timeout);
        log::info!(
            "{}: injecting {} (delay {}s, duration {}s) over {}, expecting {:?}",
            device_id,
            fault,
            window.delay_secs,
            window.duration_secs,
            self.scenario.protocol,
            expectation
        );

        let submitted_at = Instant::now();
        send_and_confirm(
            self.transport.as_ref(),
            &self.scenario,
            error_injection_message(fault, window),
            0,
            &send_poller,
            &self.cancel,
        )
        .await?;

        let expected = expectation.transitions();
        let fault_start = window.fault_starts_at(submitted_at);
        let transitions = if expected.is_empty() {
            Vec::new()
        } else {
            let status_poller = BoundedPoller::new(self.config.poll_interval, bound);
            let polled = status_poller
                .poll_until(&self.cancel, || {
                    let found = recorder.find_transitions(expected, fault_start);
                    async move { Ok((found.is_some(), found)) }
                })
                .await?;
            match polled {
                Polled::Satisfied(found) => found.unwrap_or_default(),
                Polled::TimedOut(_) => {
                    return Err(Error::ConnectionRecoveryTimeout {
                        context: self.scenario.correlation(),
                        expected: render_statuses(expected.iter().copied()),
                        observed: recorder.render(),
                        bound,
                    })
                }
                Polled::Cancelled => {
                    return Err(Error::Cancelled {
                        context: self.scenario.correlation(),
                    })
                }
            }
        };

        let disconnected_after = transitions.first().map(|e| e.at.duration_since(submitted_at));
        let settled_after = transitions.last().map(|e| e.at.duration_since(submitted_at));

        let follow_up_acknowledged = if expectation == RecoveryExpectation::Unrecoverable {
            false
        } else {
            // Throttling faults hold messages back for the whole window.
            let follow_up_poller = BoundedPoller::new(self.config.poll_interval, self.config.send_timeout.max(bound));
            let message = build_message(&self.scenario, 1, 1);
            send_and_confirm(
                self.transport.as_ref(),
                &self.scenario,
                message,
                1,
                &follow_up_poller,
                &self.cancel,
            )
            .await?;
            true
        };

        log::info!(
            "{}: {} settled as {:?} after {:?}",
            device_id,
            fault,
            expectation,
            settled_after.unwrap_or_else(|| submitted_at.elapsed())
        );
        Ok(RecoveryReport {
            fault,
            expectation,
            transitions,
            disconnected_after,
            settled_after,
            follow_up_acknowledged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injection_message_round_trips() {
        let window = ErrorInjectionWindow::new(5, 5);
        let message = error_injection_message(FaultType::KillAmqpCbsLinkReq, window);
        assert_eq!(message.property(FAULT_OPERATION_TYPE), Some("KillAmqpCBSLinkReq"));
        assert_eq!(message.property(FAULT_OPERATION_CLOSE_REASON), Some("boom"));
        assert_eq!(
            parse_error_injection(&message).unwrap(),
            Some((FaultType::KillAmqpCbsLinkReq, window))
        );
    }

    #[test]
    fn ordinary_messages_are_not_injections() {
        assert_eq!(parse_error_injection(&Message::new("hello")).unwrap(), None);
    }

    #[test]
    fn malformed_window_is_rejected() {
        let message = Message::new("x")
            .with_property(FAULT_OPERATION_TYPE, "KillTcp")
            .with_property(FAULT_OPERATION_DELAY_IN_SECS, "soon");
        assert!(parse_error_injection(&message).is_err());
    }

    #[test]
    fn expectation_follows_policy_and_fault() {
        let retry = RetryPolicy::default();
        assert_eq!(RecoveryExpectation::for_fault(FaultType::KillTcp, &retry), RecoveryExpectation::Recover);
        assert_eq!(
            RecoveryExpectation::for_fault(FaultType::KillTcp, &RetryPolicy::NoRetry),
            RecoveryExpectation::Unrecoverable
        );
        assert_eq!(
            RecoveryExpectation::for_fault(FaultType::InvokeThrottling, &RetryPolicy::NoRetry),
            RecoveryExpectation::NoDrop
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transitions_skip_unrelated_events() {
        let recorder = ConnectionStatusRecorder::new();
        let since = Instant::now();
        recorder.record(ConnectionStatus::Connected, ConnectionStatusReason::ConnectionOk);
        recorder.record(ConnectionStatus::DisconnectedRetrying, ConnectionStatusReason::NoNetwork);
        recorder.record(ConnectionStatus::DisconnectedRetrying, ConnectionStatusReason::NoNetwork);
        assert!(recorder
            .find_transitions(RecoveryExpectation::Recover.transitions(), since)
            .is_none());
        recorder.record(ConnectionStatus::Connected, ConnectionStatusReason::ConnectionOk);
        let found = recorder
            .find_transitions(RecoveryExpectation::Recover.transitions(), since)
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].status, ConnectionStatus::Connected);
        assert_eq!(
            recorder.render(),
            "[CONNECTED -> DISCONNECTED_RETRYING -> DISCONNECTED_RETRYING -> CONNECTED]"
        );
    }

    #[test]
    fn huge_window_bound_saturates() {
        let window = ErrorInjectionWindow::new(u64::MAX, u64::MAX);
        assert_eq!(window.bound(Duration::from_secs(30)), Duration::MAX);
        let now = Instant::now();
        assert_eq!(window.fault_starts_at(now), now);
    }

    #[tokio::test(start_paused = true)]
    async fn drops_before_the_fault_window_are_ignored() {
        let recorder = ConnectionStatusRecorder::new();
        let window = ErrorInjectionWindow::new(5, 5);
        let submitted_at = Instant::now();

        // An unrelated blip shortly after submission.
        tokio::time::sleep(Duration::from_secs(1)).await;
        recorder.record(ConnectionStatus::DisconnectedRetrying, ConnectionStatusReason::NoNetwork);
        recorder.record(ConnectionStatus::Connected, ConnectionStatusReason::ConnectionOk);
        let fault_start = window.fault_starts_at(submitted_at);
        assert!(recorder
            .find_transitions(RecoveryExpectation::Recover.transitions(), fault_start)
            .is_none());

        tokio::time::sleep(Duration::from_secs(5)).await;
        recorder.record(ConnectionStatus::DisconnectedRetrying, ConnectionStatusReason::NoNetwork);
        recorder.record(ConnectionStatus::Connected, ConnectionStatusReason::ConnectionOk);
        let found = recorder
            .find_transitions(RecoveryExpectation::Recover.transitions(), fault_start)
            .unwrap();
        assert!(found[0].at.duration_since(submitted_at) >= window.delay());
    }
}
