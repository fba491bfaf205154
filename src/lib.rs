//! End-to-end harness for IoT hub device clients that multiplex several
//! device identities over one shared transport connection.
//!
//! A run binds N devices to a single [`DeviceTransport`], opens it with a
//! bounded retry, and drives one [`DeviceWorker`] per device. Every worker
//! sends K telemetry messages and blocks on each acknowledgement through a
//! [`BoundedPoller`] watching a [`CompletionSignal`]. The
//! [`MultiplexCoordinator`] collects the outcomes, cancels the remaining
//! workers on the first failure and always closes the transport.
//!
//! Beyond telemetry the crate verifies twin reported-property propagation
//! ([`TwinVerifier`]), connection recovery after hub-side fault injection
//! ([`ErrorInjectionDriver`]), device methods, cloud-to-device messages and
//! file upload notifications.
//!
//! Two transports ship with the crate: [`MqttDeviceTransport`] speaks to a
//! real broker, [`LoopbackHub`] simulates the hub in-process.

use std::time::Duration;

pub mod c2d;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod error_injection;
pub mod file_upload;
pub mod logging;
pub mod loopback;
pub mod message;
pub mod method;
pub mod mqtt;
pub mod outcome;
pub mod poller;
pub mod scenario;
pub mod signal;
pub mod transport;
pub mod twin;
pub mod worker;

pub use c2d::ReceiveVerifier;
pub use config::HarnessConfig;
pub use coordinator::{open_with_retry, MultiplexConfig, MultiplexCoordinator, MultiplexReport, OpenRetry};
pub use error::Error;
pub use error_injection::{
    ConnectionStatusRecorder, ErrorInjectionConfig, ErrorInjectionDriver, ErrorInjectionWindow, FaultType,
    RecoveryExpectation, RecoveryReport,
};
pub use file_upload::FileUploadVerifier;
pub use loopback::{LoopbackHub, LoopbackTransport};
pub use message::{IotHubStatusCode, Message, MessageDisposition};
pub use method::MethodInvocationVerifier;
pub use mqtt::MqttDeviceTransport;
pub use outcome::{AggregateOutcome, CompletionGate, WorkerFailure};
pub use poller::{BoundedPoller, CancelFlag, PollResult};
pub use scenario::{AuthenticationType, ClientType, CorrelationContext, DeviceIdentity, Protocol, TestScenario};
pub use signal::{Completion, CompletionSignal, Outcome, PendingOperation};
pub use transport::{ConnectionStatus, ConnectionStatusReason, DeviceTransport, RetryPolicy, ServiceClient};
pub use twin::{DeviceTwinView, TwinSyncConfig, TwinUpdate, TwinVerifier};
pub use worker::{DeviceWorker, WorkerParams};

/// Devices bound to one shared transport in a multiplex run.
pub const MAX_DEVICE_MULTIPLEX: usize = 3;
/// Application properties attached to every telemetry message.
pub const NUM_KEYS_PER_MESSAGE: usize = 10;
/// Telemetry messages each device sends per run.
pub const NUM_MESSAGES_PER_CONNECTION: usize = 3;

pub const RETRY_INTERVAL: Duration = Duration::from_millis(100);
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const MULTITHREADED_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub const TWIN_OPERATION_INTERVAL: Duration = Duration::from_millis(500);
pub const TWIN_PROPAGATION_WINDOW: Duration = Duration::from_secs(5);
pub const TWIN_PROPERTIES_TO_TEST: usize = 3;

pub const METHOD_RESPONSE_TIMEOUT: Duration = Duration::from_secs(200);
pub const METHOD_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long stale file upload notifications are drained before and after a test.
pub const NOTIFICATION_FLUSH_WINDOW: Duration = Duration::from_secs(10);
pub const INTERTEST_GUARD_DELAY: Duration = Duration::from_secs(2);

pub const ERROR_INJECTION_DEFAULT_DELAY: Duration = Duration::from_secs(1);
pub const ERROR_INJECTION_DEFAULT_DURATION: Duration = Duration::from_secs(5);
/// Slack on top of an injection's delay and duration before recovery is
/// declared overdue.
pub const ERROR_INJECTION_GRACE: Duration = Duration::from_secs(30);
