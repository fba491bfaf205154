use std::time::Duration;

use thiserror::Error;

use crate::message::IotHubStatusCode;
use crate::scenario::CorrelationContext;

/// The primary error type for the `iothub_e2e_rs` harness.
///
/// Harness failures (everything a run can assert on) carry a
/// [`CorrelationContext`] so a failure can be attributed to a device,
/// protocol and message sequence number without digging through logs.
#[derive(Error, Debug)]
pub enum Error {
    /// The shared transport could not be opened within the bounded retry loop.
    /// Fatal: no worker is started.
    #[error("Transport open failed after {attempts} attempt(s) over {protocol}: {details}")]
    TransportOpenFailure {
        /// Protocol of the shared transport.
        protocol: String,
        /// How many open attempts were made.
        attempts: u32,
        /// The error reported by the last attempt.
        details: String,
    },

    /// A submitted operation was never acknowledged within its timeout.
    #[error("Timed out after {timeout:?} waiting for {expected} acknowledgement [{context}]")]
    AcknowledgementTimeout {
        /// Which device, protocol and message the timeout belongs to.
        context: CorrelationContext,
        /// The status the harness was waiting for.
        expected: IotHubStatusCode,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// An acknowledgement arrived but carried the wrong status code.
    #[error("Unexpected iot hub status code! Expected {expected} but got {actual} [{context}]")]
    UnexpectedStatusCode {
        /// Which device, protocol and message the acknowledgement belongs to.
        context: CorrelationContext,
        /// Expected status.
        expected: IotHubStatusCode,
        /// Status actually delivered to the callback.
        actual: IotHubStatusCode,
    },

    /// The service view of a twin did not reach the expected property count
    /// within the propagation window.
    #[error("Twin sync timed out after {window:?}: expected {expected} matching reported properties, observed {observed} [{context}]")]
    TwinSyncTimeout {
        /// Device whose twin was polled.
        context: CorrelationContext,
        /// Number of pushed properties.
        expected: usize,
        /// Best match count observed before the deadline.
        observed: usize,
        /// The propagation window that elapsed.
        window: Duration,
    },

    /// The connection-status stream did not show the expected transition
    /// sequence after an error injection.
    #[error("Connection recovery timed out after {bound:?}: expected {expected}, observed {observed} [{context}]")]
    ConnectionRecoveryTimeout {
        /// Device the injection was sent through.
        context: CorrelationContext,
        /// Rendered expected status sequence.
        expected: String,
        /// Rendered observed status sequence.
        observed: String,
        /// The bound derived from the injection window plus grace period.
        bound: Duration,
    },

    /// The multiplex run did not complete before its global timeout.
    #[error("Multiplex run over {protocol} did not complete within {timeout:?}; {remaining} worker(s) outstanding")]
    MultiplexTimeout {
        /// Protocol of the shared transport.
        protocol: String,
        /// Global multiplex timeout.
        timeout: Duration,
        /// Workers that had not signalled completion.
        remaining: usize,
    },

    /// The enclosing run was cancelled before the operation completed.
    /// Not a failure of the cancelled party itself.
    #[error("Cancelled [{context}]")]
    Cancelled {
        /// The operation that observed cancellation.
        context: CorrelationContext,
    },

    /// A device method invocation threw or returned an unexpected result.
    #[error("Method invocation failed: {details} [{context}]")]
    MethodInvocationFailed {
        /// Device the method was invoked on.
        context: CorrelationContext,
        /// What went wrong.
        details: String,
    },

    /// A received message was missing one or more expected properties.
    #[error("Received message failed verification: {details} [{context}]")]
    MessageVerificationFailed {
        /// Receiving device.
        context: CorrelationContext,
        /// What went wrong.
        details: String,
    },

    /// No message arrived at the device within the receive timeout.
    #[error("Timed out after {timeout:?} waiting for message to be received [{context}]")]
    ReceiveTimeout {
        /// Receiving device.
        context: CorrelationContext,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// A file upload failed or its notification did not match.
    #[error("File upload failed: {details} [{context}]")]
    FileUploadFailed {
        /// Uploading device.
        context: CorrelationContext,
        /// What went wrong.
        details: String,
    },

    /// A general communication error raised by a transport or service client.
    #[error("Communication error: {0}")]
    Communication(String),

    /// An operation was attempted on a transport that is not open.
    #[error("Transport is not connected")]
    NotConnected,

    /// The device id is not bound to the transport or unknown to the service.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// The transport does not implement the requested capability.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Indicates that a provided parameter was invalid for a given context.
    #[error("Invalid parameter for {context}: {reason}")]
    InvalidParameter {
        /// The operation where the parameter validation failed.
        context: String,
        /// Why the parameter was rejected.
        reason: String,
    },

    /// The harness configuration was rejected.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Represents an error during JSON serialization or deserialization.
    #[error("JSON processing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading a configuration file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors produced by observing cancellation rather than by a
    /// genuine failure of the operation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// The correlation context of a harness failure, if it carries one.
    pub fn context(&self) -> Option<&CorrelationContext> {
        match self {
            Error::AcknowledgementTimeout { context, .. }
            | Error::UnexpectedStatusCode { context, .. }
            | Error::TwinSyncTimeout { context, .. }
            | Error::ConnectionRecoveryTimeout { context, .. }
            | Error::Cancelled { context }
            | Error::MethodInvocationFailed { context, .. }
            | Error::MessageVerificationFailed { context, .. }
            | Error::ReceiveTimeout { context, .. }
            | Error::FileUploadFailed { context, .. } => Some(context),
            _ => None,
        }
    }
}
