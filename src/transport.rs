//! Contracts of the collaborators under test.
//!
//! [`DeviceTransport`] is the device side: one shared transport carrying any
//! number of logical device connections. [`ServiceClient`] is the hub's
//! service side: twin reads, method invocation, cloud-to-device sends and
//! file upload notifications. The harness only ever talks to these traits.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::message::{IotHubStatusCode, Message, MessageDisposition};
use crate::scenario::{DeviceIdentity, Protocol};

/// Invoked exactly once with the hub's verdict on a submitted operation.
pub type StatusCallback = Box<dyn FnOnce(IotHubStatusCode) + Send + 'static>;
pub type ConnectionStatusCallback =
    Arc<dyn Fn(ConnectionStatus, ConnectionStatusReason) + Send + Sync + 'static>;
pub type MessageCallback = Arc<dyn Fn(Message) -> MessageDisposition + Send + Sync + 'static>;
/// `(method_name, payload) -> response`
pub type MethodHandler = Arc<dyn Fn(&str, &str) -> DeviceMethodResponse + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Connected,
    DisconnectedRetrying,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::DisconnectedRetrying => "DISCONNECTED_RETRYING",
            ConnectionStatus::Disconnected => "DISCONNECTED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatusReason {
    ConnectionOk,
    NoNetwork,
    RetryExpired,
    ExpiredSasToken,
    BadCredential,
    CommunicationError,
    ClientClose,
}

/// Reconnection strategy handed to the transport. The harness chooses one;
/// the transport applies it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    NoRetry,
    ExponentialBackoffWithJitter {
        max_retries: u32,
        #[serde(with = "millis")]
        min_backoff: Duration,
        #[serde(with = "millis")]
        max_backoff: Duration,
        #[serde(with = "millis")]
        delta_backoff: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::ExponentialBackoffWithJitter {
            max_retries: u32::MAX,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            delta_backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// `None` when no further attempt should be made.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match self {
            RetryPolicy::NoRetry => None,
            RetryPolicy::ExponentialBackoffWithJitter {
                max_retries,
                min_backoff,
                max_backoff,
                delta_backoff,
            } => {
                if attempt >= *max_retries {
                    return None;
                }
                let base = delta_backoff.saturating_mul(2u32.saturating_pow(attempt.min(16)));
                let jitter_ms = (base.as_millis() as f64 * 0.2 * rand::thread_rng().gen::<f64>()) as u64;
                let delay = min_backoff
                    .saturating_add(base)
                    .saturating_add(Duration::from_millis(jitter_ms))
                    .min(*max_backoff);
                Some(delay)
            }
        }
    }

    pub fn retries(&self) -> bool {
        !matches!(self, RetryPolicy::NoRetry)
    }
}

/// The service's view of a device twin at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinSnapshot {
    pub device_id: String,
    #[serde(default)]
    pub reported: BTreeMap<String, Value>,
    #[serde(default)]
    pub desired: BTreeMap<String, Value>,
    #[serde(default)]
    pub version: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMethodResponse {
    pub status: u16,
    pub payload: String,
}

/// What the service sees after invoking a device method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodResult {
    pub status: u16,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadNotification {
    pub device_id: String,
    pub blob_name: String,
    pub blob_uri: String,
    pub blob_size_in_bytes: u64,
}

#[async_trait]
pub trait DeviceTransport: Send + Sync + fmt::Debug + 'static {
    fn protocol(&self) -> Protocol;
    /// Binds a logical connection for `identity`. Must precede `open`.
    async fn register(&self, identity: &DeviceIdentity) -> Result<(), Error>;
    async fn open(&self) -> Result<(), Error>;
    async fn close(&self) -> Result<(), Error>;
    async fn set_retry_policy(&self, policy: RetryPolicy) -> Result<(), Error>;
    /// Queues `message`; `callback` fires once with the hub's acknowledgement.
    /// An `Err` means the message was never queued and the callback will not fire.
    async fn send_event_async(
        &self,
        device_id: &str,
        message: Message,
        callback: StatusCallback,
    ) -> Result<(), Error>;
    async fn on_connection_status(
        &self,
        device_id: &str,
        callback: ConnectionStatusCallback,
    ) -> Result<(), Error>;
    async fn send_reported_properties(
        &self,
        device_id: &str,
        properties: BTreeMap<String, Value>,
        callback: StatusCallback,
    ) -> Result<(), Error>;
    async fn subscribe_to_methods(&self, device_id: &str, handler: MethodHandler) -> Result<(), Error>;
    async fn set_message_callback(&self, device_id: &str, callback: MessageCallback) -> Result<(), Error>;
    async fn upload_to_blob_async(
        &self,
        device_id: &str,
        blob_name: String,
        data: Vec<u8>,
        callback: StatusCallback,
    ) -> Result<(), Error>;
}

#[async_trait]
pub trait ServiceClient: Send + Sync + fmt::Debug + 'static {
    /// Side-effect free on the remote twin.
    async fn get_twin(&self, device_id: &str) -> Result<TwinSnapshot, Error>;
    async fn invoke_method(
        &self,
        device_id: &str,
        method_name: &str,
        response_timeout: Duration,
        connect_timeout: Duration,
        payload: &str,
    ) -> Result<MethodResult, Error>;
    async fn send_to_device(&self, device_id: &str, message: Message) -> Result<(), Error>;
    async fn receive_file_upload_notification(
        &self,
        timeout: Duration,
    ) -> Result<Option<FileUploadNotification>, Error>;
    async fn remove_device(&self, device_id: &str) -> Result<(), Error>;
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
