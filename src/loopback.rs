//! In-process hub.
//!
//! [`LoopbackHub`] implements the service side and hands out
//! [`LoopbackTransport`]s for the device side, so whole runs can execute
//! without a network. Behaviour can be bent with knobs: acknowledgement
//! latency, forced status codes, dropped acknowledgements, revoked
//! credentials, failing opens and twin propagation delay. Error-injection
//! messages are honoured with the transport's current [`RetryPolicy`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex as TokioMutex, Notify};
use tokio::time::Instant;

use crate::error::Error;
use crate::error_injection::{parse_error_injection, ErrorInjectionWindow, FaultType};
use crate::message::{IotHubStatusCode, Message};
use crate::poller::deadline_after;
use crate::scenario::{DeviceIdentity, Protocol};
use crate::transport::{
    ConnectionStatus, ConnectionStatusCallback, ConnectionStatusReason, DeviceTransport, FileUploadNotification,
    MessageCallback, MethodHandler, MethodResult, RetryPolicy, ServiceClient, StatusCallback, TwinSnapshot,
};

#[derive(Default)]
struct DeviceRecord {
    revoked: bool,
    forced_status: Option<IotHubStatusCode>,
    accepted: Vec<Message>,
    twin_updates: Vec<(Instant, BTreeMap<String, Value>)>,
    method_handler: Option<MethodHandler>,
    message_callback: Option<MessageCallback>,
    c2d_backlog: Vec<Message>,
}

impl DeviceRecord {
    fn status(&self) -> IotHubStatusCode {
        if self.revoked {
            IotHubStatusCode::Unauthorized
        } else {
            self.forced_status.unwrap_or(IotHubStatusCode::OkEmpty)
        }
    }
}

#[derive(Default)]
struct HubInner {
    devices: HashMap<String, DeviceRecord>,
    ack_delay: Duration,
    drop_acks: bool,
    failing_opens: u32,
    twin_propagation_delay: Duration,
    open_count: usize,
    close_count: usize,
    get_twin_calls: usize,
}

impl HubInner {
    /// Status for an operation by `device_id`; removed identities are
    /// unauthorised.
    fn status_for(&self, device_id: &str) -> IotHubStatusCode {
        self.devices
            .get(device_id)
            .map(DeviceRecord::status)
            .unwrap_or(IotHubStatusCode::Unauthorized)
    }
}

#[derive(Default)]
struct HubState {
    inner: TokioMutex<HubInner>,
    uploads: TokioMutex<VecDeque<FileUploadNotification>>,
    upload_notify: Notify,
}

#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<HubState>,
}

impl fmt::Debug for LoopbackHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackHub").finish_non_exhaustive()
    }
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new shared transport speaking `protocol` to this hub.
    pub fn transport(&self, protocol: Protocol) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            inner: Arc::new(TransportInner {
                protocol,
                hub: self.clone(),
                state: TokioMutex::new(TransportState::default()),
            }),
        })
    }

    /// Creates the identity on the hub if it does not exist yet.
    pub async fn provision(&self, identity: &DeviceIdentity) {
        self.state
            .inner
            .lock()
            .await
            .devices
            .entry(identity.device_id.clone())
            .or_default();
    }

    /// Delays every acknowledgement, method response and cloud-to-device
    /// delivery.
    ///
    /// # Parameters
    /// * `delay`: Time between accepting an operation and invoking its callback.
    pub async fn set_ack_delay(&self, delay: Duration) {
        self.state.inner.lock().await.ack_delay = delay;
    }

    /// While set, send acknowledgements are swallowed and never delivered.
    pub async fn set_drop_acks(&self, drop_acks: bool) {
        self.state.inner.lock().await.drop_acks = drop_acks;
    }

    /// Overrides the status the hub answers `device_id`'s operations with.
    ///
    /// # Parameters
    /// * `device_id`: A provisioned device.
    /// * `status`: The status to report, or `None` to restore normal behavior.
    ///
    /// # Returns
    /// `Error::UnknownDevice` if the device was never provisioned.
    pub async fn force_status(&self, device_id: &str, status: Option<IotHubStatusCode>) -> Result<(), Error> {
        let mut inner = self.state.inner.lock().await;
        let record = inner
            .devices
            .get_mut(device_id)
            .ok_or_else(|| Error::UnknownDevice(device_id.to_string()))?;
        record.forced_status = status;
        Ok(())
    }

    /// Invalidates the device's credentials: every later operation by it is
    /// answered with `UNAUTHORIZED`.
    pub async fn revoke_device(&self, device_id: &str) -> Result<(), Error> {
        let mut inner = self.state.inner.lock().await;
        let record = inner
            .devices
            .get_mut(device_id)
            .ok_or_else(|| Error::UnknownDevice(device_id.to_string()))?;
        record.revoked = true;
        log::info!("Loopback hub revoked credentials of {}", device_id);
        Ok(())
    }

    /// The next `count` calls to `open` on any transport of this hub fail.
    pub async fn fail_next_opens(&self, count: u32) {
        self.state.inner.lock().await.failing_opens = count;
    }

    /// Reported properties become visible to `get_twin` only `delay` after
    /// they were accepted.
    pub async fn set_twin_propagation_delay(&self, delay: Duration) {
        self.state.inner.lock().await.twin_propagation_delay = delay;
    }

    /// Telemetry acknowledged with `OK_EMPTY` for `device_id`, in acceptance
    /// order. Empty for unknown devices.
    pub async fn accepted_messages(&self, device_id: &str) -> Vec<Message> {
        self.state
            .inner
            .lock()
            .await
            .devices
            .get(device_id)
            .map(|record| record.accepted.clone())
            .unwrap_or_default()
    }

    pub async fn accepted_total(&self) -> usize {
        self.state
            .inner
            .lock()
            .await
            .devices
            .values()
            .map(|record| record.accepted.len())
            .sum()
    }

    /// Successful and failed `open` calls across all transports.
    pub async fn open_count(&self) -> usize {
        self.state.inner.lock().await.open_count
    }

    pub async fn close_count(&self) -> usize {
        self.state.inner.lock().await.close_count
    }

    /// Number of service-side twin reads so far.
    pub async fn get_twin_calls(&self) -> usize {
        self.state.inner.lock().await.get_twin_calls
    }

    pub async fn device_exists(&self, device_id: &str) -> bool {
        self.state.inner.lock().await.devices.contains_key(device_id)
    }

    /// Acknowledges an operation by `device_id` after the configured delay.
    /// A successful telemetry `message` is recorded before the callback runs.
    async fn acknowledge(&self, device_id: &str, message: Option<Message>, callback: StatusCallback) {
        let (status, delay) = {
            let inner = self.state.inner.lock().await;
            if inner.drop_acks {
                log::debug!("Loopback hub dropping acknowledgement for {}", device_id);
                return;
            }
            (inner.status_for(device_id), inner.ack_delay)
        };
        let hub = self.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let (IotHubStatusCode::OkEmpty, Some(message)) = (status, message) {
                if let Some(record) = hub.state.inner.lock().await.devices.get_mut(&device_id) {
                    record.accepted.push(message);
                }
            }
            callback(status);
        });
    }

    async fn accept_reported(&self, device_id: &str, properties: BTreeMap<String, Value>, callback: StatusCallback) {
        let status = {
            let mut inner = self.state.inner.lock().await;
            let visible_at = deadline_after(inner.twin_propagation_delay);
            let status = inner.status_for(device_id);
            if status == IotHubStatusCode::OkEmpty {
                if let Some(record) = inner.devices.get_mut(device_id) {
                    record.twin_updates.push((visible_at, properties));
                }
            }
            status
        };
        let status = if status == IotHubStatusCode::OkEmpty {
            IotHubStatusCode::Ok
        } else {
            status
        };
        tokio::spawn(async move { callback(status) });
    }

    async fn accept_upload(&self, device_id: &str, blob_name: String, size: u64, callback: StatusCallback) {
        let (status, delay) = {
            let inner = self.state.inner.lock().await;
            (inner.status_for(device_id), inner.ack_delay)
        };
        let hub = self.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if status == IotHubStatusCode::OkEmpty {
                let path = format!("{}/{}", device_id, blob_name);
                hub.state.uploads.lock().await.push_back(FileUploadNotification {
                    device_id,
                    blob_uri: format!("https://loopback.blob.local/{}", path),
                    blob_name: path,
                    blob_size_in_bytes: size,
                });
                hub.state.upload_notify.notify_waiters();
            }
            callback(status);
        });
    }

    async fn set_method_handler(&self, device_id: &str, handler: MethodHandler) -> Result<(), Error> {
        let mut inner = self.state.inner.lock().await;
        let record = inner
            .devices
            .get_mut(device_id)
            .ok_or_else(|| Error::UnknownDevice(device_id.to_string()))?;
        record.method_handler = Some(handler);
        Ok(())
    }

    async fn set_message_callback(&self, device_id: &str, callback: MessageCallback) -> Result<(), Error> {
        let backlog = {
            let mut inner = self.state.inner.lock().await;
            let record = inner
                .devices
                .get_mut(device_id)
                .ok_or_else(|| Error::UnknownDevice(device_id.to_string()))?;
            record.message_callback = Some(Arc::clone(&callback));
            std::mem::take(&mut record.c2d_backlog)
        };
        for message in backlog {
            deliver(device_id, &callback, message);
        }
        Ok(())
    }
}

fn deliver(device_id: &str, callback: &MessageCallback, message: Message) {
    let disposition = callback(message);
    log::debug!("{} disposed cloud-to-device message as {:?}", device_id, disposition);
}

#[async_trait]
impl ServiceClient for LoopbackHub {
    async fn get_twin(&self, device_id: &str) -> Result<TwinSnapshot, Error> {
        let mut inner = self.state.inner.lock().await;
        inner.get_twin_calls += 1;
        let record = inner
            .devices
            .get(device_id)
            .ok_or_else(|| Error::UnknownDevice(device_id.to_string()))?;
        let now = Instant::now();
        let mut reported = BTreeMap::new();
        let mut version = 0;
        for (_, patch) in record.twin_updates.iter().filter(|(visible_at, _)| *visible_at <= now) {
            reported.extend(patch.iter().map(|(k, v)| (k.clone(), v.clone())));
            version += 1;
        }
        Ok(TwinSnapshot {
            device_id: device_id.to_string(),
            reported,
            desired: BTreeMap::new(),
            version: Some(version),
        })
    }

    async fn invoke_method(
        &self,
        device_id: &str,
        method_name: &str,
        _response_timeout: Duration,
        _connect_timeout: Duration,
        payload: &str,
    ) -> Result<MethodResult, Error> {
        let handler = {
            let inner = self.state.inner.lock().await;
            let record = inner
                .devices
                .get(device_id)
                .ok_or_else(|| Error::UnknownDevice(device_id.to_string()))?;
            record.method_handler.clone().ok_or_else(|| {
                Error::Communication(format!("device {} is not subscribed to methods", device_id))
            })?
        };
        let response = handler(method_name, payload);
        Ok(MethodResult {
            status: response.status,
            payload: response.payload,
        })
    }

    async fn send_to_device(&self, device_id: &str, message: Message) -> Result<(), Error> {
        let (callback, delay) = {
            let mut inner = self.state.inner.lock().await;
            let delay = inner.ack_delay;
            let record = inner
                .devices
                .get_mut(device_id)
                .ok_or_else(|| Error::UnknownDevice(device_id.to_string()))?;
            match record.message_callback.clone() {
                Some(callback) => (callback, delay),
                None => {
                    record.c2d_backlog.push(message);
                    return Ok(());
                }
            }
        };
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            deliver(&device_id, &callback, message);
        });
        Ok(())
    }

    async fn receive_file_upload_notification(
        &self,
        timeout: Duration,
    ) -> Result<Option<FileUploadNotification>, Error> {
        let deadline = deadline_after(timeout);
        loop {
            let notified = self.state.upload_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(notification) = self.state.uploads.lock().await.pop_front() {
                return Ok(Some(notification));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.state.uploads.lock().await.pop_front());
            }
        }
    }

    async fn remove_device(&self, device_id: &str) -> Result<(), Error> {
        match self.state.inner.lock().await.devices.remove(device_id) {
            Some(_) => Ok(()),
            None => Err(Error::UnknownDevice(device_id.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Link {
    Up,
    Down,
    #[default]
    Closed,
}

struct HeldSend {
    device_id: String,
    message: Message,
    callback: StatusCallback,
}

#[derive(Default)]
struct TransportState {
    devices: Vec<String>,
    open: bool,
    link: Link,
    retry_policy: RetryPolicy,
    throttled_until: Option<Instant>,
    held: Vec<HeldSend>,
    status_callbacks: HashMap<String, ConnectionStatusCallback>,
}

impl TransportState {
    fn check_bound(&self, device_id: &str) -> Result<(), Error> {
        if !self.devices.iter().any(|d| d == device_id) {
            return Err(Error::UnknownDevice(device_id.to_string()));
        }
        Ok(())
    }

    fn check_usable(&self, device_id: &str) -> Result<(), Error> {
        self.check_bound(device_id)?;
        if !self.open || self.link == Link::Closed {
            return Err(Error::NotConnected);
        }
        Ok(())
    }
}

struct TransportInner {
    protocol: Protocol,
    hub: LoopbackHub,
    state: TokioMutex<TransportState>,
}

impl TransportInner {
    async fn broadcast(&self, status: ConnectionStatus, reason: ConnectionStatusReason) {
        let callbacks: Vec<ConnectionStatusCallback> =
            self.state.lock().await.status_callbacks.values().cloned().collect();
        for callback in callbacks {
            callback(status, reason);
        }
    }

    /// Completes every held send: successful ones go through the hub as
    /// usual, anything else is reported straight to the callback.
    async fn release_held(&self, status: IotHubStatusCode) {
        let held = std::mem::take(&mut self.state.lock().await.held);
        for send in held {
            if status == IotHubStatusCode::OkEmpty {
                self.hub.acknowledge(&send.device_id, Some(send.message), send.callback).await;
            } else {
                (send.callback)(status);
            }
        }
    }

    async fn run_fault(self: Arc<Self>, fault: FaultType, window: ErrorInjectionWindow) {
        tokio::time::sleep(window.delay()).await;
        let fault_end = deadline_after(window.duration());
        log::info!("Loopback {} applying {} for {:?}", self.protocol, fault, window.duration());

        if !fault.drops_connection() {
            self.state.lock().await.throttled_until = Some(fault_end);
            tokio::time::sleep_until(fault_end).await;
            self.state.lock().await.throttled_until = None;
            self.release_held(IotHubStatusCode::OkEmpty).await;
            return;
        }

        let policy = {
            let mut state = self.state.lock().await;
            if state.link != Link::Up {
                return;
            }
            state.link = Link::Down;
            state.retry_policy.clone()
        };
        self.broadcast(ConnectionStatus::DisconnectedRetrying, ConnectionStatusReason::NoNetwork)
            .await;

        let mut attempt = 0;
        loop {
            let Some(delay) = policy.delay_for(attempt) else {
                self.state.lock().await.link = Link::Closed;
                self.broadcast(ConnectionStatus::Disconnected, ConnectionStatusReason::RetryExpired)
                    .await;
                self.release_held(IotHubStatusCode::MessageCancelledOnClose).await;
                return;
            };
            tokio::time::sleep(delay).await;
            attempt += 1;
            if Instant::now() < fault_end {
                continue;
            }
            {
                let mut state = self.state.lock().await;
                if state.link != Link::Down {
                    return;
                }
                state.link = Link::Up;
            }
            log::info!("Loopback {} reconnected after {} attempt(s)", self.protocol, attempt);
            self.broadcast(ConnectionStatus::Connected, ConnectionStatusReason::ConnectionOk)
                .await;
            self.release_held(IotHubStatusCode::OkEmpty).await;
            return;
        }
    }
}

/// Device side of a [`LoopbackHub`]: one shared transport carrying any
/// number of registered devices.
pub struct LoopbackTransport {
    inner: Arc<TransportInner>,
}

impl fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("protocol", &self.inner.protocol)
            .finish_non_exhaustive()
    }
}

impl LoopbackTransport {
    pub fn hub(&self) -> &LoopbackHub {
        &self.inner.hub
    }
}

#[async_trait]
impl DeviceTransport for LoopbackTransport {
    fn protocol(&self) -> Protocol {
        self.inner.protocol
    }

    async fn register(&self, identity: &DeviceIdentity) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;
        if state.open {
            return Err(Error::InvalidParameter {
                context: format!("register {}", identity.device_id),
                reason: "transport is already open".to_string(),
            });
        }
        self.inner.hub.provision(identity).await;
        if !state.devices.contains(&identity.device_id) {
            state.devices.push(identity.device_id.clone());
        }
        Ok(())
    }

    async fn open(&self) -> Result<(), Error> {
        {
            let mut hub = self.inner.hub.state.inner.lock().await;
            hub.open_count += 1;
            if hub.failing_opens > 0 {
                hub.failing_opens -= 1;
                return Err(Error::Communication("loopback open refused".to_string()));
            }
        }
        {
            let mut state = self.inner.state.lock().await;
            state.open = true;
            state.link = Link::Up;
        }
        self.inner
            .broadcast(ConnectionStatus::Connected, ConnectionStatusReason::ConnectionOk)
            .await;
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.inner.hub.state.inner.lock().await.close_count += 1;
        let was_open = {
            let mut state = self.inner.state.lock().await;
            let was_open = state.open;
            state.open = false;
            state.link = Link::Closed;
            was_open
        };
        self.inner.release_held(IotHubStatusCode::MessageCancelledOnClose).await;
        if was_open {
            self.inner
                .broadcast(ConnectionStatus::Disconnected, ConnectionStatusReason::ClientClose)
                .await;
        }
        Ok(())
    }

    async fn set_retry_policy(&self, policy: RetryPolicy) -> Result<(), Error> {
        self.inner.state.lock().await.retry_policy = policy;
        Ok(())
    }

    async fn send_event_async(&self, device_id: &str, message: Message, callback: StatusCallback) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock().await;
            state.check_usable(device_id)?;
            if let Some((fault, window)) = parse_error_injection(&message)? {
                tokio::spawn(Arc::clone(&self.inner).run_fault(fault, window));
            }
            let throttled = state.throttled_until.is_some_and(|until| Instant::now() < until);
            if state.link == Link::Down || throttled {
                state.held.push(HeldSend {
                    device_id: device_id.to_string(),
                    message,
                    callback,
                });
                return Ok(());
            }
        }
        self.inner.hub.acknowledge(device_id, Some(message), callback).await;
        Ok(())
    }

    async fn on_connection_status(&self, device_id: &str, callback: ConnectionStatusCallback) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;
        state.check_bound(device_id)?;
        state.status_callbacks.insert(device_id.to_string(), callback);
        Ok(())
    }

    async fn send_reported_properties(
        &self,
        device_id: &str,
        properties: BTreeMap<String, Value>,
        callback: StatusCallback,
    ) -> Result<(), Error> {
        {
            let state = self.inner.state.lock().await;
            state.check_usable(device_id)?;
            if state.link != Link::Up {
                return Err(Error::NotConnected);
            }
        }
        self.inner.hub.accept_reported(device_id, properties, callback).await;
        Ok(())
    }

    async fn subscribe_to_methods(&self, device_id: &str, handler: MethodHandler) -> Result<(), Error> {
        self.inner.state.lock().await.check_bound(device_id)?;
        self.inner.hub.set_method_handler(device_id, handler).await
    }

    async fn set_message_callback(&self, device_id: &str, callback: MessageCallback) -> Result<(), Error> {
        self.inner.state.lock().await.check_bound(device_id)?;
        self.inner.hub.set_message_callback(device_id, callback).await
    }

    async fn upload_to_blob_async(
        &self,
        device_id: &str,
        blob_name: String,
        data: Vec<u8>,
        callback: StatusCallback,
    ) -> Result<(), Error> {
        self.inner.state.lock().await.check_usable(device_id)?;
        self.inner
            .hub
            .accept_upload(device_id, blob_name, data.len() as u64, callback)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{OperationKind, PendingOperation};

    #[tokio::test]
    async fn twin_reads_do_not_mutate() {
        let hub = LoopbackHub::new();
        let transport = hub.transport(Protocol::Amqps);
        transport
            .register(&DeviceIdentity::with_symmetric_key("dev", "k"))
            .await
            .unwrap();
        transport.open().await.unwrap();
        let op = PendingOperation::new(OperationKind::TwinPatch, 0, IotHubStatusCode::Ok);
        transport
            .send_reported_properties("dev", BTreeMap::from([("a".to_string(), Value::from(1))]), op.callback())
            .await
            .unwrap();
        let first = hub.get_twin("dev").await.unwrap();
        let second = hub.get_twin("dev").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.reported.get("a"), Some(&Value::from(1)));
        assert_eq!(hub.get_twin_calls().await, 2);
    }

    #[tokio::test]
    async fn send_before_open_is_rejected() {
        let hub = LoopbackHub::new();
        let transport = hub.transport(Protocol::Amqps);
        transport
            .register(&DeviceIdentity::with_symmetric_key("dev", "k"))
            .await
            .unwrap();
        let op = PendingOperation::new(OperationKind::Send, 0, IotHubStatusCode::OkEmpty);
        let result = transport.send_event_async("dev", Message::new("x"), op.callback()).await;
        assert!(matches!(result, Err(Error::NotConnected)));
        let result = transport.send_event_async("other", Message::new("x"), op.callback()).await;
        assert!(matches!(result, Err(Error::UnknownDevice(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn upload_notification_is_queued() {
        let hub = LoopbackHub::new();
        let transport = hub.transport(Protocol::Amqps);
        transport
            .register(&DeviceIdentity::with_symmetric_key("dev", "k"))
            .await
            .unwrap();
        transport.open().await.unwrap();
        let op = PendingOperation::new(OperationKind::FileUpload, 0, IotHubStatusCode::OkEmpty);
        transport
            .upload_to_blob_async("dev", "File0.txt".into(), vec![0; 8], op.callback())
            .await
            .unwrap();
        let notification = hub
            .receive_file_upload_notification(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notification.blob_name, "dev/File0.txt");
        assert_eq!(notification.blob_size_in_bytes, 8);
        assert!(hub
            .receive_file_upload_notification(Duration::from_secs(1))
            .await
            .unwrap()
            .is_none());
    }
}
