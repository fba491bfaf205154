//! [`DeviceTransport`] over a single MQTT session.
//!
//! Every registered device gets its own topic namespace on the shared
//! session:
//!
//! | direction | topic |
//! |-----------|-------|
//! | telemetry | `devices/{id}/messages/events/` |
//! | reported patch | `devices/{id}/twin/PATCH/properties/reported/?$rid={rid}` |
//! | patch response | `devices/{id}/twin/res/{status}/?$rid={rid}` |
//! | method request | `devices/{id}/methods/POST/{name}/?$rid={rid}` |
//! | method response | `devices/{id}/methods/res/{status}/?$rid={rid}` |
//! | cloud-to-device | `devices/{id}/messages/devicebound/...` |
//!
//! Telemetry is published at QoS 1 and acknowledged with `OK_EMPTY` when the
//! broker's PUBACK arrives. Payloads are the JSON form of [`Message`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event as MqttEvent, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex as TokioMutex, RwLock as TokioRwLock};

use crate::error::Error;
use crate::message::{IotHubStatusCode, Message};
use crate::scenario::{DeviceIdentity, Protocol};
use crate::transport::{
    ConnectionStatus, ConnectionStatusCallback, ConnectionStatusReason, DeviceMethodResponse, DeviceTransport,
    MessageCallback, MethodHandler, RetryPolicy, StatusCallback,
};

const REQUEST_CHANNEL_CAPACITY: usize = 100;
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(5);

pub fn telemetry_topic(device_id: &str) -> String {
    format!("devices/{}/messages/events/", device_id)
}

pub fn reported_patch_topic(device_id: &str, rid: &str) -> String {
    format!("devices/{}/twin/PATCH/properties/reported/?$rid={}", device_id, rid)
}

pub fn method_response_topic(device_id: &str, status: u16, rid: &str) -> String {
    format!("devices/{}/methods/res/{}/?$rid={}", device_id, status, rid)
}

/// Topic filters a device needs on the shared session.
pub fn device_subscriptions(device_id: &str) -> [String; 3] {
    [
        format!("devices/{}/twin/res/#", device_id),
        format!("devices/{}/methods/POST/#", device_id),
        format!("devices/{}/messages/devicebound/#", device_id),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound<'a> {
    TwinResponse { device_id: &'a str, status: u16, rid: &'a str },
    MethodRequest { device_id: &'a str, method_name: &'a str, rid: &'a str },
    CloudToDevice { device_id: &'a str },
}

fn request_id(segment: &str) -> Option<&str> {
    segment.strip_prefix("?$rid=").and_then(|rest| rest.split('&').next())
}

pub fn parse_topic(topic: &str) -> Option<Inbound<'_>> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        ["devices", device_id, "twin", "res", status, query] => Some(Inbound::TwinResponse {
            device_id,
            status: status.parse().ok()?,
            rid: request_id(query)?,
        }),
        ["devices", device_id, "methods", "POST", method_name, query] => Some(Inbound::MethodRequest {
            device_id,
            method_name,
            rid: request_id(query)?,
        }),
        ["devices", device_id, "messages", "devicebound", ..] => Some(Inbound::CloudToDevice { device_id }),
        _ => None,
    }
}

/// Correlates QoS 1 publishes with their PUBACKs. Publishes enter the
/// client's request channel in `enqueue` order and leave the event loop as
/// `Outgoing::Publish(pkid)` in the same order. After a reconnect the event
/// loop replays unacknowledged publishes under their original pkid; those
/// keep their callback and consume nothing from the queue.
#[derive(Default)]
pub struct PublishTracker {
    queued: VecDeque<Option<StatusCallback>>,
    inflight: HashMap<u16, Option<StatusCallback>>,
}

impl PublishTracker {
    pub fn enqueue(&mut self, callback: Option<StatusCallback>) {
        self.queued.push_back(callback);
    }

    pub fn on_outgoing(&mut self, pkid: u16) {
        if self.inflight.contains_key(&pkid) {
            log::debug!("Retransmitting publish {}", pkid);
            return;
        }
        match self.queued.pop_front() {
            Some(callback) => {
                self.inflight.insert(pkid, callback);
            }
            None => log::warn!("Outgoing publish {} has no pending request", pkid),
        }
    }

    pub fn on_ack(&mut self, pkid: u16) -> Option<StatusCallback> {
        self.inflight.remove(&pkid).flatten()
    }

    pub fn drain(&mut self) -> Vec<StatusCallback> {
        self.queued
            .drain(..)
            .chain(self.inflight.drain().map(|(_, callback)| callback))
            .flatten()
            .collect()
    }
}

#[derive(Default)]
struct Handlers {
    methods: HashMap<String, MethodHandler>,
    messages: HashMap<String, MessageCallback>,
    status: HashMap<String, ConnectionStatusCallback>,
}

#[derive(Default)]
struct Shared {
    publishes: Mutex<PublishTracker>,
    twin_requests: TokioMutex<HashMap<String, StatusCallback>>,
    handlers: TokioRwLock<Handlers>,
    retry_policy: TokioRwLock<RetryPolicy>,
    next_rid: AtomicU64,
}

impl Shared {
    fn publish_tracked(
        &self,
        client: &AsyncClient,
        topic: String,
        payload: Vec<u8>,
        callback: Option<StatusCallback>,
    ) -> Result<(), Error> {
        let mut tracker = self
            .publishes
            .lock()
            .map_err(|_| Error::Communication("publish tracker lock poisoned".to_string()))?;
        client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| Error::Communication(format!("MQTT publish error: {}", e)))?;
        tracker.enqueue(callback);
        Ok(())
    }

    fn with_tracker<T>(&self, f: impl FnOnce(&mut PublishTracker) -> T) -> Option<T> {
        match self.publishes.lock() {
            Ok(mut tracker) => Some(f(&mut tracker)),
            Err(e) => {
                log::error!("Publish tracker lock poisoned: {}", e);
                None
            }
        }
    }

    async fn broadcast(&self, status: ConnectionStatus, reason: ConnectionStatusReason) {
        let callbacks: Vec<ConnectionStatusCallback> = self.handlers.read().await.status.values().cloned().collect();
        for callback in callbacks {
            callback(status, reason);
        }
    }

    /// Fails everything still waiting for the broker.
    async fn cancel_pending(&self) {
        let mut pending = self.with_tracker(PublishTracker::drain).unwrap_or_default();
        pending.extend(self.twin_requests.lock().await.drain().map(|(_, callback)| callback));
        for callback in pending {
            callback(IotHubStatusCode::MessageCancelledOnClose);
        }
    }

    async fn dispatch_publish(&self, client: &AsyncClient, topic: &str, payload: &[u8]) {
        match parse_topic(topic) {
            Some(Inbound::TwinResponse { device_id, status, rid }) => {
                match self.twin_requests.lock().await.remove(rid) {
                    Some(callback) => callback(IotHubStatusCode::from_http_status(status)),
                    None => log::warn!("{}: twin response for unknown request {}", device_id, rid),
                }
            }
            Some(Inbound::MethodRequest {
                device_id,
                method_name,
                rid,
            }) => {
                let handler = self.handlers.read().await.methods.get(device_id).cloned();
                let request = String::from_utf8_lossy(payload);
                let response = match handler {
                    Some(handler) => handler(method_name, &request),
                    None => DeviceMethodResponse {
                        status: crate::method::METHOD_NOT_DEFINED,
                        payload: format!("{} has no method handler", device_id),
                    },
                };
                let topic = method_response_topic(device_id, response.status, rid);
                if let Err(e) = self.publish_tracked(client, topic, response.payload.into_bytes(), None) {
                    log::error!("{}: failed to answer method {}: {}", device_id, method_name, e);
                }
            }
            Some(Inbound::CloudToDevice { device_id }) => {
                let message = serde_json::from_slice::<Message>(payload)
                    .unwrap_or_else(|_| Message::new(String::from_utf8_lossy(payload)));
                match self.handlers.read().await.messages.get(device_id) {
                    Some(callback) => {
                        let disposition = callback(message);
                        log::debug!("{} disposed cloud-to-device message as {:?}", device_id, disposition);
                    }
                    None => log::warn!("{}: cloud-to-device message without a callback", device_id),
                }
            }
            None => log::warn!("No handler for incoming message on topic: {}", topic),
        }
    }
}

async fn drive(
    mut event_loop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    devices: Vec<String>,
    connack_tx: oneshot::Sender<Result<(), String>>,
) {
    log::info!("MQTT event loop started for {} device(s).", devices.len());
    let mut connack_tx = Some(connack_tx);
    let mut connected = false;
    let mut attempt = 0u32;
    loop {
        match event_loop.poll().await {
            Ok(MqttEvent::Incoming(Packet::ConnAck(ack))) => {
                log::info!("MQTT Connected: {:?}", ack);
                attempt = 0;
                for topic in devices.iter().flat_map(|d| device_subscriptions(d)) {
                    if let Err(e) = client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
                        log::error!("MQTT subscribe to {} failed: {}", topic, e);
                    }
                }
                if let Some(tx) = connack_tx.take() {
                    let _ = tx.send(Ok(()));
                }
                if !connected {
                    connected = true;
                    shared
                        .broadcast(ConnectionStatus::Connected, ConnectionStatusReason::ConnectionOk)
                        .await;
                }
            }
            Ok(MqttEvent::Incoming(Packet::PubAck(ack))) => {
                if let Some(callback) = shared.with_tracker(|t| t.on_ack(ack.pkid)).flatten() {
                    callback(IotHubStatusCode::OkEmpty);
                }
            }
            Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                log::debug!(
                    "Received MQTT Message: Topic: {}, Payload Len: {}",
                    publish.topic,
                    publish.payload.len()
                );
                shared.dispatch_publish(&client, &publish.topic, &publish.payload).await;
            }
            Ok(MqttEvent::Incoming(packet)) => {
                log::debug!("Received other MQTT Packet: {:?}", packet);
            }
            Ok(MqttEvent::Outgoing(Outgoing::Publish(pkid))) => {
                shared.with_tracker(|t| t.on_outgoing(pkid));
            }
            Ok(MqttEvent::Outgoing(_)) => {}
            Err(e) => {
                if let Some(tx) = connack_tx.take() {
                    let _ = tx.send(Err(e.to_string()));
                    return;
                }
                log::error!("MQTT Event loop error: {}", e);
                if connected {
                    connected = false;
                    shared
                        .broadcast(ConnectionStatus::DisconnectedRetrying, ConnectionStatusReason::CommunicationError)
                        .await;
                }
                let policy = shared.retry_policy.read().await.clone();
                match policy.delay_for(attempt) {
                    Some(delay) => {
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        log::warn!("MQTT retry policy exhausted after {} attempt(s)", attempt);
                        shared
                            .broadcast(ConnectionStatus::Disconnected, ConnectionStatusReason::RetryExpired)
                            .await;
                        shared.cancel_pending().await;
                        return;
                    }
                }
            }
        }
    }
}

pub struct MqttDeviceTransport {
    client_handle: Arc<TokioRwLock<Option<AsyncClient>>>,
    event_loop_task: Arc<TokioRwLock<Option<tokio::task::JoinHandle<()>>>>,
    mqtt_options: MqttOptions,
    connect_timeout: Duration,
    devices: TokioRwLock<HashMap<String, DeviceIdentity>>,
    shared: Arc<Shared>,
}

impl fmt::Debug for MqttDeviceTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttDeviceTransport")
            .field("client_id", &self.mqtt_options.client_id())
            .field("broker", &self.mqtt_options.broker_address())
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl MqttDeviceTransport {
    pub fn new(client_id_prefix: &str, host: &str, port: u16) -> Self {
        let client_id = format!("{}-{}", client_id_prefix, uuid::Uuid::new_v4());
        let mut mqtt_options = MqttOptions::new(client_id, host, port);
        mqtt_options.set_keep_alive(DEFAULT_KEEP_ALIVE);
        Self {
            client_handle: Arc::new(TokioRwLock::new(None)),
            event_loop_task: Arc::new(TokioRwLock::new(None)),
            mqtt_options,
            connect_timeout: crate::METHOD_CONNECT_TIMEOUT,
            devices: TokioRwLock::new(HashMap::new()),
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn check_registered(&self, device_id: &str) -> Result<(), Error> {
        if self.devices.read().await.contains_key(device_id) {
            Ok(())
        } else {
            Err(Error::UnknownDevice(device_id.to_string()))
        }
    }

    async fn publish(
        &self,
        device_id: &str,
        topic: String,
        payload: Vec<u8>,
        callback: Option<StatusCallback>,
    ) -> Result<(), Error> {
        self.check_registered(device_id).await?;
        let client_guard = self.client_handle.read().await;
        let client = client_guard.as_ref().ok_or(Error::NotConnected)?;
        self.shared.publish_tracked(client, topic, payload, callback)
    }
}

#[async_trait]
impl DeviceTransport for MqttDeviceTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
    }

    async fn register(&self, identity: &DeviceIdentity) -> Result<(), Error> {
        if self.client_handle.read().await.is_some() {
            return Err(Error::InvalidParameter {
                context: format!("register {}", identity.device_id),
                reason: "transport is already open".to_string(),
            });
        }
        self.devices
            .write()
            .await
            .insert(identity.device_id.clone(), identity.clone());
        Ok(())
    }

    async fn open(&self) -> Result<(), Error> {
        let mut client_handle_guard = self.client_handle.write().await;
        let mut task_guard = self.event_loop_task.write().await;
        if client_handle_guard.is_some() || task_guard.is_some() {
            log::warn!("Already connected or event loop task running.");
            return Ok(());
        }
        let (client, event_loop) = AsyncClient::new(self.mqtt_options.clone(), REQUEST_CHANNEL_CAPACITY);
        let devices: Vec<String> = self.devices.read().await.keys().cloned().collect();
        let (connack_tx, connack_rx) = oneshot::channel();
        let (host, port) = self.mqtt_options.broker_address();
        log::info!("MQTT client created. Attempting to connect to {}:{}", host, port);
        let task = tokio::spawn(drive(
            event_loop,
            client.clone(),
            Arc::clone(&self.shared),
            devices,
            connack_tx,
        ));

        let outcome = match tokio::time::timeout(self.connect_timeout, connack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(details))) => Err(details),
            Ok(Err(_)) => Err("event loop ended before CONNACK".to_string()),
            Err(_) => Err(format!("no CONNACK within {:?}", self.connect_timeout)),
        };
        match outcome {
            Ok(()) => {
                *client_handle_guard = Some(client);
                *task_guard = Some(task);
                Ok(())
            }
            Err(details) => {
                task.abort();
                Err(Error::Communication(format!("MQTT connect to {}:{} failed: {}", host, port, details)))
            }
        }
    }

    async fn close(&self) -> Result<(), Error> {
        let mut client_handle_guard = self.client_handle.write().await;
        let mut task_guard = self.event_loop_task.write().await;
        let was_open = client_handle_guard.is_some();
        if let Some(client) = client_handle_guard.take() {
            if let Err(e) = client.disconnect().await {
                log::error!("MQTT client disconnect error: {}", e);
            } else {
                log::info!("MQTT client disconnected.");
            }
        } else {
            log::warn!("Close called but client was not present.");
        }
        if let Some(task) = task_guard.take() {
            task.abort();
        }
        self.shared.cancel_pending().await;
        if was_open {
            self.shared
                .broadcast(ConnectionStatus::Disconnected, ConnectionStatusReason::ClientClose)
                .await;
        }
        Ok(())
    }

    async fn set_retry_policy(&self, policy: RetryPolicy) -> Result<(), Error> {
        *self.shared.retry_policy.write().await = policy;
        Ok(())
    }

    async fn send_event_async(&self, device_id: &str, message: Message, callback: StatusCallback) -> Result<(), Error> {
        let payload = serde_json::to_vec(&message)?;
        self.publish(device_id, telemetry_topic(device_id), payload, Some(callback))
            .await
    }

    async fn on_connection_status(&self, device_id: &str, callback: ConnectionStatusCallback) -> Result<(), Error> {
        self.check_registered(device_id).await?;
        self.shared
            .handlers
            .write()
            .await
            .status
            .insert(device_id.to_string(), callback);
        Ok(())
    }

    async fn send_reported_properties(
        &self,
        device_id: &str,
        properties: BTreeMap<String, Value>,
        callback: StatusCallback,
    ) -> Result<(), Error> {
        let rid = self.shared.next_rid.fetch_add(1, Ordering::Relaxed).to_string();
        let payload = serde_json::to_vec(&properties)?;
        self.shared.twin_requests.lock().await.insert(rid.clone(), callback);
        let published = self
            .publish(device_id, reported_patch_topic(device_id, &rid), payload, None)
            .await;
        if published.is_err() {
            self.shared.twin_requests.lock().await.remove(&rid);
        }
        published
    }

    async fn subscribe_to_methods(&self, device_id: &str, handler: MethodHandler) -> Result<(), Error> {
        self.check_registered(device_id).await?;
        self.shared
            .handlers
            .write()
            .await
            .methods
            .insert(device_id.to_string(), handler);
        Ok(())
    }

    async fn set_message_callback(&self, device_id: &str, callback: MessageCallback) -> Result<(), Error> {
        self.check_registered(device_id).await?;
        self.shared
            .handlers
            .write()
            .await
            .messages
            .insert(device_id.to_string(), callback);
        Ok(())
    }

    async fn upload_to_blob_async(
        &self,
        _device_id: &str,
        _blob_name: String,
        _data: Vec<u8>,
        _callback: StatusCallback,
    ) -> Result<(), Error> {
        Err(Error::Unsupported("blob upload over MQTT".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn parses_device_topics() {
        assert_eq!(
            parse_topic("devices/dev-1/twin/res/204/?$rid=7"),
            Some(Inbound::TwinResponse {
                device_id: "dev-1",
                status: 204,
                rid: "7"
            })
        );
        assert_eq!(
            parse_topic("devices/dev-1/methods/POST/methodName/?$rid=abc&x=1"),
            Some(Inbound::MethodRequest {
                device_id: "dev-1",
                method_name: "methodName",
                rid: "abc"
            })
        );
        assert_eq!(
            parse_topic("devices/dev-1/messages/devicebound/%24.mid=5678"),
            Some(Inbound::CloudToDevice { device_id: "dev-1" })
        );
        assert_eq!(parse_topic("devices/dev-1/twin/res/notanumber/?$rid=7"), None);
        assert_eq!(parse_topic("unrelated/topic"), None);
    }

    #[test]
    fn tracker_maps_packet_ids_in_publish_order() {
        let acked = Arc::new(AtomicUsize::new(0));
        let mut tracker = PublishTracker::default();
        for _ in 0..2 {
            let acked = Arc::clone(&acked);
            tracker.enqueue(Some(Box::new(move |status: IotHubStatusCode| {
                assert_eq!(status, IotHubStatusCode::OkEmpty);
                acked.fetch_add(1, Ordering::SeqCst);
            })));
        }
        tracker.enqueue(None);
        tracker.on_outgoing(11);
        tracker.on_outgoing(12);
        tracker.on_outgoing(13);

        assert!(tracker.on_ack(13).is_none());
        (tracker.on_ack(12).unwrap())(IotHubStatusCode::OkEmpty);
        (tracker.on_ack(11).unwrap())(IotHubStatusCode::OkEmpty);
        assert!(tracker.on_ack(11).is_none());
        assert_eq!(acked.load(Ordering::SeqCst), 2);
        assert!(tracker.drain().is_empty());
    }

    #[test]
    fn replayed_publish_keeps_its_callback() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let mut tracker = PublishTracker::default();
        let callback = |name: &'static str| -> Option<StatusCallback> {
            let fired = Arc::clone(&fired);
            Some(Box::new(move |_status: IotHubStatusCode| {
                fired.lock().unwrap().push(name);
            }))
        };

        tracker.enqueue(callback("first"));
        tracker.on_outgoing(1);
        tracker.enqueue(callback("second"));
        // Reconnect: pkid 1 goes out again before the queued publish.
        tracker.on_outgoing(1);
        tracker.on_outgoing(2);

        (tracker.on_ack(1).unwrap())(IotHubStatusCode::OkEmpty);
        assert_eq!(*fired.lock().unwrap(), vec!["first"]);
        (tracker.on_ack(2).unwrap())(IotHubStatusCode::OkEmpty);
        assert_eq!(*fired.lock().unwrap(), vec!["first", "second"]);
        assert!(tracker.drain().is_empty());
    }

    #[test]
    fn replayed_untracked_publish_is_not_reassigned() {
        let mut tracker = PublishTracker::default();
        tracker.enqueue(None);
        tracker.on_outgoing(5);
        tracker.enqueue(Some(Box::new(|_status: IotHubStatusCode| {})));
        tracker.on_outgoing(5);
        assert!(tracker.on_ack(5).is_none());
        assert_eq!(tracker.drain().len(), 1);
    }

    #[test]
    fn subscriptions_cover_twin_methods_and_c2d() {
        let topics = device_subscriptions("d");
        assert!(topics.iter().any(|t| t == "devices/d/twin/res/#"));
        assert!(topics.iter().any(|t| t == "devices/d/methods/POST/#"));
        assert!(topics.iter().any(|t| t == "devices/d/messages/devicebound/#"));
    }
}
