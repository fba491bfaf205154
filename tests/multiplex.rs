use async_trait::async_trait;
use iothub_e2e_rs::transport::{
    ConnectionStatusCallback, MessageCallback, MethodHandler, StatusCallback,
};
use iothub_e2e_rs::*;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tokio::time::Duration;

fn identities(count: usize) -> Vec<DeviceIdentity> {
    let run_id = uuid::Uuid::new_v4();
    (0..count)
        .map(|i| DeviceIdentity::generate("e2e-multiplex-", i, &run_id))
        .collect()
}

fn fast_config() -> MultiplexConfig {
    MultiplexConfig {
        worker: WorkerParams {
            send_timeout: Duration::from_secs(2),
            ..WorkerParams::default()
        },
        open_retry: OpenRetry {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        },
        ..MultiplexConfig::default()
    }
}

/// Records every call and lets individual operations be failed on demand.
#[derive(Default)]
pub struct RecordingTransport {
    registered: TokioMutex<Vec<String>>,
    sends: TokioMutex<Vec<(String, Message)>>,
    open_calls: TokioMutex<usize>,
    close_calls: TokioMutex<usize>,
    open_error: TokioMutex<Option<String>>,
    reject_sends: TokioMutex<bool>,
}

impl fmt::Debug for RecordingTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingTransport").finish_non_exhaustive()
    }
}

impl RecordingTransport {
    pub fn new() -> Self {
        Default::default()
    }

    pub async fn set_open_should_fail(&self, details: Option<&str>) {
        *self.open_error.lock().await = details.map(str::to_string);
    }

    pub async fn set_reject_sends(&self, reject: bool) {
        *self.reject_sends.lock().await = reject;
    }

    pub async fn get_sends(&self) -> Vec<(String, Message)> {
        self.sends.lock().await.clone()
    }

    pub async fn open_calls(&self) -> usize {
        *self.open_calls.lock().await
    }

    pub async fn close_calls(&self) -> usize {
        *self.close_calls.lock().await
    }
}

#[async_trait]
impl DeviceTransport for RecordingTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Amqps
    }

    async fn register(&self, identity: &DeviceIdentity) -> Result<(), Error> {
        self.registered.lock().await.push(identity.device_id.clone());
        Ok(())
    }

    async fn open(&self) -> Result<(), Error> {
        *self.open_calls.lock().await += 1;
        match self.open_error.lock().await.clone() {
            Some(details) => Err(Error::Communication(details)),
            None => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), Error> {
        *self.close_calls.lock().await += 1;
        Ok(())
    }

    async fn set_retry_policy(&self, _policy: RetryPolicy) -> Result<(), Error> {
        Ok(())
    }

    async fn send_event_async(&self, device_id: &str, message: Message, callback: StatusCallback) -> Result<(), Error> {
        if *self.reject_sends.lock().await {
            return Err(Error::Communication("send queue full".to_string()));
        }
        self.sends.lock().await.push((device_id.to_string(), message));
        callback(IotHubStatusCode::OkEmpty);
        Ok(())
    }

    async fn on_connection_status(&self, _device_id: &str, _callback: ConnectionStatusCallback) -> Result<(), Error> {
        Ok(())
    }

    async fn send_reported_properties(
        &self,
        _device_id: &str,
        _properties: BTreeMap<String, Value>,
        callback: StatusCallback,
    ) -> Result<(), Error> {
        callback(IotHubStatusCode::Ok);
        Ok(())
    }

    async fn subscribe_to_methods(&self, _device_id: &str, _handler: MethodHandler) -> Result<(), Error> {
        Ok(())
    }

    async fn set_message_callback(&self, _device_id: &str, _callback: MessageCallback) -> Result<(), Error> {
        Ok(())
    }

    async fn upload_to_blob_async(
        &self,
        _device_id: &str,
        _blob_name: String,
        _data: Vec<u8>,
        _callback: StatusCallback,
    ) -> Result<(), Error> {
        Err(Error::Unsupported("blob upload".to_string()))
    }
}

#[tokio::test(start_paused = true)]
async fn every_device_gets_every_message_acknowledged() {
    iothub_e2e_rs::logging::init_for_tests();
    let hub = LoopbackHub::new();
    hub.set_ack_delay(Duration::from_millis(50)).await;
    let ids = identities(3);
    let coordinator = MultiplexCoordinator::new(hub.transport(Protocol::Amqps), ids.clone(), fast_config()).unwrap();
    assert_eq!(coordinator.device_count(), 3);

    let report = coordinator.run().await.unwrap();
    assert!(report.succeeded(), "failures: {:?}", report.failures);
    assert_eq!(report.open_attempts, 1);
    assert_eq!(report.acknowledged_total(), 9);
    assert_eq!(hub.accepted_total().await, 9);
    assert_eq!(hub.close_count().await, 1);

    for id in &ids {
        let worker = report.worker(&id.device_id).unwrap();
        assert_eq!(worker.acknowledged, 3);
        assert!(!worker.failed && !worker.cancelled);

        let accepted = hub.accepted_messages(&id.device_id).await;
        let sequence: Vec<&str> = accepted
            .iter()
            .map(|m| m.property(worker::MESSAGE_COUNT_PROPERTY).unwrap())
            .collect();
        assert_eq!(sequence, ["0", "1", "2"]);
        assert!(accepted.iter().all(|m| m.properties.len() == 11));
        assert!(accepted.iter().all(|m| m.body.contains(&id.device_id)));
    }
}

#[tokio::test(start_paused = true)]
async fn revoked_device_fails_run_and_others_stop_early() {
    let hub = LoopbackHub::new();
    hub.set_ack_delay(Duration::from_millis(100)).await;
    let ids = identities(3);
    hub.provision(&ids[1]).await;
    hub.revoke_device(&ids[1].device_id).await.unwrap();

    let coordinator = MultiplexCoordinator::new(hub.transport(Protocol::AmqpsWs), ids.clone(), fast_config()).unwrap();
    let report = coordinator.run().await.unwrap();

    assert!(!report.succeeded());
    assert_eq!(report.failures.len(), 1);
    let failure = &report.failures[0];
    assert_eq!(failure.device_id, ids[1].device_id);
    match &failure.error {
        Error::UnexpectedStatusCode { expected, actual, context } => {
            assert_eq!(*expected, IotHubStatusCode::OkEmpty);
            assert_eq!(*actual, IotHubStatusCode::Unauthorized);
            assert_eq!(context.device_id, ids[1].device_id);
            assert_eq!(context.sequence, Some(0));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    for id in [&ids[0], &ids[2]] {
        let worker = report.worker(&id.device_id).unwrap();
        assert!(!worker.failed);
        assert!(worker.acknowledged < 3);
    }
    assert_eq!(hub.close_count().await, 1);
    assert!(matches!(report.into_result(), Err(Error::UnexpectedStatusCode { .. })));
}

#[tokio::test(start_paused = true)]
async fn credentials_revoked_mid_run_fail_only_that_device() {
    let hub = LoopbackHub::new();
    hub.set_ack_delay(Duration::from_millis(200)).await;
    let ids = identities(3);
    for id in &ids {
        hub.provision(id).await;
    }
    {
        let hub = hub.clone();
        let device_id = ids[1].device_id.clone();
        // Lands after the first acknowledgement, before the last send.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            hub.revoke_device(&device_id).await.unwrap();
        });
    }

    let report = MultiplexCoordinator::new(hub.transport(Protocol::Amqps), ids.clone(), fast_config())
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(report.failures.len(), 1);
    let failure = &report.failures[0];
    assert_eq!(failure.device_id, ids[1].device_id);
    match &failure.error {
        Error::UnexpectedStatusCode { actual, context, .. } => {
            assert_eq!(*actual, IotHubStatusCode::Unauthorized);
            assert!(context.sequence > Some(0), "failed at {:?}", context.sequence);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    let revoked = report.worker(&ids[1].device_id).unwrap();
    assert!(revoked.failed);
    assert!(revoked.acknowledged >= 1);
    for id in [&ids[0], &ids[2]] {
        assert!(!report.worker(&id.device_id).unwrap().failed);
    }
    assert_eq!(hub.close_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn wrong_status_code_is_reported_with_sequence() {
    let hub = LoopbackHub::new();
    let ids = identities(2);
    for id in &ids {
        hub.provision(id).await;
    }
    hub.force_status(&ids[0].device_id, Some(IotHubStatusCode::ServerBusy))
        .await
        .unwrap();

    let report = MultiplexCoordinator::new(hub.transport(Protocol::Amqps), ids.clone(), fast_config())
        .unwrap()
        .run()
        .await
        .unwrap();
    let failure = report.failures.iter().find(|f| f.device_id == ids[0].device_id).unwrap();
    assert!(matches!(
        failure.error,
        Error::UnexpectedStatusCode {
            actual: IotHubStatusCode::ServerBusy,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn dropped_acknowledgements_time_out() {
    let hub = LoopbackHub::new();
    hub.set_drop_acks(true).await;
    let report = MultiplexCoordinator::new(hub.transport(Protocol::Amqps), identities(2), fast_config())
        .unwrap()
        .run()
        .await
        .unwrap();

    assert!(!report.failures.is_empty());
    for failure in &report.failures {
        match &failure.error {
            Error::AcknowledgementTimeout { timeout, expected, .. } => {
                assert_eq!(*timeout, Duration::from_secs(2));
                assert_eq!(*expected, IotHubStatusCode::OkEmpty);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
    assert_eq!(report.acknowledged_total(), 0);
    assert_eq!(hub.close_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn open_retry_exhaustion_is_fatal_and_still_closes() {
    let hub = LoopbackHub::new();
    hub.fail_next_opens(10).await;
    let result = MultiplexCoordinator::new(hub.transport(Protocol::Amqps), identities(3), fast_config())
        .unwrap()
        .run()
        .await;

    match result {
        Err(Error::TransportOpenFailure { attempts, protocol, details }) => {
            assert_eq!(attempts, 3);
            assert_eq!(protocol, Protocol::Amqps.to_string());
            assert!(details.contains("loopback open refused"));
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(hub.open_count().await, 3);
    assert_eq!(hub.close_count().await, 1);
    assert_eq!(hub.accepted_total().await, 0);
}

#[tokio::test(start_paused = true)]
async fn transient_open_failures_are_retried() {
    let hub = LoopbackHub::new();
    hub.fail_next_opens(2).await;
    let report = MultiplexCoordinator::new(hub.transport(Protocol::Amqps), identities(1), fast_config())
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(report.open_attempts, 3);
    assert!(report.succeeded());
}

#[tokio::test(start_paused = true)]
async fn global_timeout_cancels_slow_workers() {
    let hub = LoopbackHub::new();
    hub.set_ack_delay(Duration::from_secs(30)).await;
    let config = MultiplexConfig {
        worker: WorkerParams {
            send_timeout: Duration::from_secs(60),
            ..WorkerParams::default()
        },
        multiplex_timeout: Duration::from_secs(1),
        ..fast_config()
    };
    let report = MultiplexCoordinator::new(hub.transport(Protocol::Amqps), identities(3), config)
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert!(matches!(
        report.failures[0].error,
        Error::MultiplexTimeout { remaining: 3, .. }
    ));
    assert_eq!(report.workers.len(), 3);
    assert!(report.workers.iter().all(|w| w.cancelled && !w.failed));
    assert!(report.elapsed < Duration::from_secs(30));
}

#[tokio::test]
async fn rejected_send_fails_the_worker() {
    let transport = Arc::new(RecordingTransport::new());
    transport.set_reject_sends(true).await;
    let report = MultiplexCoordinator::new(transport.clone(), identities(2), fast_config())
        .unwrap()
        .run()
        .await
        .unwrap();

    assert!(!report.failures.is_empty());
    assert!(report
        .failures
        .iter()
        .all(|f| matches!(&f.error, Error::Communication(details) if details.contains("send queue full"))));
    assert!(transport.get_sends().await.is_empty());
    assert_eq!(transport.close_calls().await, 1);
}

#[tokio::test]
async fn recording_transport_sees_one_registration_per_device() {
    let transport = Arc::new(RecordingTransport::new());
    let ids = identities(3);
    let report = MultiplexCoordinator::new(transport.clone(), ids.clone(), fast_config())
        .unwrap()
        .run()
        .await
        .unwrap();
    assert!(report.succeeded());
    assert_eq!(*transport.registered.lock().await, ids.iter().map(|i| i.device_id.clone()).collect::<Vec<_>>());
    assert_eq!(transport.get_sends().await.len(), 9);
    assert_eq!(transport.open_calls().await, 1);
    assert_eq!(transport.close_calls().await, 1);
}

#[tokio::test]
async fn open_failure_from_recording_transport_carries_last_error() {
    let transport = Arc::new(RecordingTransport::new());
    transport.set_open_should_fail(Some("link refused")).await;
    let config = MultiplexConfig {
        open_retry: OpenRetry {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        },
        ..fast_config()
    };
    let result = MultiplexCoordinator::new(transport.clone(), identities(1), config)
        .unwrap()
        .run()
        .await;
    assert!(matches!(result, Err(Error::TransportOpenFailure { attempts: 2, ref details, .. }) if details.contains("link refused")));
    assert_eq!(transport.open_calls().await, 2);
    assert_eq!(transport.close_calls().await, 1);
}

#[test]
fn coordinator_rejects_non_multiplexing_protocols_and_duplicates() {
    let hub = LoopbackHub::new();
    assert!(matches!(
        MultiplexCoordinator::new(hub.transport(Protocol::Mqtt), identities(2), MultiplexConfig::default()),
        Err(Error::InvalidParameter { .. })
    ));
    let duplicate = DeviceIdentity::with_symmetric_key("same", "k");
    assert!(matches!(
        MultiplexCoordinator::new(
            hub.transport(Protocol::Amqps),
            vec![duplicate.clone(), duplicate],
            MultiplexConfig::default()
        ),
        Err(Error::InvalidParameter { .. })
    ));
    assert!(matches!(
        MultiplexCoordinator::new(hub.transport(Protocol::Amqps), Vec::new(), MultiplexConfig::default()),
        Err(Error::InvalidParameter { .. })
    ));
}
