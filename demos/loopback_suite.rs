use iothub_e2e_rs::twin::TwinUpdate;
use iothub_e2e_rs::{
    logging, DeviceTransport, DeviceTwinView, ErrorInjectionDriver, FaultType, FileUploadVerifier, HarnessConfig,
    LoopbackHub, MethodInvocationVerifier, MultiplexCoordinator, Protocol, ReceiveVerifier, ServiceClient,
    TestScenario, TwinVerifier,
};
use std::sync::Arc;

// Runs every check of the harness against the in-process hub. Pass a JSON
// configuration file as the first argument to override the defaults.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    logging::init();

    let config = match std::env::args().nth(1) {
        Some(path) => HarnessConfig::from_file(&path)?,
        None => HarnessConfig::default(),
    };
    let run_id = uuid::Uuid::new_v4();
    let identities = config.identities(&run_id);
    log::info!("Starting loopback suite {} with {} device(s)", run_id, identities.len());

    let hub = LoopbackHub::new();
    let service: Arc<dyn ServiceClient> = Arc::new(hub.clone());

    // Telemetry over one multiplexed connection.
    let coordinator = MultiplexCoordinator::new(
        hub.transport(Protocol::Amqps),
        identities.clone(),
        config.multiplex_config(),
    )?;
    let report = coordinator.run().await?.into_result()?;
    log::info!(
        "Multiplex run: {} message(s) acknowledged in {:?}",
        report.acknowledged_total(),
        report.elapsed
    );
    tokio::time::sleep(config.messaging.guard_delay).await;

    // The remaining checks share a second connection.
    let transport = hub.transport(Protocol::Amqps);
    let scenarios: Vec<TestScenario> = identities
        .iter()
        .cloned()
        .map(|identity| TestScenario::new(Protocol::Amqps, identity))
        .collect();
    for scenario in &scenarios {
        transport.register(&scenario.identity).await?;
    }
    transport.open().await?;

    let twin = TwinVerifier::new(transport.clone(), service.clone(), config.twin_sync_config());
    let mut targets: Vec<(TestScenario, DeviceTwinView)> = scenarios
        .iter()
        .map(|s| (s.clone(), DeviceTwinView::new(s.device_id())))
        .collect();
    twin.verify_devices(&mut targets, TwinUpdate::NewProperties(config.twin.properties_to_test))
        .await?;
    twin.verify_devices(&mut targets, TwinUpdate::UpdateAll).await?;

    let methods = MethodInvocationVerifier::new(transport.clone(), service.clone(), config.method_config());
    methods.subscribe_all(&scenarios).await?;
    methods.invoke_on_all(&scenarios).await?;

    let receive = ReceiveVerifier::new(transport.clone(), service.clone(), config.receive_config());
    for scenario in &scenarios {
        receive.send_and_verify(scenario).await?;
    }

    let uploads = FileUploadVerifier::new(transport.clone(), service.clone(), config.file_upload_config());
    let notifications = uploads.upload_and_verify(&scenarios).await?;
    log::info!("{} upload notification(s) matched", notifications.len());

    let driver = ErrorInjectionDriver::new(transport.clone(), scenarios[0].clone(), config.error_injection_config());
    let recovery = driver.run(FaultType::KillAmqpConnection, config.retry_policy()).await?;
    log::info!(
        "{} recovered as {:?} after {:?}",
        recovery.fault,
        recovery.expectation,
        recovery.settled_after
    );

    if let Err(e) = transport.close().await {
        logging::log_teardown_failure("closing transport", &e);
    }
    for scenario in &scenarios {
        if let Err(e) = service.remove_device(scenario.device_id()).await {
            logging::log_teardown_failure("removing device", &e);
        }
    }
    log::info!("Loopback suite {} passed", run_id);
    Ok(())
}
