use iothub_e2e_rs::method::sample_method_handler;
use iothub_e2e_rs::worker::send_messages;
use iothub_e2e_rs::{
    open_with_retry, CancelFlag, ConnectionStatusRecorder, DeviceIdentity, DeviceTransport, HarnessConfig,
    MqttDeviceTransport, Protocol, TestScenario,
};
use std::sync::Arc;

// Configuration - consider using environment variables or a config file for real applications
const BROKER_HOST: &str = "localhost";
const BROKER_PORT: u16 = 1883;
const DEVICE_ID_PREFIX: &str = "e2e-mqtt-";

// Sends the standard telemetry series for one device through a plain MQTT
// broker and answers device methods until the series is done.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = HarnessConfig::default();
    let identity = DeviceIdentity::generate(DEVICE_ID_PREFIX, 0, &uuid::Uuid::new_v4());
    let scenario = TestScenario::new(Protocol::Mqtt, identity);
    log::info!("Starting MQTT device {} against {}:{}", scenario.device_id(), BROKER_HOST, BROKER_PORT);

    let transport = Arc::new(
        MqttDeviceTransport::new(DEVICE_ID_PREFIX, BROKER_HOST, BROKER_PORT)
            .with_connect_timeout(config.methods.connect_timeout),
    );
    transport.register(&scenario.identity).await?;
    transport.set_retry_policy(config.retry_policy()).await?;

    let recorder = Arc::new(ConnectionStatusRecorder::new());
    transport
        .on_connection_status(scenario.device_id(), recorder.callback())
        .await?;
    transport
        .subscribe_to_methods(scenario.device_id(), sample_method_handler())
        .await?;

    open_with_retry(transport.as_ref(), &config.open_retry).await.map_err(|e| {
        log::error!("Failed to open MQTT transport: {:?}", e);
        anyhow::anyhow!("MQTT transport open failed: {}", e)
    })?;

    let result = send_messages(
        transport.as_ref(),
        &scenario,
        &config.worker_params(),
        &CancelFlag::new(),
        |sequence| log::info!("Message {} acknowledged by broker", sequence),
    )
    .await;

    transport.close().await?;
    log::info!("Connection status history: {}", recorder.render());
    result?;
    log::info!("All messages for {} acknowledged", scenario.device_id());
    Ok(())
}
