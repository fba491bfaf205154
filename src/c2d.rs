//! Cloud-to-device receive verification.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::message::{Message, MessageDisposition};
use crate::poller::{BoundedPoller, CancelFlag, PollResult};
use crate::scenario::TestScenario;
use crate::signal::{Completion, CompletionSignal};
use crate::transport::{DeviceTransport, ServiceClient};

pub const EXPECTED_CORRELATION_ID: &str = "1234";
pub const EXPECTED_MESSAGE_ID: &str = "5678";

pub const MESSAGE_PROPERTIES: [(&str, &str); 3] = [("name1", "value1"), ("name2", "value2"), ("name3", "value3")];

/// The message the service sends in every receive test.
pub fn expected_message(scenario: &TestScenario) -> Message {
    let mut message = Message::new(format!("Cloud to device message for {}", scenario.device_id()))
        .with_correlation_id(EXPECTED_CORRELATION_ID)
        .with_message_id(EXPECTED_MESSAGE_ID);
    for (key, value) in MESSAGE_PROPERTIES {
        message.set_property(key, value);
    }
    message
}

pub fn has_expected_properties(message: &Message) -> bool {
    MESSAGE_PROPERTIES
        .iter()
        .all(|(key, value)| message.property(key) == Some(*value))
}

pub fn has_expected_system_properties(message: &Message) -> bool {
    message.correlation_id.as_deref() == Some(EXPECTED_CORRELATION_ID)
        && message.message_id.as_deref() == Some(EXPECTED_MESSAGE_ID)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveConfig {
    #[serde(with = "crate::transport::millis")]
    pub poll_interval: Duration,
    #[serde(with = "crate::transport::millis")]
    pub receive_timeout: Duration,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            poll_interval: crate::RETRY_INTERVAL,
            receive_timeout: crate::SEND_TIMEOUT,
        }
    }
}

#[derive(Debug)]
pub struct ReceiveVerifier {
    transport: Arc<dyn DeviceTransport>,
    service: Arc<dyn ServiceClient>,
    config: ReceiveConfig,
    cancel: CancelFlag,
}

impl ReceiveVerifier {
    pub fn new(transport: Arc<dyn DeviceTransport>, service: Arc<dyn ServiceClient>, config: ReceiveConfig) -> Self {
        Self {
            transport,
            service,
            config,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Installs a checking message callback, sends the expected message from
    /// the service and waits for the device to receive it.
    pub async fn send_and_verify(&self, scenario: &TestScenario) -> Result<(), Error> {
        let device_id = scenario.device_id();
        let signal = Arc::new(CompletionSignal::new());
        {
            let signal = Arc::clone(&signal);
            self.transport
                .set_message_callback(
                    device_id,
                    Arc::new(move |message: Message| {
                        let completion = if has_expected_properties(&message) && has_expected_system_properties(&message)
                        {
                            Completion::success()
                        } else {
                            log::warn!("Received message with unexpected properties: {:?}", message);
                            Completion::failure()
                        };
                        signal.signal(completion);
                        MessageDisposition::Complete
                    }),
                )
                .await?;
        }

        self.service.send_to_device(device_id, expected_message(scenario)).await?;

        let poller = BoundedPoller::new(self.config.poll_interval, self.config.receive_timeout);
        match poller.wait_for(&signal, &self.cancel).await {
            PollResult::Fired(completion) if completion.is_success() => {
                log::info!("{}: cloud-to-device message received over {}", device_id, scenario.protocol);
                Ok(())
            }
            PollResult::Fired(_) => Err(Error::MessageVerificationFailed {
                context: scenario.correlation(),
                details: "received message was missing expected properties".to_string(),
            }),
            PollResult::TimedOut => Err(Error::ReceiveTimeout {
                context: scenario.correlation(),
                timeout: self.config.receive_timeout,
            }),
            PollResult::Cancelled => Err(Error::Cancelled {
                context: scenario.correlation(),
            }),
        }
    }
}
