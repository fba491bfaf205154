//! Device method invocation across the devices of a shared transport.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::scenario::TestScenario;
use crate::transport::{DeviceMethodResponse, DeviceTransport, MethodHandler, MethodResult, ServiceClient};

pub const METHOD_NAME: &str = "methodName";
pub const METHOD_PAYLOAD: &str = "This is a good payload";
pub const METHOD_SUCCESS: u16 = 200;
pub const METHOD_NOT_DEFINED: u16 = 404;

/// Answers [`METHOD_NAME`] with 200 and any other method with 404, echoing
/// `"{method}:{payload}"` either way.
pub fn sample_method_handler() -> MethodHandler {
    Arc::new(|method_name: &str, payload: &str| {
        let status = if method_name == METHOD_NAME {
            METHOD_SUCCESS
        } else {
            METHOD_NOT_DEFINED
        };
        DeviceMethodResponse {
            status,
            payload: expected_payload(method_name, payload),
        }
    })
}

pub fn expected_payload(method_name: &str, payload: &str) -> String {
    format!("{}:{}", method_name, payload)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodConfig {
    #[serde(with = "crate::transport::millis")]
    pub response_timeout: Duration,
    #[serde(with = "crate::transport::millis")]
    pub connect_timeout: Duration,
}

impl Default for MethodConfig {
    fn default() -> Self {
        Self {
            response_timeout: crate::METHOD_RESPONSE_TIMEOUT,
            connect_timeout: crate::METHOD_CONNECT_TIMEOUT,
        }
    }
}

#[derive(Debug)]
pub struct MethodInvocationVerifier {
    transport: Arc<dyn DeviceTransport>,
    service: Arc<dyn ServiceClient>,
    config: MethodConfig,
}

impl MethodInvocationVerifier {
    pub fn new(transport: Arc<dyn DeviceTransport>, service: Arc<dyn ServiceClient>, config: MethodConfig) -> Self {
        Self {
            transport,
            service,
            config,
        }
    }

    /// Subscribes every device to [`sample_method_handler`].
    pub async fn subscribe_all(&self, scenarios: &[TestScenario]) -> Result<(), Error> {
        for scenario in scenarios {
            if !scenario.protocol.supports_persistent_channels() {
                return Err(Error::Unsupported(format!("{} has no method channel", scenario.protocol)));
            }
            self.transport
                .subscribe_to_methods(scenario.device_id(), sample_method_handler())
                .await?;
        }
        Ok(())
    }

    /// Invokes [`METHOD_NAME`] on one device and checks status and echo.
    pub async fn invoke_and_check(&self, scenario: &TestScenario) -> Result<MethodResult, Error> {
        let device_id = scenario.device_id();
        let result = self
            .service
            .invoke_method(
                device_id,
                METHOD_NAME,
                self.config.response_timeout,
                self.config.connect_timeout,
                METHOD_PAYLOAD,
            )
            .await
            .map_err(|e| Error::MethodInvocationFailed {
                context: scenario.correlation(),
                details: format!("invocation raised: {}", e),
            })?;

        if result.status != METHOD_SUCCESS {
            return Err(Error::MethodInvocationFailed {
                context: scenario.correlation(),
                details: format!("expected status {} but got {}", METHOD_SUCCESS, result.status),
            });
        }
        let expected = expected_payload(METHOD_NAME, METHOD_PAYLOAD);
        if result.payload != expected {
            return Err(Error::MethodInvocationFailed {
                context: scenario.correlation(),
                details: format!("expected payload '{}' but got '{}'", expected, result.payload),
            });
        }
        log::info!("{}: method {} returned {}", device_id, METHOD_NAME, result.status);
        Ok(result)
    }

    /// Invokes the method on every device concurrently. Every invocation runs
    /// to completion; the first failure is returned.
    pub async fn invoke_on_all(&self, scenarios: &[TestScenario]) -> Result<Vec<MethodResult>, Error> {
        let results =
            futures::future::join_all(scenarios.iter().map(|scenario| self.invoke_and_check(scenario))).await;
        let mut ok = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(r) => ok.push(r),
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(e) => log::error!("Additional method failure: {}", e),
            }
        }
        first_error.map_or(Ok(ok), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_handler_echoes_and_rejects_unknown_methods() {
        let handler = sample_method_handler();
        let ok = handler(METHOD_NAME, METHOD_PAYLOAD);
        assert_eq!(ok.status, 200);
        assert_eq!(ok.payload, "methodName:This is a good payload");
        assert_eq!(handler("reboot", "{}").status, 404);
    }
}
