//! Harness configuration.
//!
//! Every section and field has a default, so a JSON document only needs to
//! name what it overrides:
//!
//! ```json
//! { "multiplex": { "device_count": 5 }, "twin": { "propagation_window": 10000 } }
//! ```
//!
//! Durations are given in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::c2d::ReceiveConfig;
use crate::coordinator::{MultiplexConfig, OpenRetry};
use crate::error::Error;
use crate::error_injection::ErrorInjectionConfig;
use crate::file_upload::FileUploadConfig;
use crate::method::MethodConfig;
use crate::scenario::DeviceIdentity;
use crate::transport::RetryPolicy;
use crate::twin::TwinSyncConfig;
use crate::worker::WorkerParams;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexSection {
    /// N: device identities sharing the transport.
    pub device_count: usize,
    pub device_id_prefix: String,
    #[serde(flatten)]
    pub worker: WorkerParams,
    #[serde(with = "crate::transport::millis")]
    pub multiplex_timeout: Duration,
    #[serde(with = "crate::transport::millis")]
    pub drain_timeout: Duration,
}

impl Default for MultiplexSection {
    fn default() -> Self {
        let defaults = MultiplexConfig::default();
        Self {
            device_count: crate::MAX_DEVICE_MULTIPLEX,
            device_id_prefix: "e2e-multiplex-".to_string(),
            worker: defaults.worker,
            multiplex_timeout: defaults.multiplex_timeout,
            drain_timeout: defaults.drain_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwinSection {
    /// M: reported properties pushed per twin test.
    pub properties_to_test: usize,
    #[serde(flatten)]
    pub sync: TwinSyncConfig,
}

impl Default for TwinSection {
    fn default() -> Self {
        Self {
            properties_to_test: crate::TWIN_PROPERTIES_TO_TEST,
            sync: TwinSyncConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorInjectionSection {
    #[serde(flatten)]
    pub driver: ErrorInjectionConfig,
    pub retry_policy: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingSection {
    #[serde(flatten)]
    pub receive: ReceiveConfig,
    /// Pause between consecutive tests against the same hub.
    #[serde(with = "crate::transport::millis")]
    pub guard_delay: Duration,
}

impl Default for MessagingSection {
    fn default() -> Self {
        Self {
            receive: ReceiveConfig::default(),
            guard_delay: crate::INTERTEST_GUARD_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub multiplex: MultiplexSection,
    pub open_retry: OpenRetry,
    pub twin: TwinSection,
    pub error_injection: ErrorInjectionSection,
    pub methods: MethodConfig,
    pub messaging: MessagingSection,
    pub file_upload: FileUploadConfig,
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::Config(reason.into())
}

fn check_interval(section: &str, interval: Duration, timeout: Duration) -> Result<(), Error> {
    if interval.is_zero() {
        return Err(invalid(format!("{}: poll interval must be non-zero", section)));
    }
    if interval > timeout {
        return Err(invalid(format!(
            "{}: poll interval {:?} exceeds timeout {:?}",
            section, interval, timeout
        )));
    }
    Ok(())
}

impl HarnessConfig {
    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        let config: HarnessConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&raw)?;
        log::info!("Loaded harness configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.multiplex.device_count == 0 {
            return Err(invalid("multiplex: device_count must be at least 1"));
        }
        if self.open_retry.max_attempts == 0 {
            return Err(invalid("open_retry: max_attempts must be at least 1"));
        }
        let worker = &self.multiplex.worker;
        check_interval("multiplex", worker.poll_interval, worker.send_timeout)?;
        check_interval("twin", self.twin.sync.poll_interval, self.twin.sync.propagation_window)?;
        let injection = &self.error_injection.driver;
        check_interval("error_injection", injection.poll_interval, injection.send_timeout)?;
        check_interval(
            "messaging",
            self.messaging.receive.poll_interval,
            self.messaging.receive.receive_timeout,
        )?;
        check_interval(
            "file_upload",
            self.file_upload.poll_interval,
            self.file_upload.upload_timeout,
        )?;
        Ok(())
    }

    /// Per-device send parameters of the multiplex section.
    pub fn worker_params(&self) -> WorkerParams {
        self.multiplex.worker
    }

    /// Builds the coordinator configuration.
    ///
    /// # Returns
    /// The multiplex section combined with the shared open-retry settings.
    pub fn multiplex_config(&self) -> MultiplexConfig {
        MultiplexConfig {
            worker: self.multiplex.worker,
            multiplex_timeout: self.multiplex.multiplex_timeout,
            open_retry: self.open_retry,
            drain_timeout: self.multiplex.drain_timeout,
        }
    }

    pub fn twin_sync_config(&self) -> TwinSyncConfig {
        self.twin.sync
    }

    pub fn error_injection_config(&self) -> ErrorInjectionConfig {
        self.error_injection.driver
    }

    /// Reconnection policy installed before a fault is injected.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.error_injection.retry_policy.clone()
    }

    pub fn method_config(&self) -> MethodConfig {
        self.methods
    }

    pub fn receive_config(&self) -> ReceiveConfig {
        self.messaging.receive
    }

    pub fn file_upload_config(&self) -> FileUploadConfig {
        self.file_upload
    }

    /// `device_count` fresh identities for one run.
    pub fn identities(&self, run_id: &uuid::Uuid) -> Vec<DeviceIdentity> {
        (0..self.multiplex.device_count)
            .map(|i| DeviceIdentity::generate(&self.multiplex.device_id_prefix, i, run_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_harness_constants() {
        let config = HarnessConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.multiplex.device_count, 3);
        assert_eq!(config.multiplex.worker.messages_per_device, 3);
        assert_eq!(config.multiplex.worker.keys_per_message, 10);
        assert_eq!(config.multiplex.multiplex_timeout, Duration::from_secs(300));
        assert_eq!(config.twin.sync.poll_interval, Duration::from_millis(500));
        assert_eq!(config.twin.sync.propagation_window, Duration::from_secs(5));
        assert_eq!(config.twin.properties_to_test, 3);
        assert_eq!(config.methods.response_timeout, Duration::from_secs(200));
        assert_eq!(config.methods.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.file_upload.flush_window, Duration::from_secs(10));
        assert_eq!(config.messaging.guard_delay, Duration::from_secs(2));
        assert_eq!(config.error_injection.driver.window.delay_secs, 1);
        assert_eq!(config.error_injection.driver.window.duration_secs, 5);
    }

    #[test]
    fn partial_document_overrides_only_named_fields() {
        let config = HarnessConfig::from_json_str(
            r#"{
                "multiplex": { "device_count": 5, "messages_per_device": 7 },
                "twin": { "propagation_window": 10000 },
                "error_injection": { "window": { "delay_secs": 5 }, "retry_policy": { "kind": "no_retry" } }
            }"#,
        )
        .unwrap();
        assert_eq!(config.multiplex.device_count, 5);
        assert_eq!(config.multiplex_config().worker.messages_per_device, 7);
        assert_eq!(config.multiplex.worker.keys_per_message, 10);
        assert_eq!(config.twin_sync_config().propagation_window, Duration::from_secs(10));
        assert_eq!(config.twin_sync_config().poll_interval, Duration::from_millis(500));
        assert_eq!(config.error_injection.driver.window.delay_secs, 5);
        assert_eq!(config.error_injection.driver.window.duration_secs, 5);
        assert_eq!(config.retry_policy(), RetryPolicy::NoRetry);
        assert_eq!(config.identities(&uuid::Uuid::new_v4()).len(), 5);
    }

    #[test]
    fn rejects_zero_devices_and_inverted_intervals() {
        assert!(matches!(
            HarnessConfig::from_json_str(r#"{ "multiplex": { "device_count": 0 } }"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            HarnessConfig::from_json_str(r#"{ "twin": { "poll_interval": 6000, "propagation_window": 5000 } }"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            HarnessConfig::from_json_str(r#"{ "multiplex": { "poll_interval": 0 } }"#),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn malformed_json_is_a_json_error() {
        assert!(matches!(HarnessConfig::from_json_str("{"), Err(Error::Json(_))));
    }

    #[test]
    fn extreme_backoff_stays_within_the_cap() {
        let config = HarnessConfig::from_json_str(
            r#"{
                "error_injection": {
                    "retry_policy": {
                        "kind": "exponential_backoff_with_jitter",
                        "max_retries": 100,
                        "min_backoff": 1,
                        "max_backoff": 10000,
                        "delta_backoff": 18446744073709551615
                    }
                }
            }"#,
        )
        .unwrap();
        let policy = config.retry_policy();
        assert_eq!(policy.delay_for(16), Some(Duration::from_secs(10)));
        assert_eq!(policy.delay_for(100), None);
    }
}
