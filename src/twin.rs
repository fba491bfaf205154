//! Reported-property synchronisation between a device and the service view
//! of its twin.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::Error;
use crate::message::IotHubStatusCode;
use crate::poller::{BoundedPoller, CancelFlag, PollResult, Polled};
use crate::scenario::TestScenario;
use crate::signal::{OperationKind, PendingOperation};
use crate::transport::{DeviceTransport, ServiceClient, TwinSnapshot};

pub const PROPERTY_KEY: &str = "Key";
pub const PROPERTY_VALUE: &str = "Value";
pub const PROPERTY_VALUE_UPDATE: &str = "Update";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinUpdate {
    /// Push this many newly named properties.
    NewProperties(usize),
    /// Give every existing reported property a new random value.
    UpdateAll,
    /// Give the existing property at this position (key order) a new value.
    UpdateOne(usize),
}

/// Device-side mirror of the reported properties. Keys are unique; the last
/// write wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceTwinView {
    device_id: String,
    reported: BTreeMap<String, Value>,
}

fn unique_suffix() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl DeviceTwinView {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            reported: BTreeMap::new(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn reported(&self) -> &BTreeMap<String, Value> {
        &self.reported
    }

    pub fn create_new_reported_properties(&mut self, count: usize) -> BTreeMap<String, Value> {
        let mut patch = BTreeMap::new();
        for _ in 0..count {
            let suffix = unique_suffix();
            patch.insert(
                format!("{}{}", PROPERTY_KEY, suffix),
                Value::String(format!("{}{}", PROPERTY_VALUE, suffix)),
            );
        }
        self.reported.extend(patch.clone());
        patch
    }

    pub fn update_all_reported_properties(&mut self) -> BTreeMap<String, Value> {
        for value in self.reported.values_mut() {
            *value = Value::String(format!("{}{}", PROPERTY_VALUE_UPDATE, unique_suffix()));
        }
        self.reported.clone()
    }

    pub fn update_reported_property(&mut self, index: usize) -> Option<BTreeMap<String, Value>> {
        let (key, value) = self.reported.iter_mut().nth(index)?;
        *value = Value::String(format!("{}{}", PROPERTY_VALUE_UPDATE, unique_suffix()));
        Some(BTreeMap::from([(key.clone(), value.clone())]))
    }

    /// Applies `update` locally and returns the patch to push.
    pub fn apply(&mut self, update: TwinUpdate) -> Result<BTreeMap<String, Value>, Error> {
        match update {
            TwinUpdate::NewProperties(count) => Ok(self.create_new_reported_properties(count)),
            TwinUpdate::UpdateAll => Ok(self.update_all_reported_properties()),
            TwinUpdate::UpdateOne(index) => {
                let len = self.reported.len();
                self.update_reported_property(index).ok_or_else(|| Error::InvalidParameter {
                    context: format!("twin update for {}", self.device_id),
                    reason: format!("property index {} out of range ({} reported)", index, len),
                })
            }
        }
    }
}

/// Number of `expected` entries the snapshot already reflects. String values
/// match by prefix; anything else must be equal.
pub fn count_matches(snapshot: &TwinSnapshot, expected: &BTreeMap<String, Value>) -> usize {
    expected
        .iter()
        .filter(|(key, want)| match (snapshot.reported.get(*key), want) {
            (Some(Value::String(have)), Value::String(want)) => have.starts_with(want.as_str()),
            (Some(have), want) => have == *want,
            (None, _) => false,
        })
        .count()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwinSyncConfig {
    #[serde(with = "crate::transport::millis")]
    pub poll_interval: Duration,
    #[serde(with = "crate::transport::millis")]
    pub propagation_window: Duration,
    #[serde(with = "crate::transport::millis")]
    pub ack_timeout: Duration,
}

impl Default for TwinSyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: crate::TWIN_OPERATION_INTERVAL,
            propagation_window: crate::TWIN_PROPAGATION_WINDOW,
            ack_timeout: crate::SEND_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwinSyncReport {
    pub device_id: String,
    pub expected: usize,
    pub matched: usize,
    pub polls: usize,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct TwinVerifier {
    transport: Arc<dyn DeviceTransport>,
    service: Arc<dyn ServiceClient>,
    config: TwinSyncConfig,
    cancel: CancelFlag,
}

impl TwinVerifier {
    pub fn new(transport: Arc<dyn DeviceTransport>, service: Arc<dyn ServiceClient>, config: TwinSyncConfig) -> Self {
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

    /// Applies `update` to `view`, pushes the patch from the device, then
    /// waits for the service view to reflect every pushed property.
    pub async fn push_and_verify(
        &self,
        scenario: &TestScenario,
        view: &mut DeviceTwinView,
        update: TwinUpdate,
    ) -> Result<TwinSyncReport, Error> {
        let patch = view.apply(update)?;
        let context = scenario.correlation();
        let pending = PendingOperation::new(OperationKind::TwinPatch, 0, IotHubStatusCode::OkEmpty);

        self.transport
            .send_reported_properties(scenario.device_id(), patch.clone(), pending.lenient_callback())
            .await?;

        let poller = BoundedPoller::new(self.config.poll_interval, self.config.ack_timeout);
        match poller.wait_for(pending.signal(), &self.cancel).await {
            PollResult::Fired(completion) if completion.is_success() => {}
            PollResult::Fired(completion) => {
                return Err(Error::UnexpectedStatusCode {
                    context,
                    expected: pending.expected,
                    actual: completion.status.unwrap_or(IotHubStatusCode::Error),
                })
            }
            PollResult::TimedOut => {
                return Err(Error::AcknowledgementTimeout {
                    context,
                    expected: pending.expected,
                    timeout: self.config.ack_timeout,
                })
            }
            PollResult::Cancelled => return Err(Error::Cancelled { context }),
        }
        log::debug!("{}: reported patch of {} propert(ies) accepted", scenario.device_id(), patch.len());

        self.await_propagation(scenario, &patch).await
    }

    /// Polls the service twin until all of `expected` is visible or the
    /// propagation window closes. Reads never modify the twin.
    pub async fn await_propagation(
        &self,
        scenario: &TestScenario,
        expected: &BTreeMap<String, Value>,
    ) -> Result<TwinSyncReport, Error> {
        let start = Instant::now();
        let device_id = scenario.device_id();
        let mut polls = 0usize;
        let poller = BoundedPoller::new(self.config.poll_interval, self.config.propagation_window);

        let polled = poller
            .poll_until(&self.cancel, || {
                polls += 1;
                let service = Arc::clone(&self.service);
                async move {
                    let snapshot = service.get_twin(device_id).await?;
                    let matched = count_matches(&snapshot, expected);
                    Ok((matched == expected.len(), matched))
                }
            })
            .await?;

        match polled {
            Polled::Satisfied(matched) => {
                log::info!(
                    "{}: twin reflects {}/{} propert(ies) after {:?}",
                    device_id,
                    matched,
                    expected.len(),
                    start.elapsed()
                );
                Ok(TwinSyncReport {
                    device_id: device_id.to_string(),
                    expected: expected.len(),
                    matched,
                    polls,
                    elapsed: start.elapsed(),
                })
            }
            Polled::TimedOut(observed) => Err(Error::TwinSyncTimeout {
                context: scenario.correlation(),
                expected: expected.len(),
                observed,
                window: self.config.propagation_window,
            }),
            Polled::Cancelled => Err(Error::Cancelled {
                context: scenario.correlation(),
            }),
        }
    }

    /// Runs [`TwinVerifier::push_and_verify`] for every device concurrently.
    /// All devices run to completion; the first error is returned.
    pub async fn verify_devices(
        &self,
        targets: &mut [(TestScenario, DeviceTwinView)],
        update: TwinUpdate,
    ) -> Result<Vec<TwinSyncReport>, Error> {
        let results = futures::future::join_all(
            targets
                .iter_mut()
                .map(|(scenario, view)| self.push_and_verify(scenario, view, update)),
        )
        .await;

        let mut reports = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(report) => reports.push(report),
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(e) => log::error!("Additional twin failure: {}", e),
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }
}
