//! Multiplex coordinator: N device identities, one shared transport.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::Error;
use crate::logging;
use crate::outcome::WorkerFailure;
use crate::poller::deadline_after;
use crate::scenario::{DeviceIdentity, Protocol, TestScenario};
use crate::transport::DeviceTransport;
use crate::worker::{DeviceWorker, RunContext, WorkerParams, WorkerReport};

/// Bounded exponential backoff for opening the shared transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenRetry {
    pub max_attempts: u32,
    #[serde(with = "crate::transport::millis")]
    pub initial_delay: Duration,
    #[serde(with = "crate::transport::millis")]
    pub max_delay: Duration,
}

impl Default for OpenRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl OpenRetry {
    /// Delay after the zero-based `attempt` failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.initial_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.max_delay)
    }
}

/// Opens `transport`, retrying with backoff.
///
/// # Parameters
/// * `transport`: The connection to open. Identities must already be registered.
/// * `retry`: Attempt limit and backoff bounds.
///
/// # Returns
/// The number of attempts used. Exhausting them is an
/// [`Error::TransportOpenFailure`] carrying the last error's text.
pub async fn open_with_retry(transport: &dyn DeviceTransport, retry: &OpenRetry) -> Result<u32, Error> {
    let max_attempts = retry.max_attempts.max(1);
    let mut last_error = String::new();
    for attempt in 0..max_attempts {
        match transport.open().await {
            Ok(()) => {
                log::info!("Transport over {} opened on attempt {}", transport.protocol(), attempt + 1);
                return Ok(attempt + 1);
            }
            Err(e) => {
                log::warn!(
                    "Opening transport over {} failed (attempt {}/{}): {}",
                    transport.protocol(),
                    attempt + 1,
                    max_attempts,
                    e
                );
                last_error = e.to_string();
                if attempt + 1 < max_attempts {
                    tokio::time::sleep(retry.delay_for(attempt)).await;
                }
            }
        }
    }
    Err(Error::TransportOpenFailure {
        protocol: transport.protocol().to_string(),
        attempts: max_attempts,
        details: last_error,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexConfig {
    pub worker: WorkerParams,
    #[serde(with = "crate::transport::millis")]
    pub multiplex_timeout: Duration,
    pub open_retry: OpenRetry,
    /// How long cancelled workers get to notice cancellation before they are
    /// left behind.
    #[serde(with = "crate::transport::millis")]
    pub drain_timeout: Duration,
}

impl Default for MultiplexConfig {
    fn default() -> Self {
        Self {
            worker: WorkerParams::default(),
            multiplex_timeout: crate::MULTITHREADED_WAIT_TIMEOUT,
            open_retry: OpenRetry::default(),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
pub struct MultiplexReport {
    pub protocol: Protocol,
    pub open_attempts: u32,
    pub workers: Vec<WorkerReport>,
    pub failures: Vec<WorkerFailure>,
    pub elapsed: Duration,
}

impl MultiplexReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn acknowledged_total(&self) -> usize {
        self.workers.iter().map(|w| w.acknowledged).sum()
    }

    /// The report of the worker driving `device_id`.
    pub fn worker(&self, device_id: &str) -> Option<&WorkerReport> {
        self.workers.iter().find(|w| w.device_id == device_id)
    }

    /// `Err` with the first recorded failure, if any.
    pub fn into_result(mut self) -> Result<Self, Error> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(self.failures.remove(0).error)
        }
    }
}

#[derive(Debug)]
pub struct MultiplexCoordinator {
    transport: Arc<dyn DeviceTransport>,
    scenarios: Vec<TestScenario>,
    config: MultiplexConfig,
}

impl MultiplexCoordinator {
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        identities: Vec<DeviceIdentity>,
        config: MultiplexConfig,
    ) -> Result<Self, Error> {
        let protocol = transport.protocol();
        if identities.is_empty() {
            return Err(Error::InvalidParameter {
                context: "MultiplexCoordinator::new".to_string(),
                reason: "at least one device identity is required".to_string(),
            });
        }
        if !protocol.supports_multiplexing() {
            return Err(Error::InvalidParameter {
                context: "MultiplexCoordinator::new".to_string(),
                reason: format!("{} does not support multiplexing", protocol),
            });
        }
        let mut seen = HashSet::new();
        let mut scenarios = Vec::with_capacity(identities.len());
        for identity in identities {
            if !seen.insert(identity.device_id.clone()) {
                return Err(Error::InvalidParameter {
                    context: "MultiplexCoordinator::new".to_string(),
                    reason: format!("duplicate device id {}", identity.device_id),
                });
            }
            let scenario = TestScenario::new(protocol, identity);
            scenario.check_supported().map_err(|reason| Error::InvalidParameter {
                context: format!("device {}", scenario.device_id()),
                reason,
            })?;
            scenarios.push(scenario);
        }
        Ok(Self {
            transport,
            scenarios,
            config,
        })
    }

    pub fn device_count(&self) -> usize {
        self.scenarios.len()
    }

    /// Runs all workers concurrently and closes the transport afterwards,
    /// whatever happened. `Err` is reserved for failures before any worker
    /// started; worker failures are in the report.
    pub async fn run(&self) -> Result<MultiplexReport, Error> {
        let result = self.execute().await;
        if let Err(e) = self.transport.close().await {
            logging::log_teardown_failure("closing shared transport", &e);
        }
        result
    }

    async fn execute(&self) -> Result<MultiplexReport, Error> {
        let start = Instant::now();
        let protocol = self.transport.protocol();

        for scenario in &self.scenarios {
            self.transport.register(&scenario.identity).await?;
        }
        let open_attempts = open_with_retry(self.transport.as_ref(), &self.config.open_retry).await?;

        let run = RunContext::new(self.scenarios.len());
        let handles: Vec<_> = self
            .scenarios
            .iter()
            .map(|scenario| {
                let worker = DeviceWorker::new(
                    scenario.clone(),
                    Arc::clone(&self.transport),
                    self.config.worker,
                    run.clone(),
                );
                (scenario.device_id().to_string(), tokio::spawn(worker.run()))
            })
            .collect();
        log::info!("Started {} worker(s) over one {} transport", handles.len(), protocol);

        if !run.gate.wait(self.config.multiplex_timeout).await {
            run.outcome.mark_failed(
                "multiplex",
                Error::MultiplexTimeout {
                    protocol: protocol.to_string(),
                    timeout: self.config.multiplex_timeout,
                    remaining: run.gate.remaining(),
                },
            );
        }
        if run.outcome.is_failed() {
            log::warn!("Multiplex run failed; cancelling remaining workers");
            run.cancel.cancel();
        }

        let drain_deadline = deadline_after(self.config.drain_timeout);
        let mut workers = Vec::with_capacity(handles.len());
        for (device_id, handle) in handles {
            match tokio::time::timeout_at(drain_deadline, handle).await {
                Ok(Ok(report)) => workers.push(report),
                Ok(Err(join_error)) => {
                    run.outcome.mark_failed(
                        &device_id,
                        Error::Communication(format!("worker task for {} aborted: {}", device_id, join_error)),
                    );
                }
                Err(_) => log::warn!("Worker for {} still in flight at teardown; detaching", device_id),
            }
        }

        Ok(MultiplexReport {
            protocol,
            open_attempts,
            workers,
            failures: run.outcome.take_failures(),
            elapsed: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_backoff_doubles_up_to_cap() {
        let retry = OpenRetry {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(retry.delay_for(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for(2), Duration::from_millis(400));
        assert_eq!(retry.delay_for(3), Duration::from_millis(500));
    }
}
