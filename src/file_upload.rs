//! File upload with service-side notification delivery.

use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::Error;
use crate::message::IotHubStatusCode;
use crate::poller::{deadline_after, BoundedPoller, CancelFlag, PollResult};
use crate::scenario::{CorrelationContext, TestScenario};
use crate::signal::{OperationKind, PendingOperation};
use crate::transport::{DeviceTransport, FileUploadNotification, ServiceClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileUploadConfig {
    pub file_size: usize,
    #[serde(with = "crate::transport::millis")]
    pub poll_interval: Duration,
    #[serde(with = "crate::transport::millis")]
    pub upload_timeout: Duration,
    #[serde(with = "crate::transport::millis")]
    pub notification_timeout: Duration,
    #[serde(with = "crate::transport::millis")]
    pub flush_window: Duration,
}

impl Default for FileUploadConfig {
    fn default() -> Self {
        Self {
            file_size: 1024,
            poll_interval: crate::RETRY_INTERVAL,
            upload_timeout: crate::SEND_TIMEOUT,
            notification_timeout: crate::SEND_TIMEOUT,
            flush_window: crate::NOTIFICATION_FLUSH_WINDOW,
        }
    }
}

pub fn blob_name(index: usize) -> String {
    format!("File{}.txt", index)
}

/// Drains notifications left over from earlier runs. Stops at the first
/// empty receive or when `window` has elapsed; returns how many were dropped.
pub async fn flush_notifications(service: &dyn ServiceClient, window: Duration) -> Result<usize, Error> {
    let deadline = deadline_after(window);
    let mut flushed = 0;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match service.receive_file_upload_notification(remaining).await? {
            Some(stale) => {
                log::debug!("Flushed stale upload notification for {}", stale.blob_name);
                flushed += 1;
            }
            None => break,
        }
    }
    Ok(flushed)
}

/// One completed upload still waiting for its notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub device_id: String,
    pub blob_name: String,
    pub size: u64,
    pub context: CorrelationContext,
}

impl UploadedFile {
    fn matches(&self, notification: &FileUploadNotification) -> bool {
        notification.device_id == self.device_id
            && notification.blob_name.contains(&self.blob_name)
            && notification.blob_size_in_bytes == self.size
    }
}

#[derive(Debug)]
pub struct FileUploadVerifier {
    transport: Arc<dyn DeviceTransport>,
    service: Arc<dyn ServiceClient>,
    config: FileUploadConfig,
    cancel: CancelFlag,
}

impl FileUploadVerifier {
    pub fn new(transport: Arc<dyn DeviceTransport>, service: Arc<dyn ServiceClient>, config: FileUploadConfig) -> Self {
        Self {
            transport,
            service,
            config,
            cancel: CancelFlag::new(),
        }
    }

    /// Uploads `File{index}.txt` of random bytes and waits for the upload
    /// callback.
    pub async fn upload(&self, scenario: &TestScenario, index: usize) -> Result<UploadedFile, Error> {
        let name = blob_name(index);
        let mut data = vec![0u8; self.config.file_size];
        rand::thread_rng().fill_bytes(&mut data);
        let size = data.len() as u64;

        let pending = PendingOperation::new(OperationKind::FileUpload, index as u64, IotHubStatusCode::OkEmpty);
        self.transport
            .upload_to_blob_async(scenario.device_id(), name.clone(), data, pending.lenient_callback())
            .await?;

        let poller = BoundedPoller::new(self.config.poll_interval, self.config.upload_timeout);
        match poller.wait_for(pending.signal(), &self.cancel).await {
            PollResult::Fired(completion) if completion.is_success() => Ok(UploadedFile {
                device_id: scenario.device_id().to_string(),
                blob_name: name,
                size,
                context: scenario.correlation().with_sequence(index as u64),
            }),
            PollResult::Fired(completion) => Err(Error::FileUploadFailed {
                context: scenario.correlation().with_sequence(index as u64),
                details: format!(
                    "upload of {} completed with {}",
                    name,
                    completion.status.unwrap_or(IotHubStatusCode::Error)
                ),
            }),
            PollResult::TimedOut => Err(Error::FileUploadFailed {
                context: scenario.correlation().with_sequence(index as u64),
                details: format!("upload of {} not acknowledged within {:?}", name, self.config.upload_timeout),
            }),
            PollResult::Cancelled => Err(Error::Cancelled {
                context: scenario.correlation(),
            }),
        }
    }

    /// Receives notifications until every upload in `pending` has a matching
    /// one. Unrelated notifications are skipped.
    pub async fn await_notifications(
        &self,
        mut pending: Vec<UploadedFile>,
    ) -> Result<Vec<FileUploadNotification>, Error> {
        let deadline = deadline_after(self.config.notification_timeout);
        let mut matched = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let notification = if remaining.is_zero() {
                None
            } else {
                self.service.receive_file_upload_notification(remaining).await?
            };
            let Some(notification) = notification else {
                let missing: Vec<&str> = pending.iter().map(|p| p.blob_name.as_str()).collect();
                return Err(Error::FileUploadFailed {
                    context: pending[0].context.clone(),
                    details: format!(
                        "no upload notification within {:?} for {}",
                        self.config.notification_timeout,
                        missing.join(", ")
                    ),
                });
            };
            match pending.iter().position(|p| p.matches(&notification)) {
                Some(i) => {
                    let upload = pending.swap_remove(i);
                    log::info!("{}: notification received for {}", upload.device_id, notification.blob_name);
                    matched.push(notification);
                }
                None => log::debug!("Ignoring unrelated upload notification {:?}", notification),
            }
        }
        Ok(matched)
    }

    /// Flush, upload one file per device concurrently, then require a
    /// notification for each, then flush again.
    pub async fn upload_and_verify(&self, scenarios: &[TestScenario]) -> Result<Vec<FileUploadNotification>, Error> {
        flush_notifications(self.service.as_ref(), self.config.flush_window).await?;

        let uploads = futures::future::join_all(
            scenarios
                .iter()
                .enumerate()
                .map(|(index, scenario)| self.upload(scenario, index)),
        )
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

        let notifications = self.await_notifications(uploads).await?;
        flush_notifications(self.service.as_ref(), self.config.flush_window).await?;
        Ok(notifications)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{DeviceIdentity, Protocol};

    #[test]
    fn notification_match_requires_name_and_size() {
        let scenario = TestScenario::new(Protocol::Amqps, DeviceIdentity::with_symmetric_key("dev", "k"));
        let upload = UploadedFile {
            device_id: "dev".into(),
            blob_name: blob_name(2),
            size: 10,
            context: scenario.correlation(),
        };
        let mut notification = FileUploadNotification {
            device_id: "dev".into(),
            blob_name: "dev/File2.txt".into(),
            blob_uri: "https://example/dev/File2.txt".into(),
            blob_size_in_bytes: 10,
        };
        assert!(upload.matches(&notification));
        notification.blob_size_in_bytes = 11;
        assert!(!upload.matches(&notification));
    }
}
