use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Status codes the hub reports back to device-side callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IotHubStatusCode {
    Ok,
    OkEmpty,
    BadFormat,
    Unauthorized,
    TooManyDevices,
    HubOrDeviceIdNotFound,
    PreconditionFailed,
    RequestEntityTooLarge,
    Throttled,
    InternalServerError,
    ServerBusy,
    Error,
    MessageExpired,
    MessageCancelledOnClose,
}

impl IotHubStatusCode {
    /// `OK` and `OK_EMPTY` both count as success for callbacks that do not
    /// insist on a particular one.
    pub fn is_success(self) -> bool {
        matches!(self, IotHubStatusCode::Ok | IotHubStatusCode::OkEmpty)
    }

    /// Maps an HTTP-style status returned by the hub to a status code.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            200 => IotHubStatusCode::Ok,
            204 => IotHubStatusCode::OkEmpty,
            400 => IotHubStatusCode::BadFormat,
            401 => IotHubStatusCode::Unauthorized,
            403 => IotHubStatusCode::TooManyDevices,
            404 => IotHubStatusCode::HubOrDeviceIdNotFound,
            412 => IotHubStatusCode::PreconditionFailed,
            413 => IotHubStatusCode::RequestEntityTooLarge,
            429 => IotHubStatusCode::Throttled,
            500 => IotHubStatusCode::InternalServerError,
            503 => IotHubStatusCode::ServerBusy,
            _ => IotHubStatusCode::Error,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IotHubStatusCode::Ok => "OK",
            IotHubStatusCode::OkEmpty => "OK_EMPTY",
            IotHubStatusCode::BadFormat => "BAD_FORMAT",
            IotHubStatusCode::Unauthorized => "UNAUTHORIZED",
            IotHubStatusCode::TooManyDevices => "TOO_MANY_DEVICES",
            IotHubStatusCode::HubOrDeviceIdNotFound => "HUB_OR_DEVICE_ID_NOT_FOUND",
            IotHubStatusCode::PreconditionFailed => "PRECONDITION_FAILED",
            IotHubStatusCode::RequestEntityTooLarge => "REQUEST_ENTITY_TOO_LARGE",
            IotHubStatusCode::Throttled => "THROTTLED",
            IotHubStatusCode::InternalServerError => "INTERNAL_SERVER_ERROR",
            IotHubStatusCode::ServerBusy => "SERVER_BUSY",
            IotHubStatusCode::Error => "ERROR",
            IotHubStatusCode::MessageExpired => "MESSAGE_EXPIRED",
            IotHubStatusCode::MessageCancelledOnClose => "MESSAGE_CANCELLED_ONCLOSE",
        }
    }
}

impl fmt::Display for IotHubStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A telemetry or cloud-to-device message: a text body plus application and
/// system properties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub body: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Message {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_property(key, value);
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// How a device-side message callback disposes of a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    Complete,
    Abandon,
    Reject,
}
