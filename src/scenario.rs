//! Test scenario model: which protocol, which authentication scheme, which
//! client role and which identity a run exercises.
//!
//! A run is parameterised by one [`TestScenario`] value instead of a class per
//! combination; helpers that need to know the combination take the scenario.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Protocol {
    Mqtt,
    MqttWs,
    Amqps,
    AmqpsWs,
    Https,
}

impl Protocol {
    /// Only the AMQP family can carry several device identities over one
    /// connection.
    pub fn supports_multiplexing(self) -> bool {
        matches!(self, Protocol::Amqps | Protocol::AmqpsWs)
    }

    pub fn supports_x509(self) -> bool {
        !matches!(self, Protocol::MqttWs)
    }

    /// HTTPS is request/response only: no twin, method or connection-status
    /// channel.
    pub fn supports_persistent_channels(self) -> bool {
        !matches!(self, Protocol::Https)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Mqtt => "MQTT",
            Protocol::MqttWs => "MQTT_WS",
            Protocol::Amqps => "AMQPS",
            Protocol::AmqpsWs => "AMQPS_WS",
            Protocol::Https => "HTTPS",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthenticationType {
    Sas,
    SelfSigned,
    CertificateAuthority,
}

impl AuthenticationType {
    pub fn is_x509(self) -> bool {
        !matches!(self, AuthenticationType::Sas)
    }
}

impl fmt::Display for AuthenticationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthenticationType::Sas => "SAS",
            AuthenticationType::SelfSigned => "SELF_SIGNED",
            AuthenticationType::CertificateAuthority => "CERTIFICATE_AUTHORITY",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientType {
    DeviceClient,
    ModuleClient,
}

/// Authentication material for one identity. Created by test setup and
/// never mutated afterwards.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthMaterial {
    SymmetricKey {
        primary_key: String,
    },
    X509 {
        public_cert_pem: String,
        private_key_pem: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thumbprint: Option<String>,
        #[serde(default)]
        ca_signed: bool,
    },
}

impl AuthMaterial {
    pub fn authentication_type(&self) -> AuthenticationType {
        match self {
            AuthMaterial::SymmetricKey { .. } => AuthenticationType::Sas,
            AuthMaterial::X509 { ca_signed: true, .. } => AuthenticationType::CertificateAuthority,
            AuthMaterial::X509 { .. } => AuthenticationType::SelfSigned,
        }
    }
}

// Keys stay out of logs.
impl fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMaterial::SymmetricKey { .. } => f.write_str("SymmetricKey(..)"),
            AuthMaterial::X509 { thumbprint, .. } => f
                .debug_struct("X509")
                .field("thumbprint", thumbprint)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
    pub auth: AuthMaterial,
}

impl DeviceIdentity {
    pub fn new(device_id: impl Into<String>, auth: AuthMaterial) -> Self {
        Self {
            device_id: device_id.into(),
            module_id: None,
            auth,
        }
    }

    pub fn with_symmetric_key(device_id: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self::new(
            device_id,
            AuthMaterial::SymmetricKey {
                primary_key: primary_key.into(),
            },
        )
    }

    /// `"{prefix}{index}-{run_id}"` with a fresh random symmetric key.
    pub fn generate(prefix: &str, index: usize, run_id: &uuid::Uuid) -> Self {
        let device_id = format!("{}{}-{}", prefix, index, run_id);
        Self::with_symmetric_key(device_id, uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn with_module(mut self, module_id: impl Into<String>) -> Self {
        self.module_id = Some(module_id.into());
        self
    }

    pub fn client_type(&self) -> ClientType {
        if self.module_id.is_some() {
            ClientType::ModuleClient
        } else {
            ClientType::DeviceClient
        }
    }

    pub fn authentication_type(&self) -> AuthenticationType {
        self.auth.authentication_type()
    }
}

/// One point of the protocol × auth × client-role matrix, bound to an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestScenario {
    pub protocol: Protocol,
    pub identity: DeviceIdentity,
}

impl TestScenario {
    pub fn new(protocol: Protocol, identity: DeviceIdentity) -> Self {
        Self { protocol, identity }
    }

    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    pub fn authentication_type(&self) -> AuthenticationType {
        self.identity.authentication_type()
    }

    pub fn client_type(&self) -> ClientType {
        self.identity.client_type()
    }

    /// `Err(reason)` for combinations the SDK does not support; callers skip
    /// rather than fail those.
    pub fn check_supported(&self) -> Result<(), String> {
        if self.authentication_type().is_x509() && !self.protocol.supports_x509() {
            return Err(format!("{} does not support x509 auth", self.protocol));
        }
        Ok(())
    }

    pub fn correlation(&self) -> CorrelationContext {
        CorrelationContext {
            device_id: self.identity.device_id.clone(),
            module_id: self.identity.module_id.clone(),
            protocol: self.protocol,
            authentication_type: self.authentication_type(),
            sequence: None,
        }
    }
}

/// Enough detail to attribute a failure: who, over what, and which message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationContext {
    pub device_id: String,
    pub module_id: Option<String>,
    pub protocol: Protocol,
    pub authentication_type: AuthenticationType,
    pub sequence: Option<u64>,
}

impl CorrelationContext {
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

impl fmt::Display for CorrelationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device={}", self.device_id)?;
        if let Some(module_id) = &self.module_id {
            write!(f, " module={}", module_id)?;
        }
        write!(f, " protocol={} auth={}", self.protocol, self.authentication_type)?;
        if let Some(seq) = self.sequence {
            write!(f, " seq={}", seq)?;
        }
        Ok(())
    }
}
