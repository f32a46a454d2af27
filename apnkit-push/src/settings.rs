//! Runtime settings.
//!
//! Settings are layered: built-in defaults, then an optional file
//! (`.toml`, `.json` or `.env`), then `APNKIT_*` environment variables.
//! A `.env` in the working directory is exported into the environment
//! first, without overriding variables that are already set.

use apnkit_config::{ConfigManager, ConfigValidator, Validate};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::connection::{Endpoint, Environment, Gateway, Timeouts, TlsConnector};
use crate::delivery::{DeliveryPolicy, OversizePolicy};
use crate::{Credential, PushError, Result};

/// Prefix of environment variables read by [`PushSettings::load`].
pub const ENV_PREFIX: &str = "APNKIT";

/// Settings for delivery and feedback runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushSettings {
    /// Apple environment, selecting hosts and per-app certificates.
    pub environment: Environment,
    /// Global fallback certificate (PEM with certificate and key).
    pub cert_path: Option<PathBuf>,
    /// Extra trust anchors (PEM).
    pub ca_path: Option<PathBuf>,
    /// Delivery host override.
    pub gateway_host: Option<String>,
    /// Delivery port override.
    pub gateway_port: Option<u16>,
    /// Feedback host override.
    pub feedback_host: Option<String>,
    /// Feedback port override.
    pub feedback_port: Option<u16>,
    /// TCP connect and TLS handshake limit.
    pub connect_timeout_secs: u64,
    /// Limit on each feedback read.
    pub read_timeout_secs: u64,
    /// Limit on each frame write.
    pub write_timeout_secs: u64,
    /// Framing failure handling for per-device notifications.
    pub device_oversize_policy: OversizePolicy,
    /// Framing failure handling for group notifications.
    pub group_oversize_policy: OversizePolicy,
}

impl Default for PushSettings {
    fn default() -> Self {
        let timeouts = Timeouts::default();
        Self {
            environment: Environment::default(),
            cert_path: None,
            ca_path: None,
            gateway_host: None,
            gateway_port: None,
            feedback_host: None,
            feedback_port: None,
            connect_timeout_secs: timeouts.connect.as_secs(),
            read_timeout_secs: timeouts.read.as_secs(),
            write_timeout_secs: timeouts.write.as_secs(),
            device_oversize_policy: OversizePolicy::default(),
            group_oversize_policy: OversizePolicy::default(),
        }
    }
}

impl PushSettings {
    /// Load from an optional file and the environment, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let manager = ConfigManager::with_prefix(ENV_PREFIX);
        if let Some(path) = path {
            debug!(path = %path.display(), "Loading settings file");
            manager.load_file_auto(path)?;
        }
        manager.load_dotenv(None)?;

        let settings = Self::from_config(&manager)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read settings from loaded configuration, keeping defaults for absent keys.
    ///
    /// Values may be native or strings.
    pub fn from_config(config: &ConfigManager) -> Result<Self> {
        let mut settings = Self::default();

        if let Some(environment) = config.get_parsed("environment")? {
            settings.environment = environment;
        }
        settings.cert_path = config.get_parsed::<PathBuf>("cert_path")?.filter(|p| !p.as_os_str().is_empty());
        settings.ca_path = config.get_parsed::<PathBuf>("ca_path")?.filter(|p| !p.as_os_str().is_empty());
        settings.gateway_host = config.get_parsed("gateway_host")?;
        settings.gateway_port = config.get_parsed("gateway_port")?;
        settings.feedback_host = config.get_parsed("feedback_host")?;
        settings.feedback_port = config.get_parsed("feedback_port")?;

        if let Some(secs) = config.get_parsed("connect_timeout_secs")? {
            settings.connect_timeout_secs = secs;
        }
        if let Some(secs) = config.get_parsed("read_timeout_secs")? {
            settings.read_timeout_secs = secs;
        }
        if let Some(secs) = config.get_parsed("write_timeout_secs")? {
            settings.write_timeout_secs = secs;
        }
        if let Some(policy) = config.get_parsed("device_oversize_policy")? {
            settings.device_oversize_policy = policy;
        }
        if let Some(policy) = config.get_parsed("group_oversize_policy")? {
            settings.group_oversize_policy = policy;
        }

        Ok(settings)
    }

    /// Socket timeouts built from the `*_timeout_secs` fields.
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            read: Duration::from_secs(self.read_timeout_secs),
            write: Duration::from_secs(self.write_timeout_secs),
        }
    }

    /// Endpoint for `gateway`, with overrides applied.
    pub fn endpoint(&self, gateway: Gateway) -> Endpoint {
        let default = gateway.default_endpoint(self.environment);
        let (host, port) = match gateway {
            Gateway::Delivery => (&self.gateway_host, self.gateway_port),
            Gateway::Feedback => (&self.feedback_host, self.feedback_port),
        };
        Endpoint::new(
            host.clone().unwrap_or(default.host),
            port.unwrap_or(default.port),
        )
    }

    /// Oversize handling for both notification kinds.
    pub fn policy(&self) -> DeliveryPolicy {
        DeliveryPolicy {
            device: self.device_oversize_policy,
            group: self.group_oversize_policy,
        }
    }

    /// Read the global certificate, if one is configured.
    pub fn global_credential(&self) -> Result<Option<Credential>> {
        self.cert_path.as_ref().map(Credential::from_file).transpose()
    }

    /// TLS connector for these settings.
    pub fn connector(&self) -> Result<TlsConnector> {
        let connector = TlsConnector::new(self.environment)
            .delivery_endpoint(self.endpoint(Gateway::Delivery))
            .feedback_endpoint(self.endpoint(Gateway::Feedback))
            .timeouts(self.timeouts());

        match &self.ca_path {
            Some(path) => {
                let pem = std::fs::read(path).map_err(|e| {
                    PushError::Certificate(format!("failed to read {}: {}", path.display(), e))
                })?;
                connector.add_trust_anchors(&pem)
            }
            None => Ok(connector),
        }
    }
}

impl Validate for PushSettings {
    fn validate(&self) -> apnkit_config::Result<()> {
        ConfigValidator::positive(self.connect_timeout_secs, "connect_timeout_secs")?;
        ConfigValidator::positive(self.read_timeout_secs, "read_timeout_secs")?;
        ConfigValidator::positive(self.write_timeout_secs, "write_timeout_secs")?;

        for (host, field) in [
            (&self.gateway_host, "gateway_host"),
            (&self.feedback_host, "feedback_host"),
        ] {
            if let Some(host) = host {
                ConfigValidator::not_empty(host, field)?;
            }
        }
        for (port, field) in [
            (self.gateway_port, "gateway_port"),
            (self.feedback_port, "feedback_port"),
        ] {
            if let Some(port) = port {
                ConfigValidator::is_port(port, field)?;
            }
        }
        Ok(())
    }
}
