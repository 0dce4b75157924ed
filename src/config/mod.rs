//! Mailer configuration.
//!
//! Provides configuration with a builder for:
//! - Delivery mode (authenticated relay or direct MX delivery)
//! - TLS settings
//! - Timeouts and message size limits

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::AuthMethod;
use crate::errors::{MailerError, MailerResult};

/// Default relay port (submission with STARTTLS).
pub const DEFAULT_RELAY_PORT: u16 = 587;

/// Default port for direct MX delivery.
pub const DEFAULT_MX_PORT: u16 = 25;

/// Default timeout for connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout for MX lookups.
pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(10);

/// Default maximum message size (25 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 25 * 1024 * 1024;

/// TLS mode for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// No TLS.
    None,
    /// Opportunistic STARTTLS.
    StartTls,
    /// STARTTLS, failing if the server does not offer it.
    #[default]
    StartTlsRequired,
    /// TLS from the first byte (port 465).
    Implicit,
}

/// Minimum TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsVersion {
    /// TLS 1.2.
    #[default]
    Tls12,
    /// TLS 1.3 only.
    Tls13,
}

/// TLS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Minimum TLS version.
    #[serde(default)]
    pub min_version: TlsVersion,
    /// Verify the server certificate chain and name.
    #[serde(default = "default_true")]
    pub verify_certificate: bool,
    /// PEM file with additional trusted CA certificates.
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// Server name to present instead of the relay host.
    #[serde(default)]
    pub sni_override: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            min_version: TlsVersion::default(),
            verify_certificate: true,
            ca_cert_path: None,
            sni_override: None,
        }
    }
}

impl TlsConfig {
    /// Validates the TLS configuration.
    pub fn validate(&self) -> MailerResult<()> {
        if let Some(sni) = &self.sni_override {
            if sni.trim().is_empty() {
                return Err(MailerError::configuration("sni_override must not be empty"));
            }
        }

        if !self.verify_certificate {
            #[cfg(feature = "tracing")]
            tracing::warn!("TLS certificate verification is disabled");
        }

        Ok(())
    }
}

/// Fixed relay settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay hostname.
    pub host: String,
    /// Relay port.
    #[serde(default = "default_relay_port")]
    pub port: u16,
    /// TLS mode.
    #[serde(default)]
    pub tls_mode: TlsMode,
    /// Preferred authentication mechanism.
    #[serde(default)]
    pub auth_method: Option<AuthMethod>,
}

fn default_relay_port() -> u16 {
    DEFAULT_RELAY_PORT
}

impl RelayConfig {
    /// Creates relay settings with the default port and STARTTLS required.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_RELAY_PORT,
            tls_mode: TlsMode::default(),
            auth_method: None,
        }
    }
}

/// Direct MX delivery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MxConfig {
    /// Port to connect to on the exchange host.
    #[serde(default = "default_mx_port")]
    pub port: u16,
    /// Upgrade with STARTTLS when the exchange offers it.
    #[serde(default = "default_true")]
    pub starttls: bool,
}

fn default_mx_port() -> u16 {
    DEFAULT_MX_PORT
}

impl Default for MxConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_MX_PORT,
            starttls: true,
        }
    }
}

/// How messages reach recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Every message goes through one authenticated relay.
    Relay(RelayConfig),
    /// Each recipient domain is delivered to its mail exchanger.
    DirectMx(MxConfig),
}

impl DeliveryMode {
    /// Returns true for relay mode.
    pub fn is_relay(&self) -> bool {
        matches!(self, DeliveryMode::Relay(_))
    }
}

/// Mailer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailerConfig {
    /// Delivery mode.
    pub delivery: DeliveryMode,
    /// TLS configuration.
    #[serde(default)]
    pub tls: TlsConfig,
    /// Client identifier for EHLO.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Connect timeout.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Command timeout.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    /// MX lookup timeout.
    #[serde(default = "default_dns_timeout", with = "humantime_serde")]
    pub dns_timeout: Duration,
    /// Maximum encoded message size.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}
fn default_command_timeout() -> Duration {
    DEFAULT_COMMAND_TIMEOUT
}
fn default_dns_timeout() -> Duration {
    DEFAULT_DNS_TIMEOUT
}
fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

impl MailerConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> MailerConfigBuilder {
        MailerConfigBuilder::default()
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json_str(json: &str) -> MailerResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            MailerError::configuration(format!("Invalid configuration: {}", e)).with_cause(e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> MailerResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            MailerError::configuration(format!("Cannot read {}: {}", path.display(), e))
                .with_cause(e)
        })?;
        Self::from_json_str(&json)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> MailerResult<()> {
        match &self.delivery {
            DeliveryMode::Relay(relay) => {
                if relay.host.trim().is_empty() {
                    return Err(MailerError::configuration("Relay host is required"));
                }
                if relay.port == 0 {
                    return Err(MailerError::configuration("Relay port must be non-zero"));
                }
            }
            DeliveryMode::DirectMx(mx) => {
                if mx.port == 0 {
                    return Err(MailerError::configuration("MX port must be non-zero"));
                }
            }
        }

        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("command_timeout", self.command_timeout),
            ("dns_timeout", self.dns_timeout),
        ] {
            if value.is_zero() {
                return Err(MailerError::configuration(format!(
                    "{} must be positive",
                    name
                )));
            }
        }

        if self.max_message_size == 0 {
            return Err(MailerError::configuration("max_message_size must be positive"));
        }

        self.tls.validate()
    }

    /// Returns the client identifier for EHLO.
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or("localhost")
    }
}

/// Builder for mailer configuration.
#[derive(Debug, Default)]
pub struct MailerConfigBuilder {
    delivery: Option<DeliveryMode>,
    tls: TlsConfig,
    client_id: Option<String>,
    connect_timeout: Duration,
    command_timeout: Duration,
    dns_timeout: Duration,
    max_message_size: usize,
}

impl MailerConfigBuilder {
    /// Delivers through a fixed relay.
    pub fn relay(mut self, host: impl Into<String>, port: u16) -> Self {
        let mut relay = RelayConfig::new(host);
        relay.port = port;
        self.delivery = Some(DeliveryMode::Relay(relay));
        self
    }

    /// Delivers directly to each domain's mail exchanger.
    pub fn direct_mx(mut self) -> Self {
        self.delivery = Some(DeliveryMode::DirectMx(MxConfig::default()));
        self
    }

    /// Sets the delivery mode.
    pub fn delivery(mut self, mode: DeliveryMode) -> Self {
        self.delivery = Some(mode);
        self
    }

    /// Sets the relay TLS mode.
    ///
    /// In MX mode, `TlsMode::None` disables opportunistic STARTTLS.
    pub fn tls_mode(mut self, mode: TlsMode) -> Self {
        match &mut self.delivery {
            Some(DeliveryMode::Relay(relay)) => relay.tls_mode = mode,
            Some(DeliveryMode::DirectMx(mx)) => mx.starttls = mode != TlsMode::None,
            None => {}
        }
        self
    }

    /// Sets the preferred relay authentication mechanism.
    pub fn auth_method(mut self, method: AuthMethod) -> Self {
        if let Some(DeliveryMode::Relay(relay)) = &mut self.delivery {
            relay.auth_method = Some(method);
        }
        self
    }

    /// Sets the TLS configuration.
    pub fn tls(mut self, config: TlsConfig) -> Self {
        self.tls = config;
        self
    }

    /// Sets the client identifier for EHLO.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Sets connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Sets MX lookup timeout.
    pub fn dns_timeout(mut self, timeout: Duration) -> Self {
        self.dns_timeout = timeout;
        self
    }

    /// Sets maximum message size.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> MailerResult<MailerConfig> {
        fn or_default(value: Duration, default: Duration) -> Duration {
            if value.is_zero() {
                default
            } else {
                value
            }
        }

        let config = MailerConfig {
            delivery: self
                .delivery
                .ok_or_else(|| MailerError::configuration("Delivery mode is required"))?,
            tls: self.tls,
            client_id: self.client_id,
            connect_timeout: or_default(self.connect_timeout, DEFAULT_CONNECT_TIMEOUT),
            command_timeout: or_default(self.command_timeout, DEFAULT_COMMAND_TIMEOUT),
            dns_timeout: or_default(self.dns_timeout, DEFAULT_DNS_TIMEOUT),
            max_message_size: if self.max_message_size == 0 {
                DEFAULT_MAX_MESSAGE_SIZE
            } else {
                self.max_message_size
            },
        };

        config.validate()?;
        Ok(config)
    }
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCategory;
    use std::io::Write;

    #[test]
    fn test_relay_builder() {
        let config = MailerConfig::builder()
            .relay("smtp.gmail.com", 587)
            .auth_method(AuthMethod::Login)
            .build()
            .unwrap();

        match &config.delivery {
            DeliveryMode::Relay(relay) => {
                assert_eq!(relay.host, "smtp.gmail.com");
                assert_eq!(relay.port, 587);
                assert_eq!(relay.tls_mode, TlsMode::StartTlsRequired);
                assert_eq!(relay.auth_method, Some(AuthMethod::Login));
            }
            other => panic!("unexpected mode {:?}", other),
        }
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert!(config.tls.verify_certificate);
    }

    #[test]
    fn test_direct_mx_defaults() {
        let config = MailerConfig::builder().direct_mx().build().unwrap();
        assert_eq!(config.delivery, DeliveryMode::DirectMx(MxConfig::default()));
        assert_eq!(config.client_id(), "localhost");
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_config_validation() {
        let err = MailerConfig::builder().build().unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);

        assert!(MailerConfig::builder().relay("", 587).build().is_err());
        assert!(MailerConfig::builder().relay("smtp.example.com", 0).build().is_err());
    }

    #[test]
    fn test_from_json_str() {
        let config = MailerConfig::from_json_str(
            r#"{
                "delivery": { "mode": "relay", "host": "smtp.example.com", "tls_mode": "implicit", "port": 465 },
                "command_timeout": "90s",
                "client_id": "mailer.example.com"
            }"#,
        )
        .unwrap();

        assert_eq!(config.command_timeout, Duration::from_secs(90));
        assert_eq!(config.dns_timeout, DEFAULT_DNS_TIMEOUT);
        assert_eq!(config.client_id(), "mailer.example.com");
        assert!(config.tls.verify_certificate);
        match config.delivery {
            DeliveryMode::Relay(relay) => {
                assert_eq!(relay.port, 465);
                assert_eq!(relay.tls_mode, TlsMode::Implicit);
            }
            other => panic!("unexpected mode {:?}", other),
        }

        let err = MailerConfig::from_json_str(r#"{"delivery": {"mode": "direct_mx"}, "dns_timeout": "0s"}"#)
            .unwrap_err();
        assert!(err.message().contains("dns_timeout"));

        assert!(MailerConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"delivery": {{"mode": "direct_mx", "port": 2525, "starttls": false}}}}"#)
            .unwrap();

        let config = MailerConfig::from_path(file.path()).unwrap();
        assert_eq!(
            config.delivery,
            DeliveryMode::DirectMx(MxConfig {
                port: 2525,
                starttls: false
            })
        );

        assert!(MailerConfig::from_path("/nonexistent/mailer.json").is_err());
    }

    #[test]
    fn test_roundtrip_keeps_durations_readable() {
        let config = MailerConfig::builder()
            .direct_mx()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"connect_timeout\":\"5s\""));
    }
}
