//! Bridge configuration.
//!
//! Loaded from an optional JSON5 file and then overridden by command-line
//! flags (see [`crate::args::Args`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use aqualogic_common::{
    DEFAULT_DISCOVERY_PREFIX, DEFAULT_IDENTIFIER, LoggingConfig, TopicBuilder, load_config,
};
use serde::{Deserialize, Serialize};

use crate::args::Args;
use crate::entities::{EntitySet, TextPatternSpec};
use crate::error::{BridgeError, Result};
use crate::panel::PanelSource;

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// MQTT broker settings.
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Panel source and timing.
    #[serde(default)]
    pub panel: PanelConfig,

    /// Home Assistant discovery settings.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Enabled entity keys.
    #[serde(default)]
    pub entities: Vec<String>,

    /// Additional text-pattern sensors.
    #[serde(default)]
    pub text_patterns: Vec<TextPatternSpec>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// MQTT broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Client id; generated from the identifier when unset.
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Protocol version: 3 (3.1.1) or 5.
    #[serde(default)]
    pub protocol: ProtocolVersion,

    /// Transport; chosen from the port when unset.
    #[serde(default)]
    pub transport: Option<TransportKind>,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_keepalive_secs() -> u64 {
    60
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: None,
            password: None,
            client_id: None,
            keepalive_secs: default_keepalive_secs(),
            protocol: ProtocolVersion::default(),
            transport: None,
            tls: TlsConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl MqttConfig {
    /// Transport to use: the configured one, else websockets on ports 9001
    /// and 443, else tcp.
    pub fn effective_transport(&self) -> TransportKind {
        self.transport.unwrap_or(match self.port {
            9001 | 443 => TransportKind::Websockets,
            _ => TransportKind::Tcp,
        })
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// Username and password to send, if any.
    ///
    /// Only sent when a username is set; a missing password becomes empty.
    pub fn credentials(&self) -> Option<(String, String)> {
        self.username
            .as_ref()
            .map(|user| (user.clone(), self.password.clone().unwrap_or_default()))
    }
}

/// MQTT protocol version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ProtocolVersion {
    /// MQTT 3.1.1.
    V311,
    /// MQTT 5.
    #[default]
    V5,
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            3 => Ok(ProtocolVersion::V311),
            5 => Ok(ProtocolVersion::V5),
            other => Err(format!(
                "unsupported MQTT protocol version {} (use 3 or 5)",
                other
            )),
        }
    }
}

impl From<ProtocolVersion> for u8 {
    fn from(value: ProtocolVersion) -> Self {
        match value {
            ProtocolVersion::V311 => 3,
            ProtocolVersion::V5 => 5,
        }
    }
}

impl std::str::FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let value: u8 = s
            .trim()
            .parse()
            .map_err(|_| format!("invalid MQTT protocol version '{}'", s))?;
        Self::try_from(value)
    }
}

/// MQTT transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Websockets,
}

/// TLS settings. Setting `insecure` or `ca_path` implies TLS.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Accept any broker certificate.
    #[serde(default)]
    pub insecure: bool,

    /// PEM file with the CA to trust instead of the system roots.
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
}

impl TlsConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled || self.insecure || self.ca_path.is_some()
    }
}

/// Reconnect policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_wait_secs")]
    pub initial_wait_secs: u64,

    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_wait_secs() -> u64 {
    1
}

fn default_max_wait_secs() -> u64 {
    30
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_wait_secs: default_initial_wait_secs(),
            max_wait_secs: default_max_wait_secs(),
        }
    }
}

/// Panel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    /// Where to read the panel from.
    #[serde(default)]
    pub source: Option<PanelSource>,

    /// How long display messages stay in the registry.
    #[serde(default = "default_message_expiry_secs")]
    pub message_expiry_secs: u64,

    /// Silence after which the panel is reported unavailable.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
}

fn default_message_expiry_secs() -> u64 {
    60
}

fn default_heartbeat_timeout_secs() -> u64 {
    60
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            source: None,
            message_expiry_secs: default_message_expiry_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
        }
    }
}

impl PanelConfig {
    pub fn message_expiry(&self) -> Duration {
        Duration::from_secs(self.message_expiry_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

/// Discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,

    #[serde(default = "default_identifier")]
    pub identifier: String,
}

fn default_prefix() -> String {
    DEFAULT_DISCOVERY_PREFIX.to_string()
}

fn default_identifier() -> String {
    DEFAULT_IDENTIFIER.to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            identifier: default_identifier(),
        }
    }
}

impl DiscoveryConfig {
    pub fn topics(&self) -> Result<TopicBuilder> {
        Ok(TopicBuilder::new(&self.prefix, &self.identifier)?)
    }
}

impl BridgeConfig {
    /// Load configuration from a JSON5 file. Validation is left to the caller
    /// so that command-line overrides can be applied first.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(load_config(path)?)
    }

    /// Apply command-line overrides.
    pub fn apply_args(&mut self, args: &Args) -> Result<()> {
        if !args.enable.is_empty() {
            self.entities = args.enable.clone();
        }

        if let Some(path) = &args.serial {
            self.panel.source = Some(PanelSource::Serial { path: path.clone() });
        } else if let Some(dest) = &args.tcp {
            self.panel.source = Some(PanelSource::parse_tcp(dest).map_err(BridgeError::validation)?);
        } else if args.simulate {
            self.panel.source = Some(PanelSource::simulated());
        }

        if let Some(dest) = &args.mqtt_dest {
            let (host, port) = split_host_port(dest).map_err(BridgeError::validation)?;
            self.mqtt.host = host;
            if let Some(port) = port {
                self.mqtt.port = port;
            }
        }

        if let Some(username) = &args.mqtt_username {
            self.mqtt.username = Some(username.clone());
        }
        if let Some(password) = &args.mqtt_password {
            self.mqtt.password = Some(password.clone());
        }
        if let Some(client_id) = &args.mqtt_clientid {
            self.mqtt.client_id = Some(client_id.clone());
        }

        if args.mqtt_tls {
            self.mqtt.tls.enabled = true;
        }
        if args.mqtt_insecure {
            self.mqtt.tls.insecure = true;
        }
        if let Some(ca) = &args.mqtt_ca {
            self.mqtt.tls.ca_path = Some(ca.clone());
        }

        if let Some(version) = args.mqtt_version {
            self.mqtt.protocol = version;
        }
        if let Some(transport) = args.mqtt_transport {
            self.mqtt.transport = Some(transport);
        }

        if let Some(prefix) = &args.discover_prefix {
            self.discovery.prefix = prefix.clone();
        }
        if let Some(expiry) = args.message_expiry {
            self.panel.message_expiry_secs = expiry;
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }

        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.mqtt.host.trim().is_empty() {
            return Err(BridgeError::validation("MQTT host cannot be empty"));
        }
        if self.mqtt.port == 0 {
            return Err(BridgeError::validation("MQTT port must be 1-65535"));
        }
        if self.mqtt.keepalive_secs == 0 {
            return Err(BridgeError::validation(
                "MQTT keepalive must be at least 1 second",
            ));
        }
        if self.mqtt.password.is_some() && self.mqtt.username.is_none() {
            tracing::warn!("MQTT password given without a username; it will not be used");
        }

        let retry = &self.mqtt.retry;
        if retry.initial_wait_secs == 0 {
            return Err(BridgeError::validation(
                "retry.initial_wait_secs must be greater than zero",
            ));
        }
        if retry.max_wait_secs < retry.initial_wait_secs {
            return Err(BridgeError::validation(
                "retry.max_wait_secs must not be below retry.initial_wait_secs",
            ));
        }

        if self.panel.source.is_none() {
            return Err(BridgeError::validation(
                "a panel source is required (--serial, --tcp or --simulate)",
            ));
        }
        if self.panel.message_expiry_secs == 0 {
            return Err(BridgeError::validation(
                "panel.message_expiry_secs must be greater than zero",
            ));
        }
        if self.panel.heartbeat_timeout_secs == 0 {
            return Err(BridgeError::validation(
                "panel.heartbeat_timeout_secs must be greater than zero",
            ));
        }

        self.discovery
            .topics()
            .map_err(|e| BridgeError::validation(e.to_string()))?;
        EntitySet::build(
            &self.discovery.identifier,
            &self.entities,
            &self.text_patterns,
        )?;

        Ok(())
    }

    /// Client id: the configured one or `<identifier>-<pid>`.
    pub fn client_id(&self) -> String {
        self.mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.discovery.identifier, std::process::id()))
    }
}

/// Split `host[:port]`, accepting bracketed IPv6 literals.
pub fn split_host_port(dest: &str) -> std::result::Result<(String, Option<u16>), String> {
    let dest = dest.trim();
    if dest.is_empty() {
        return Err("destination cannot be empty".to_string());
    }

    let parse_port = |p: &str| {
        p.parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| format!("invalid port '{}' in '{}'", p, dest))
    };

    if let Some(rest) = dest.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| format!("unterminated IPv6 literal in '{}'", dest))?;
        return match after.strip_prefix(':') {
            Some(port) => Ok((host.to_string(), Some(parse_port(port)?))),
            None if after.is_empty() => Ok((host.to_string(), None)),
            None => Err(format!("unexpected trailing characters in '{}'", dest)),
        };
    }

    match dest.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => Ok((dest.to_string(), None)),
        Some((host, port)) if !host.is_empty() => Ok((host.to_string(), Some(parse_port(port)?))),
        Some(_) => Err(format!("missing host in '{}'", dest)),
        None => Ok((dest.to_string(), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqualogic_common::{LogFormat, parse_config};
    use clap::Parser;

    #[test]
    fn test_default_config() {
        let config: BridgeConfig = parse_config("{}").unwrap();

        assert_eq!(config.mqtt.host, "localhost");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.keepalive_secs, 60);
        assert_eq!(config.mqtt.protocol, ProtocolVersion::V5);
        assert_eq!(config.mqtt.retry.max_retries, 3);
        assert_eq!(config.mqtt.retry.initial_wait_secs, 1);
        assert_eq!(config.mqtt.retry.max_wait_secs, 30);
        assert!(!config.mqtt.tls.is_enabled());
        assert_eq!(config.panel.message_expiry_secs, 60);
        assert_eq!(config.discovery.prefix, "homeassistant");
        assert_eq!(config.discovery.identifier, "aqualogic");
        assert!(config.entities.is_empty());
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_full_config() {
        let json5 = r#"
        {
            mqtt: {
                host: "broker.local",
                port: 8883,
                username: "pool",
                password: "secret",
                protocol: 3,
                tls: { ca_path: "/etc/ssl/broker.pem" },
                retry: { max_retries: 5 },
            },
            panel: {
                source: { type: "tcp", host: "10.0.0.5", port: 8899 },
                message_expiry_secs: 120,
            },
            discovery: { prefix: "ha" },
            entities: ["l", "f", "t_p"],
            text_patterns: [
                { key: "pump_lo", name: "Pump Low", pattern: "pump lo" },
            ],
            logging: { level: "debug", format: "json" },
        }
        "#;

        let config: BridgeConfig = parse_config(json5).unwrap();

        assert_eq!(config.mqtt.protocol, ProtocolVersion::V311);
        assert!(config.mqtt.tls.is_enabled());
        assert_eq!(config.mqtt.retry.max_retries, 5);
        assert_eq!(config.mqtt.retry.max_wait_secs, 30);
        assert_eq!(
            config.panel.source,
            Some(PanelSource::Tcp {
                host: "10.0.0.5".to_string(),
                port: 8899
            })
        );
        assert_eq!(config.panel.message_expiry(), Duration::from_secs(120));
        assert_eq!(config.entities, vec!["l", "f", "t_p"]);
        assert_eq!(config.text_patterns[0].device_class.as_deref(), Some("problem"));
        assert_eq!(config.logging.format, LogFormat::Json);
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_protocol_rejected() {
        let result: aqualogic_common::Result<BridgeConfig> =
            parse_config("{ mqtt: { protocol: 4 } }");
        assert!(result.is_err());
    }

    #[test]
    fn test_effective_transport() {
        let mut mqtt = MqttConfig::default();
        assert_eq!(mqtt.effective_transport(), TransportKind::Tcp);

        mqtt.port = 9001;
        assert_eq!(mqtt.effective_transport(), TransportKind::Websockets);

        mqtt.port = 443;
        assert_eq!(mqtt.effective_transport(), TransportKind::Websockets);

        mqtt.transport = Some(TransportKind::Tcp);
        assert_eq!(mqtt.effective_transport(), TransportKind::Tcp);
    }

    #[test]
    fn test_validation() {
        let mut config = BridgeConfig::default();
        assert!(config.validate().is_err());

        config.panel.source = Some(PanelSource::simulated());
        config.validate().unwrap();

        config.panel.message_expiry_secs = 0;
        assert!(config.validate().is_err());
        config.panel.message_expiry_secs = 60;

        config.discovery.identifier = "a/b".to_string();
        assert!(config.validate().is_err());
        config.discovery.identifier = "aqualogic".to_string();

        // Warned about, not rejected.
        config.mqtt.password = Some("secret".to_string());
        config.validate().unwrap();
        assert_eq!(config.mqtt.credentials(), None);

        config.mqtt.retry.max_wait_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_apply_args() {
        let args = Args::try_parse_from([
            "aqualogic-mqtt",
            "-t",
            "192.168.1.50:8899",
            "-m",
            "broker:9001",
            "--mqtt-username",
            "pool",
            "--mqtt-password",
            "pw",
            "--mqtt-version",
            "3",
            "-p",
            "ha",
            "-e",
            "l",
            "f",
            "--log-level",
            "trace",
        ])
        .unwrap();

        let mut config = BridgeConfig::default();
        config.entities = vec!["t_p".to_string()];
        config.apply_args(&args).unwrap();
        config.validate().unwrap();

        assert_eq!(
            config.panel.source,
            Some(PanelSource::Tcp {
                host: "192.168.1.50".to_string(),
                port: 8899
            })
        );
        assert_eq!(config.mqtt.host, "broker");
        assert_eq!(config.mqtt.port, 9001);
        assert_eq!(config.mqtt.effective_transport(), TransportKind::Websockets);
        assert_eq!(config.mqtt.username.as_deref(), Some("pool"));
        assert_eq!(config.mqtt.password.as_deref(), Some("pw"));
        assert_eq!(config.mqtt.protocol, ProtocolVersion::V311);
        assert_eq!(config.discovery.prefix, "ha");
        assert_eq!(config.entities, vec!["l", "f"]);
        assert_eq!(config.logging.level, "trace");
    }

    #[test]
    fn test_credentials_need_username() {
        let mut config = MqttConfig::default();
        assert_eq!(config.credentials(), None);

        config.password = Some("secret".to_string());
        assert_eq!(config.credentials(), None);

        config.username = Some("pool".to_string());
        assert_eq!(
            config.credentials(),
            Some(("pool".to_string(), "secret".to_string()))
        );

        config.password = None;
        assert_eq!(
            config.credentials(),
            Some(("pool".to_string(), String::new()))
        );
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("broker:1884").unwrap(),
            ("broker".to_string(), Some(1884))
        );
        assert_eq!(split_host_port("broker").unwrap(), ("broker".to_string(), None));
        assert_eq!(
            split_host_port("[::1]:8883").unwrap(),
            ("::1".to_string(), Some(8883))
        );
        assert_eq!(split_host_port("[::1]").unwrap(), ("::1".to_string(), None));
        assert_eq!(split_host_port("::1").unwrap(), ("::1".to_string(), None));
        assert!(split_host_port("broker:0").is_err());
        assert!(split_host_port("broker:http").is_err());
        assert!(split_host_port(":1883").is_err());
        assert!(split_host_port("").is_err());
        assert!(split_host_port("[::1").is_err());
    }
}
