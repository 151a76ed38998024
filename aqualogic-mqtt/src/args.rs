//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{ProtocolVersion, TransportKind};
use crate::entities::valid_entity_keys;

/// MQTT adapter for Hayward AquaLogic pool controllers.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "aqualogic-mqtt")]
#[command(about = "Bridges an AquaLogic pool panel to MQTT with Home Assistant discovery")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable one or more entities (see --list-entities).
    #[arg(short, long, num_args = 1.., value_name = "KEY", value_parser = parse_entity_key)]
    pub enable: Vec<String>,

    /// Print the entity keys accepted by --enable and exit.
    #[arg(long)]
    pub list_entities: bool,

    /// Serial device source.
    #[arg(short, long, value_name = "/dev/path", group = "source")]
    pub serial: Option<String>,

    /// Network serial adapter source.
    #[arg(short, long, value_name = "HOST:PORT", group = "source")]
    pub tcp: Option<String>,

    /// Run against a simulated panel.
    #[arg(long, group = "source")]
    pub simulate: bool,

    /// MQTT broker destination.
    #[arg(short = 'm', long, value_name = "HOST[:PORT]")]
    pub mqtt_dest: Option<String>,

    /// Username for the MQTT broker.
    #[arg(long)]
    pub mqtt_username: Option<String>,

    /// Password for the MQTT broker (prefer the environment variable).
    #[arg(long, env = "AQUALOGIC_MQTT_PASSWORD", hide_env_values = true)]
    pub mqtt_password: Option<String>,

    /// Client id provided to the MQTT broker.
    #[arg(long)]
    pub mqtt_clientid: Option<String>,

    /// Connect to the broker over TLS.
    #[arg(long)]
    pub mqtt_tls: bool,

    /// Ignore certificate validation errors for the MQTT broker (dangerous!).
    #[arg(long)]
    pub mqtt_insecure: bool,

    /// CA certificate (PEM) to trust for the MQTT broker.
    #[arg(long, value_name = "PATH")]
    pub mqtt_ca: Option<PathBuf>,

    /// MQTT protocol major version (3 or 5).
    #[arg(long, value_name = "3|5")]
    pub mqtt_version: Option<ProtocolVersion>,

    /// MQTT transport (default is tcp unless the port is 9001 or 443).
    #[arg(long, value_enum)]
    pub mqtt_transport: Option<TransportKind>,

    /// Discovery topic prefix.
    #[arg(short = 'p', long)]
    pub discover_prefix: Option<String>,

    /// Seconds a panel message stays active.
    #[arg(long, value_name = "SECS")]
    pub message_expiry: Option<u64>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,
}

fn parse_entity_key(value: &str) -> Result<String, String> {
    let keys = valid_entity_keys();
    if keys.iter().any(|(k, _)| *k == value) {
        Ok(value.to_string())
    } else {
        Err(format!(
            "valid options are: {}",
            keys.iter()
                .map(|(k, name)| format!("{} ({})", k, name))
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }
}

impl Args {
    /// Human-readable entity listing for `--list-entities`.
    pub fn entity_listing() -> String {
        valid_entity_keys()
            .into_iter()
            .map(|(key, name)| format!("{:<10} {}", key, name))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_args() {
        let args = Args::try_parse_from(["aqualogic-mqtt", "-s", "/dev/ttyUSB0"]).unwrap();

        assert_eq!(args.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert!(args.enable.is_empty());
        assert!(!args.simulate);
        assert_eq!(args.mqtt_version, None);
    }

    #[test]
    fn test_sources_are_exclusive() {
        let result = Args::try_parse_from([
            "aqualogic-mqtt",
            "-s",
            "/dev/ttyUSB0",
            "-t",
            "host:8899",
        ]);
        assert!(result.is_err());

        let result = Args::try_parse_from(["aqualogic-mqtt", "--simulate", "-t", "host:8899"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_enable_repeatable() {
        let args = Args::try_parse_from([
            "aqualogic-mqtt",
            "--simulate",
            "-e",
            "l",
            "f",
            "-e",
            "t_p",
        ])
        .unwrap();
        assert_eq!(args.enable, vec!["l", "f", "t_p"]);
    }

    #[test]
    fn test_enable_rejects_unknown() {
        let result = Args::try_parse_from(["aqualogic-mqtt", "--simulate", "-e", "nope"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_version_and_transport() {
        let args = Args::try_parse_from([
            "aqualogic-mqtt",
            "--simulate",
            "--mqtt-version",
            "3",
            "--mqtt-transport",
            "websockets",
        ])
        .unwrap();
        assert_eq!(args.mqtt_version, Some(ProtocolVersion::V311));
        assert_eq!(args.mqtt_transport, Some(TransportKind::Websockets));

        let result = Args::try_parse_from(["aqualogic-mqtt", "--mqtt-version", "4"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_password_from_env() {
        // SAFETY: no other test sets AQUALOGIC_MQTT_PASSWORD.
        unsafe { std::env::set_var("AQUALOGIC_MQTT_PASSWORD", "from-env") };

        let from_env = Args::try_parse_from(["aqualogic-mqtt", "--simulate"]);
        let from_flag = Args::try_parse_from([
            "aqualogic-mqtt",
            "--simulate",
            "--mqtt-password",
            "from-flag",
        ]);

        unsafe { std::env::remove_var("AQUALOGIC_MQTT_PASSWORD") };

        assert_eq!(from_env.unwrap().mqtt_password.as_deref(), Some("from-env"));
        assert_eq!(
            from_flag.unwrap().mqtt_password.as_deref(),
            Some("from-flag")
        );
    }

    #[test]
    fn test_entity_listing() {
        let listing = Args::entity_listing();
        assert!(listing.contains("t_p"));
        assert!(listing.contains("Super Chlorinate"));
    }
}
