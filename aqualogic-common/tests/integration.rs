//! Integration tests for aqualogic-common.

use aqualogic_common::{
    LogFormat, LoggingConfig, PanelSnapshot, PanelState, SensorAttr, TopicBuilder, parse_config,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Settings {
    #[serde(default)]
    logging: LoggingConfig,
    prefix: String,
    identifier: String,
}

#[test]
fn test_config_drives_topics() {
    let settings: Settings = parse_config(
        r#"
        {
            prefix: "ha",
            identifier: "backyard",
            logging: { format: "json" },
        }
        "#,
    )
    .unwrap();

    assert_eq!(settings.logging.format, LogFormat::Json);
    assert_eq!(settings.logging.level, "info");

    let topics = TopicBuilder::new(settings.prefix, settings.identifier).unwrap();
    let command = topics.command_topic("backyard_switch_filter");

    assert_eq!(command, "ha/device/backyard/backyard_switch_filter/set");
    assert_eq!(topics.command_wildcard(), "ha/device/backyard/+/set");
}

#[test]
fn test_snapshot_json_roundtrip() {
    let snapshot = PanelSnapshot::new()
        .with_state(PanelState::Filter, true)
        .with_state(PanelState::CheckSystem, true)
        .with_sensor(SensorAttr::SaltLevel, 3100.0)
        .with_check_system_message("Low Salt");

    let json = serde_json::to_string(&snapshot).unwrap();
    let restored: PanelSnapshot = serde_json::from_str(&json).unwrap();

    assert_eq!(restored, snapshot);
    assert!(restored.get_state(PanelState::Filter));
    assert!(!restored.get_state(PanelState::Lights));
    assert_eq!(restored.sensor(SensorAttr::SaltLevel), Some(3100.0));
}
