//! Entity metadata tables.
//!
//! Every value the bridge reports or accepts is an entity with a short key
//! (used in the state payload and on the command line), a display name and the
//! Home Assistant component it maps to. The tables here are static; an
//! [`EntitySet`] is the subset enabled at startup.

use std::collections::BTreeSet;
use std::fmt;

use aqualogic_common::{PanelState, SensorAttr};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Key of the always-present check-system flag.
pub const CHECK_SYSTEM_KEY: &str = "cs";

/// Key of the derived system messages sensor.
pub const SYSTEM_MESSAGES_KEY: &str = "sys";

/// Home Assistant component kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Switch,
    Light,
    Sensor,
    BinarySensor,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Switch => "switch",
            Component::Light => "light",
            Component::Sensor => "sensor",
            Component::BinarySensor => "binary_sensor",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What an entity reads from.
#[derive(Debug, Clone, PartialEq)]
pub enum EntitySource {
    /// Boolean panel state; settable unless it is the check-system flag.
    State(PanelState),
    /// Numeric sensor reading.
    Sensor(SensorAttr),
    /// On while the normalized pattern is present in the message registry.
    TextPattern(String),
    /// Sorted unexpired system messages.
    SystemMessages,
}

/// Broad entity category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Control,
    Sensor,
    TextPattern,
}

/// Immutable description of one enabled entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDescriptor {
    pub key: String,
    pub id: String,
    pub name: String,
    pub component: Component,
    pub device_class: Option<String>,
    pub unit: Option<String>,
    pub source: EntitySource,
}

impl EntityDescriptor {
    pub fn kind(&self) -> EntityKind {
        match &self.source {
            EntitySource::State(state) if state.is_settable() => EntityKind::Control,
            EntitySource::TextPattern(_) => EntityKind::TextPattern,
            _ => EntityKind::Sensor,
        }
    }

    /// Panel state set by this entity's command topic, if it is a control.
    pub fn control_state(&self) -> Option<PanelState> {
        match self.source {
            EntitySource::State(state) if state.is_settable() => Some(state),
            _ => None,
        }
    }
}

/// A text-pattern sensor definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPatternSpec {
    /// State payload key.
    pub key: String,
    /// Display name.
    pub name: String,
    /// Substring to look for in the display text (matched case-insensitively).
    pub pattern: String,
    /// Device class reported to Home Assistant.
    #[serde(default = "default_pattern_class")]
    pub device_class: Option<String>,
}

fn default_pattern_class() -> Option<String> {
    Some("problem".to_string())
}

struct ControlRow {
    key: &'static str,
    state: PanelState,
    slug: &'static str,
    name: &'static str,
}

struct SensorRow {
    key: &'static str,
    attr: SensorAttr,
    slug: &'static str,
    name: &'static str,
    device_class: Option<&'static str>,
    unit: Option<&'static str>,
}

struct PatternRow {
    key: &'static str,
    name: &'static str,
    pattern: &'static str,
}

const fn control(
    key: &'static str,
    state: PanelState,
    slug: &'static str,
    name: &'static str,
) -> ControlRow {
    ControlRow {
        key,
        state,
        slug,
        name,
    }
}

const CONTROLS: &[ControlRow] = &[
    control("l", PanelState::Lights, "lights", "Lights"),
    control("f", PanelState::Filter, "filter", "Filter"),
    control("aux1", PanelState::Aux1, "aux_1", "Aux 1"),
    control("aux2", PanelState::Aux2, "aux_2", "Aux 2"),
    control("aux3", PanelState::Aux3, "aux_3", "Aux 3"),
    control("aux4", PanelState::Aux4, "aux_4", "Aux 4"),
    control("aux5", PanelState::Aux5, "aux_5", "Aux 5"),
    control("aux6", PanelState::Aux6, "aux_6", "Aux 6"),
    control("aux7", PanelState::Aux7, "aux_7", "Aux 7"),
    control("aux8", PanelState::Aux8, "aux_8", "Aux 8"),
    control("aux9", PanelState::Aux9, "aux_9", "Aux 9"),
    control("aux10", PanelState::Aux10, "aux_10", "Aux 10"),
    control("aux11", PanelState::Aux11, "aux_11", "Aux 11"),
    control("aux12", PanelState::Aux12, "aux_12", "Aux 12"),
    control("aux13", PanelState::Aux13, "aux_13", "Aux 13"),
    control("aux14", PanelState::Aux14, "aux_14", "Aux 14"),
    control("spill", PanelState::Spillover, "spillover", "Spillover"),
    control("v3", PanelState::Valve3, "valve_3", "Valve 3"),
    control("v4", PanelState::Valve4, "valve_4", "Valve 4"),
    control("h1", PanelState::Heater1, "heater_1", "Heater 1"),
    control(
        "hauto",
        PanelState::HeaterAutoMode,
        "heater_auto",
        "Heater Auto Mode",
    ),
    control(
        "sc",
        PanelState::SuperChlorinate,
        "super_chlorinate",
        "Super Chlorinate",
    ),
];

const SENSORS: &[SensorRow] = &[
    SensorRow {
        key: "t_a",
        attr: SensorAttr::AirTemp,
        slug: "air_temperature",
        name: "Air Temperature",
        device_class: Some("temperature"),
        unit: Some("°F"),
    },
    SensorRow {
        key: "t_p",
        attr: SensorAttr::PoolTemp,
        slug: "pool_temperature",
        name: "Pool Temperature",
        device_class: Some("temperature"),
        unit: Some("°F"),
    },
    SensorRow {
        key: "t_s",
        attr: SensorAttr::SpaTemp,
        slug: "spa_temperature",
        name: "Spa Temperature",
        device_class: Some("temperature"),
        unit: Some("°F"),
    },
    SensorRow {
        key: "cl_p",
        attr: SensorAttr::PoolChlorinator,
        slug: "pool_chlorinator",
        name: "Pool Chlorinator",
        device_class: None,
        unit: Some("%"),
    },
    SensorRow {
        key: "cl_s",
        attr: SensorAttr::SpaChlorinator,
        slug: "spa_chlorinator",
        name: "Spa Chlorinator",
        device_class: None,
        unit: Some("%"),
    },
    SensorRow {
        key: "salt",
        attr: SensorAttr::SaltLevel,
        slug: "salt_level",
        name: "Salt Level",
        device_class: None,
        unit: Some("ppm"),
    },
    SensorRow {
        key: "s_p",
        attr: SensorAttr::PumpSpeed,
        slug: "pump_speed",
        name: "Pump Speed",
        device_class: None,
        unit: None,
    },
    SensorRow {
        key: "p_p",
        attr: SensorAttr::PumpPower,
        slug: "pump_power",
        name: "Pump Power",
        device_class: Some("power"),
        unit: Some("W"),
    },
];

const PATTERNS: &[PatternRow] = &[
    PatternRow {
        key: "no_flow",
        name: "No Flow",
        pattern: "no flow",
    },
    PatternRow {
        key: "salt_lo",
        name: "Low Salt",
        pattern: "low salt",
    },
    PatternRow {
        key: "salt_hi",
        name: "High Salt",
        pattern: "high salt",
    },
    PatternRow {
        key: "chk_cell",
        name: "Check Cell",
        pattern: "check cell",
    },
    PatternRow {
        key: "freeze",
        name: "Freeze Protection",
        pattern: "freeze protection",
    },
];

/// Keys accepted by `--enable`, with their display names, in table order.
pub fn valid_entity_keys() -> Vec<(&'static str, &'static str)> {
    SENSORS
        .iter()
        .map(|s| (s.key, s.name))
        .chain(CONTROLS.iter().map(|c| (c.key, c.name)))
        .chain(std::iter::once((SYSTEM_MESSAGES_KEY, "System Messages")))
        .chain(PATTERNS.iter().map(|p| (p.key, p.name)))
        .collect()
}

/// Lower-case and collapse runs of whitespace to a single space.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// The entities enabled for this run.
///
/// The check-system flag is always present. Everything else appears only when
/// its key was enabled; configured text patterns are always enabled.
#[derive(Debug, Clone)]
pub struct EntitySet {
    identifier: String,
    entities: Vec<EntityDescriptor>,
}

impl EntitySet {
    /// Build the enabled set.
    ///
    /// Fails on unknown keys and on configured patterns whose key clashes with
    /// a built-in entity or another pattern.
    pub fn build(
        identifier: &str,
        enabled: &[String],
        extra_patterns: &[TextPatternSpec],
    ) -> Result<Self> {
        let known: BTreeSet<&str> = valid_entity_keys().into_iter().map(|(k, _)| k).collect();
        let mut wanted = BTreeSet::new();
        for key in enabled {
            if !known.contains(key.as_str()) {
                return Err(BridgeError::validation(format!(
                    "unknown entity '{}' (valid: {})",
                    key,
                    known.iter().copied().collect::<Vec<_>>().join(", ")
                )));
            }
            wanted.insert(key.as_str());
        }

        let id = |component: Component, slug: &str| {
            format!("{}_{}_{}", identifier, component, slug)
        };

        let mut entities = vec![EntityDescriptor {
            key: CHECK_SYSTEM_KEY.to_string(),
            id: id(Component::BinarySensor, "check_system"),
            name: "Check System".to_string(),
            component: Component::BinarySensor,
            device_class: Some("problem".to_string()),
            unit: None,
            source: EntitySource::State(PanelState::CheckSystem),
        }];

        for row in SENSORS.iter().filter(|r| wanted.contains(r.key)) {
            entities.push(EntityDescriptor {
                key: row.key.to_string(),
                id: id(Component::Sensor, row.slug),
                name: row.name.to_string(),
                component: Component::Sensor,
                device_class: row.device_class.map(str::to_string),
                unit: row.unit.map(str::to_string),
                source: EntitySource::Sensor(row.attr),
            });
        }

        for row in CONTROLS.iter().filter(|r| wanted.contains(r.key)) {
            let component = if row.state == PanelState::Lights {
                Component::Light
            } else {
                Component::Switch
            };
            entities.push(EntityDescriptor {
                key: row.key.to_string(),
                id: id(component, row.slug),
                name: row.name.to_string(),
                component,
                device_class: (component == Component::Switch).then(|| "switch".to_string()),
                unit: None,
                source: EntitySource::State(row.state),
            });
        }

        if wanted.contains(SYSTEM_MESSAGES_KEY) {
            entities.push(EntityDescriptor {
                key: SYSTEM_MESSAGES_KEY.to_string(),
                id: id(Component::Sensor, "system_messages"),
                name: "System Messages".to_string(),
                component: Component::Sensor,
                device_class: None,
                unit: None,
                source: EntitySource::SystemMessages,
            });
        }

        for row in PATTERNS.iter().filter(|r| wanted.contains(r.key)) {
            entities.push(pattern_entity(
                &id,
                row.key,
                row.name,
                row.pattern,
                Some("problem"),
            ));
        }

        for spec in extra_patterns {
            if entities.iter().any(|e| e.key == spec.key) || known.contains(spec.key.as_str()) {
                return Err(BridgeError::validation(format!(
                    "text pattern key '{}' is already in use",
                    spec.key
                )));
            }
            if normalize_text(&spec.pattern).is_empty() {
                return Err(BridgeError::validation(format!(
                    "text pattern '{}' has an empty pattern",
                    spec.key
                )));
            }
            entities.push(pattern_entity(
                &id,
                &spec.key,
                &spec.name,
                &spec.pattern,
                spec.device_class.as_deref(),
            ));
        }

        Ok(Self {
            identifier: identifier.to_string(),
            entities,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.entities.iter()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&EntityDescriptor> {
        self.entities.iter().find(|e| e.key == key)
    }

    /// Enabled controls, i.e. entities with a command topic.
    pub fn controls(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.entities
            .iter()
            .filter(|e| e.kind() == EntityKind::Control)
    }

    /// Normalized patterns the message registry has to watch for.
    pub fn watched_patterns(&self) -> Vec<String> {
        self.entities
            .iter()
            .filter_map(|e| match &e.source {
                EntitySource::TextPattern(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }
}

fn pattern_entity(
    id: &dyn Fn(Component, &str) -> String,
    key: &str,
    name: &str,
    pattern: &str,
    device_class: Option<&str>,
) -> EntityDescriptor {
    EntityDescriptor {
        key: key.to_string(),
        id: id(Component::BinarySensor, key),
        name: name.to_string(),
        component: Component::BinarySensor,
        device_class: device_class.map(str::to_string),
        unit: None,
        source: EntitySource::TextPattern(normalize_text(pattern)),
    }
}
