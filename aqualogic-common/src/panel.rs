//! Panel state model.
//!
//! A [`PanelSnapshot`] is the read-only view of the panel handed to the bridge
//! on every state change: boolean control states, numeric sensor readings and
//! the raw free-text status line currently on the display.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Boolean states reported by the panel.
///
/// Every variant except [`PanelState::CheckSystem`] can also be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelState {
    CheckSystem,
    Lights,
    Filter,
    Aux1,
    Aux2,
    Aux3,
    Aux4,
    Aux5,
    Aux6,
    Aux7,
    Aux8,
    Aux9,
    Aux10,
    Aux11,
    Aux12,
    Aux13,
    Aux14,
    Spillover,
    Valve3,
    Valve4,
    Heater1,
    HeaterAutoMode,
    SuperChlorinate,
}

impl PanelState {
    /// All states, in display order.
    pub const ALL: [PanelState; 23] = [
        PanelState::CheckSystem,
        PanelState::Lights,
        PanelState::Filter,
        PanelState::Aux1,
        PanelState::Aux2,
        PanelState::Aux3,
        PanelState::Aux4,
        PanelState::Aux5,
        PanelState::Aux6,
        PanelState::Aux7,
        PanelState::Aux8,
        PanelState::Aux9,
        PanelState::Aux10,
        PanelState::Aux11,
        PanelState::Aux12,
        PanelState::Aux13,
        PanelState::Aux14,
        PanelState::Spillover,
        PanelState::Valve3,
        PanelState::Valve4,
        PanelState::Heater1,
        PanelState::HeaterAutoMode,
        PanelState::SuperChlorinate,
    ];

    /// Get the state name as used in logs and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            PanelState::CheckSystem => "check_system",
            PanelState::Lights => "lights",
            PanelState::Filter => "filter",
            PanelState::Aux1 => "aux1",
            PanelState::Aux2 => "aux2",
            PanelState::Aux3 => "aux3",
            PanelState::Aux4 => "aux4",
            PanelState::Aux5 => "aux5",
            PanelState::Aux6 => "aux6",
            PanelState::Aux7 => "aux7",
            PanelState::Aux8 => "aux8",
            PanelState::Aux9 => "aux9",
            PanelState::Aux10 => "aux10",
            PanelState::Aux11 => "aux11",
            PanelState::Aux12 => "aux12",
            PanelState::Aux13 => "aux13",
            PanelState::Aux14 => "aux14",
            PanelState::Spillover => "spillover",
            PanelState::Valve3 => "valve3",
            PanelState::Valve4 => "valve4",
            PanelState::Heater1 => "heater1",
            PanelState::HeaterAutoMode => "heater_auto_mode",
            PanelState::SuperChlorinate => "super_chlorinate",
        }
    }

    /// Whether the panel accepts set requests for this state.
    pub fn is_settable(&self) -> bool {
        !matches!(self, PanelState::CheckSystem)
    }
}

impl fmt::Display for PanelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Numeric readings reported by the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorAttr {
    AirTemp,
    PoolTemp,
    SpaTemp,
    PoolChlorinator,
    SpaChlorinator,
    SaltLevel,
    PumpSpeed,
    PumpPower,
}

impl SensorAttr {
    pub const ALL: [SensorAttr; 8] = [
        SensorAttr::AirTemp,
        SensorAttr::PoolTemp,
        SensorAttr::SpaTemp,
        SensorAttr::PoolChlorinator,
        SensorAttr::SpaChlorinator,
        SensorAttr::SaltLevel,
        SensorAttr::PumpSpeed,
        SensorAttr::PumpPower,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorAttr::AirTemp => "air_temp",
            SensorAttr::PoolTemp => "pool_temp",
            SensorAttr::SpaTemp => "spa_temp",
            SensorAttr::PoolChlorinator => "pool_chlorinator",
            SensorAttr::SpaChlorinator => "spa_chlorinator",
            SensorAttr::SaltLevel => "salt_level",
            SensorAttr::PumpSpeed => "pump_speed",
            SensorAttr::PumpPower => "pump_power",
        }
    }
}

impl fmt::Display for SensorAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of the panel at the moment of a change notification.
///
/// Sensors the panel has not reported yet are absent and read as `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PanelSnapshot {
    /// States that are currently on.
    #[serde(default)]
    states: BTreeSet<PanelState>,

    /// Last reported sensor readings.
    #[serde(default)]
    sensors: BTreeMap<SensorAttr, f64>,

    /// Check-system message currently shown on the display, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    check_system_message: Option<String>,
}

impl PanelSnapshot {
    /// Create an empty snapshot (everything off, no readings).
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style state setter.
    pub fn with_state(mut self, state: PanelState, on: bool) -> Self {
        self.set_state(state, on);
        self
    }

    /// Builder-style sensor setter.
    pub fn with_sensor(mut self, attr: SensorAttr, value: f64) -> Self {
        self.set_sensor(attr, value);
        self
    }

    /// Builder-style check-system message setter.
    pub fn with_check_system_message(mut self, message: impl Into<String>) -> Self {
        self.check_system_message = Some(message.into());
        self
    }

    pub fn get_state(&self, state: PanelState) -> bool {
        self.states.contains(&state)
    }

    pub fn set_state(&mut self, state: PanelState, on: bool) {
        if on {
            self.states.insert(state);
        } else {
            self.states.remove(&state);
        }
    }

    pub fn sensor(&self, attr: SensorAttr) -> Option<f64> {
        self.sensors.get(&attr).copied()
    }

    pub fn set_sensor(&mut self, attr: SensorAttr, value: f64) {
        self.sensors.insert(attr, value);
    }

    pub fn clear_sensor(&mut self, attr: SensorAttr) {
        self.sensors.remove(&attr);
    }

    /// Raw check-system message as decoded from the display.
    pub fn check_system_message(&self) -> Option<&str> {
        self.check_system_message.as_deref()
    }

    pub fn set_check_system_message(&mut self, message: Option<String>) {
        self.check_system_message = message;
    }

    /// Iterate over the states that are on.
    pub fn active_states(&self) -> impl Iterator<Item = PanelState> + '_ {
        self.states.iter().copied()
    }
}
