//! Mapping between panel state and the MQTT topic surface.
//!
//! The translator holds only immutable data: the topic builder, the enabled
//! entities and a reverse index from command topic to control.

use std::collections::{BTreeMap, HashMap};

use aqualogic_common::{PanelState, PanelSnapshot, TopicBuilder};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::entities::{Component, EntityDescriptor, EntitySet, EntitySource};
use crate::error::Result;
use crate::registry::{MessageFilter, MessageRegistry};
use crate::transport::Qos;

/// Payload published on the availability topic while the bridge is up.
pub const PAYLOAD_ONLINE: &str = "online";

/// Payload published (and registered as last will) when the bridge is down.
pub const PAYLOAD_OFFLINE: &str = "offline";

const PAYLOAD_ON: &str = "ON";
const PAYLOAD_OFF: &str = "OFF";

/// QoS requested for state and discovery publishes.
pub const STATE_QOS: Qos = Qos::ExactlyOnce;

fn on_off(on: bool) -> &'static str {
    if on { PAYLOAD_ON } else { PAYLOAD_OFF }
}

/// Action requested by an inbound MQTT message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Set a panel state.
    SetState {
        entity: String,
        state: PanelState,
        enabled: bool,
    },
    /// Publish the discovery descriptor again.
    RepublishDiscovery,
}

/// Flat state payload: entity key to value.
pub type StateMessage = BTreeMap<String, Value>;

/// Home Assistant device discovery descriptor.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryMessage {
    pub dev: DeviceBlock,
    pub o: OriginBlock,
    pub cmps: BTreeMap<String, ComponentBlock>,
    pub stat_t: String,
    pub avty_t: String,
    pub qos: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceBlock {
    pub ids: String,
    pub name: String,
    pub mf: String,
    pub mdl: String,
    pub sn: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OriginBlock {
    pub name: String,
    pub sw: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentBlock {
    pub p: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_cla: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_meas: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub val_tpl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stat_val_tpl: Option<String>,
    pub obj_id: String,
    pub uniq_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd_t: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StateTranslator {
    topics: TopicBuilder,
    entities: EntitySet,
    /// Command topic to (entity key, panel state).
    commands: HashMap<String, (String, PanelState)>,
}

impl StateTranslator {
    pub fn new(topics: TopicBuilder, entities: EntitySet) -> Self {
        let commands = entities
            .iter()
            .filter_map(|e| {
                let state = e.control_state()?;
                Some((topics.command_topic(&e.id), (e.key.clone(), state)))
            })
            .collect();

        Self {
            topics,
            entities,
            commands,
        }
    }

    pub fn topics(&self) -> &TopicBuilder {
        &self.topics
    }

    pub fn entities(&self) -> &EntitySet {
        &self.entities
    }

    /// Topics the bridge subscribes to on every connect.
    pub fn subscription_topics(&self) -> Vec<String> {
        vec![self.topics.command_wildcard(), self.topics.status_topic()]
    }

    pub fn discovery_topic(&self) -> String {
        self.topics.discovery_topic()
    }

    pub fn state_topic(&self) -> String {
        self.topics.state_topic()
    }

    pub fn availability_topic(&self) -> String {
        self.topics.availability_topic()
    }

    /// Build the state payload at the current time.
    pub fn build_state_message(
        &self,
        snapshot: &PanelSnapshot,
        registry: &MessageRegistry,
    ) -> StateMessage {
        self.build_state_message_at(snapshot, registry, Instant::now())
    }

    /// Build the state payload.
    ///
    /// The key set is exactly the enabled entity keys; sensors the panel has
    /// not reported yet are `null`.
    pub fn build_state_message_at(
        &self,
        snapshot: &PanelSnapshot,
        registry: &MessageRegistry,
        now: Instant,
    ) -> StateMessage {
        self.entities
            .iter()
            .map(|entity| {
                let value: Value = match &entity.source {
                    EntitySource::State(state) => on_off(snapshot.get_state(*state)).into(),
                    EntitySource::Sensor(attr) => sensor_value(snapshot.sensor(*attr)),
                    EntitySource::TextPattern(pattern) => {
                        on_off(registry.has_message_at(pattern, MessageFilter::Text, now)).into()
                    }
                    EntitySource::SystemMessages => registry
                        .query_messages_at(MessageFilter::System, now)
                        .join(", ")
                        .into(),
                };
                (entity.key.clone(), value)
            })
            .collect()
    }

    /// Serialize the state payload.
    pub fn encode_state(&self, state: &StateMessage) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(state)?)
    }

    /// Build the discovery descriptor for the enabled entities.
    pub fn build_discovery_message(&self) -> DiscoveryMessage {
        let identifier = self.topics.identifier().to_string();

        let cmps = self
            .entities
            .iter()
            .map(|entity| (entity.id.clone(), self.component_block(entity)))
            .collect();

        DiscoveryMessage {
            dev: DeviceBlock {
                ids: identifier.clone(),
                name: identifier.clone(),
                mf: "Hayward".to_string(),
                mdl: "RS485".to_string(),
                sn: identifier,
            },
            o: OriginBlock {
                name: env!("CARGO_PKG_NAME").to_string(),
                sw: env!("CARGO_PKG_VERSION").to_string(),
            },
            cmps,
            stat_t: self.state_topic(),
            avty_t: self.availability_topic(),
            qos: STATE_QOS.level(),
        }
    }

    fn component_block(&self, entity: &EntityDescriptor) -> ComponentBlock {
        let template = format!("{{{{ value_json.{} }}}}", entity.key);
        let is_light = entity.component == Component::Light;

        ComponentBlock {
            p: entity.component.as_str().to_string(),
            dev_cla: entity.device_class.clone(),
            unit_of_meas: entity.unit.clone(),
            val_tpl: (!is_light).then(|| template.clone()),
            stat_val_tpl: is_light.then_some(template),
            obj_id: entity.id.clone(),
            uniq_id: entity.id.clone(),
            name: entity.name.clone(),
            cmd_t: entity
                .control_state()
                .map(|_| self.topics.command_topic(&entity.id)),
        }
    }

    /// Serialize the discovery descriptor.
    pub fn encode_discovery(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.build_discovery_message())?)
    }

    /// Translate an inbound message into at most one instruction.
    ///
    /// `"online"` on the status topic asks for discovery again. On a control's
    /// command topic, `"ON"` turns it on and anything else turns it off.
    /// Everything else is ignored.
    pub fn handle_inbound_message(&self, topic: &str, payload: &[u8]) -> Option<Instruction> {
        if topic == self.topics.status_topic() {
            return (payload == PAYLOAD_ONLINE.as_bytes()).then_some(Instruction::RepublishDiscovery);
        }

        let (key, state) = self.commands.get(topic)?;

        let enabled = match payload {
            b"ON" => true,
            b"OFF" => false,
            other => {
                tracing::warn!(
                    topic = %topic,
                    payload = %String::from_utf8_lossy(other),
                    "Unexpected command payload, treating as OFF"
                );
                false
            }
        };

        Some(Instruction::SetState {
            entity: key.clone(),
            state: *state,
            enabled,
        })
    }
}

fn sensor_value(value: Option<f64>) -> Value {
    match value {
        Some(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => Value::from(v as i64),
        Some(v) => Value::from(v),
        None => Value::Null,
    }
}
