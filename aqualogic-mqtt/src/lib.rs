//! MQTT bridge for Hayward AquaLogic pool controllers.
//!
//! Publishes panel state to an MQTT broker with Home Assistant device
//! discovery and applies commands received on per-entity command topics.
//!
//! # Topics
//!
//! ```text
//! <prefix>/device/<identifier>/config          discovery descriptor
//! <prefix>/device/<identifier>/state           flat JSON state, QoS 2
//! <prefix>/device/<identifier>/availability    "online" / "offline" (retained)
//! <prefix>/device/<identifier>/<entity>/set    "ON" / "OFF" commands
//! <prefix>/status                              Home Assistant birth message
//! ```

pub mod args;
pub mod bridge;
pub mod config;
pub mod entities;
pub mod error;
pub mod mock;
pub mod monitor;
pub mod panel;
pub mod registry;
pub mod simulator;
pub mod supervisor;
pub mod translator;
pub mod transport;

pub use bridge::{Bridge, BridgeEvent, PanelEvent};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use panel::{PanelCommander, PanelDriver, PanelError, PanelSource, StatusSink};
pub use supervisor::{ConnectionState, ConnectionSupervisor, RetryPolicy, SupervisorError};
pub use translator::StateTranslator;
pub use transport::{MqttClient, MqttTransport, RumqttTransport};
