//! Panel driver seam.
//!
//! The wire protocol lives in a [`PanelDriver`]. The bridge only connects
//! it, runs its blocking processing loop and forwards state changes through
//! a [`PanelCommander`]. Display updates reach the bridge through the
//! [`StatusSink`] handed to the driver when it connects.

use std::fmt;
use std::ops::ControlFlow;

use aqualogic_common::{PanelSnapshot, PanelState};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::split_host_port;

/// Panel driver errors.
#[derive(Debug, Error)]
pub enum PanelError {
    #[error("could not connect to {source_desc}: {message}")]
    Connect {
        source_desc: String,
        message: String,
    },

    #[error("no driver available for {0} panels")]
    UnsupportedSource(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("panel connection closed")]
    Closed,
}

fn default_tick_ms() -> u64 {
    1000
}

/// Where the panel is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PanelSource {
    /// Local serial device.
    Serial { path: String },
    /// Serial-over-TCP adapter.
    Tcp { host: String, port: u16 },
    /// Built-in simulator.
    Simulated {
        #[serde(default = "default_tick_ms")]
        tick_ms: u64,
    },
}

impl PanelSource {
    /// Parse a `host:port` serial adapter address.
    pub fn parse_tcp(dest: &str) -> Result<Self, String> {
        match split_host_port(dest)? {
            (host, Some(port)) => Ok(PanelSource::Tcp { host, port }),
            (_, None) => Err(format!("missing port in panel address '{}'", dest)),
        }
    }

    pub fn simulated() -> Self {
        PanelSource::Simulated {
            tick_ms: default_tick_ms(),
        }
    }

    /// Short name of the source kind.
    pub fn kind(&self) -> &'static str {
        match self {
            PanelSource::Serial { .. } => "serial",
            PanelSource::Tcp { .. } => "tcp",
            PanelSource::Simulated { .. } => "simulated",
        }
    }
}

impl fmt::Display for PanelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PanelSource::Serial { path } => write!(f, "serial:{}", path),
            PanelSource::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp:[{}]:{}", host, port)
            }
            PanelSource::Tcp { host, port } => write!(f, "tcp:{}:{}", host, port),
            PanelSource::Simulated { tick_ms } => write!(f, "simulated ({} ms tick)", tick_ms),
        }
    }
}

/// Receives display updates from a panel driver.
///
/// Returning `Break` asks the driver to stop processing.
pub trait StatusSink: Send {
    fn text_updated(&mut self, panel: &PanelSnapshot, text: &str) -> ControlFlow<()>;
}

/// Sink that discards display updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn text_updated(&mut self, _panel: &PanelSnapshot, _text: &str) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

/// Handle for changing panel state while the driver is processing.
///
/// Implementations must return promptly; requests are queued, not awaited.
pub trait PanelCommander: Send + Sync {
    fn set_state(&self, state: PanelState, enabled: bool) -> Result<(), PanelError>;
}

/// A connected panel.
pub trait PanelDriver: Send + 'static {
    type Commander: PanelCommander + Clone + 'static;

    /// Connect to `source`. Display updates go to `sink`.
    fn connect(source: &PanelSource, sink: Box<dyn StatusSink>) -> Result<Self, PanelError>
    where
        Self: Sized;

    fn commander(&self) -> Self::Commander;

    /// Blocking processing loop.
    ///
    /// Calls `on_change` for every decoded state change and stops when
    /// either callback breaks or the connection ends.
    fn process(
        self,
        on_change: &mut dyn FnMut(&PanelSnapshot) -> ControlFlow<()>,
    ) -> Result<(), PanelError>;
}
