//! Simulated panel.
//!
//! Produces time-varying readings and a cycling display stream so the bridge
//! can run end-to-end without hardware. Every few minutes of simulated time a
//! check-system alert is raised for a while and then cleared.

use std::f64::consts::PI;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aqualogic_common::{PanelSnapshot, PanelState, SensorAttr};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::panel::{PanelCommander, PanelDriver, PanelError, PanelSource, StatusSink};

/// Ticks between the start of two alerts.
const ALERT_PERIOD: u64 = 120;
/// Ticks an alert stays active.
const ALERT_LENGTH: u64 = 20;
/// Alerts raised in turn.
const ALERTS: [&str; 3] = ["Low Salt", "No Flow", "Check Cell"];

/// Simulated panel driver.
pub struct SimulatedPanel {
    snapshot: Arc<Mutex<PanelSnapshot>>,
    sink: Box<dyn StatusSink>,
    rng: SmallRng,
    tick: u64,
    interval: Duration,
}

impl SimulatedPanel {
    /// Create a simulator with a fixed seed (reproducible readings).
    pub fn with_seed(interval: Duration, seed: u64, sink: Box<dyn StatusSink>) -> Self {
        Self::build(interval, SmallRng::seed_from_u64(seed), sink)
    }

    fn build(interval: Duration, rng: SmallRng, sink: Box<dyn StatusSink>) -> Self {
        let snapshot = PanelSnapshot::new()
            .with_state(PanelState::Filter, true)
            .with_state(PanelState::HeaterAutoMode, true);
        Self {
            snapshot: Arc::new(Mutex::new(snapshot)),
            sink,
            rng,
            tick: 0,
            interval,
        }
    }

    /// Advance the simulation by one tick.
    ///
    /// Returns the new snapshot and the display line for this tick.
    fn step(&mut self) -> Result<(PanelSnapshot, String), PanelError> {
        let tick = self.tick;
        self.tick += 1;

        let mut snapshot = self
            .snapshot
            .lock()
            .map_err(|_| PanelError::Protocol("simulator state poisoned".to_string()))?;

        // Slow daily-ish swing plus a little noise.
        let phase = (tick as f64 / 600.0) * 2.0 * PI;
        let air = 72.0 + 8.0 * phase.sin() + self.rng.random_range(-0.5..0.5);
        let pool = 80.0 + 2.0 * (phase - PI / 4.0).sin();
        let spa = if snapshot.get_state(PanelState::Heater1) {
            102.0
        } else {
            pool + 1.0
        };
        snapshot.set_sensor(SensorAttr::AirTemp, air.round());
        snapshot.set_sensor(SensorAttr::PoolTemp, pool.round());
        snapshot.set_sensor(SensorAttr::SpaTemp, spa.round());
        snapshot.set_sensor(SensorAttr::PoolChlorinator, 50.0);
        snapshot.set_sensor(SensorAttr::SpaChlorinator, 20.0);

        let alert = (tick % ALERT_PERIOD >= ALERT_PERIOD - ALERT_LENGTH)
            .then(|| ALERTS[((tick / ALERT_PERIOD) as usize) % ALERTS.len()]);

        let salt = match alert {
            Some("Low Salt") => 2400.0,
            _ => 3200.0 + f64::from(self.rng.random_range(-50i32..=50) * 10),
        };
        snapshot.set_sensor(SensorAttr::SaltLevel, salt);

        let flowing = snapshot.get_state(PanelState::Filter) && alert != Some("No Flow");
        if flowing {
            let speed = f64::from(self.rng.random_range(60u32..=65));
            snapshot.set_sensor(SensorAttr::PumpSpeed, speed);
            snapshot.set_sensor(SensorAttr::PumpPower, (speed * 12.5).round());
        } else {
            snapshot.set_sensor(SensorAttr::PumpSpeed, 0.0);
            snapshot.set_sensor(SensorAttr::PumpPower, 0.0);
        }

        snapshot.set_state(PanelState::CheckSystem, alert.is_some());
        snapshot.set_check_system_message(alert.map(str::to_string));

        let text = match (alert, tick % 4) {
            (Some(message), 0 | 2) => message.to_string(),
            (Some(_), _) => "Check System".to_string(),
            (None, 0) => format!("Air Temp {:.0}°F", air),
            (None, 1) => format!("Pool Temp {:.0}°F", pool),
            (None, 2) => format!("Pool Chlorinator {}%", 50),
            (None, _) => format!("Salt Level {:.0} PPM", salt),
        };

        Ok((snapshot.clone(), text))
    }
}

/// Commander for the simulated panel.
#[derive(Clone)]
pub struct SimulatedCommander {
    snapshot: Arc<Mutex<PanelSnapshot>>,
}

impl PanelCommander for SimulatedCommander {
    fn set_state(&self, state: PanelState, enabled: bool) -> Result<(), PanelError> {
        if !state.is_settable() {
            return Err(PanelError::Protocol(format!("{} cannot be set", state)));
        }
        let mut snapshot = self
            .snapshot
            .lock()
            .map_err(|_| PanelError::Protocol("simulator state poisoned".to_string()))?;
        snapshot.set_state(state, enabled);
        tracing::debug!(state = %state, enabled, "Simulated panel state set");
        Ok(())
    }
}

impl PanelDriver for SimulatedPanel {
    type Commander = SimulatedCommander;

    fn connect(source: &PanelSource, sink: Box<dyn StatusSink>) -> Result<Self, PanelError> {
        match source {
            PanelSource::Simulated { tick_ms } => {
                tracing::info!(tick_ms, "Starting simulated panel");
                Ok(Self::build(
                    Duration::from_millis(*tick_ms),
                    SmallRng::from_os_rng(),
                    sink,
                ))
            }
            other => Err(PanelError::UnsupportedSource(other.kind().to_string())),
        }
    }

    fn commander(&self) -> SimulatedCommander {
        SimulatedCommander {
            snapshot: Arc::clone(&self.snapshot),
        }
    }

    fn process(
        mut self,
        on_change: &mut dyn FnMut(&PanelSnapshot) -> ControlFlow<()>,
    ) -> Result<(), PanelError> {
        loop {
            let (snapshot, text) = self.step()?;

            if on_change(&snapshot).is_break() {
                break;
            }
            if self.sink.text_updated(&snapshot, &text).is_break() {
                break;
            }

            std::thread::sleep(self.interval);
        }

        tracing::info!(ticks = self.tick, "Simulated panel stopped");
        Ok(())
    }
}
