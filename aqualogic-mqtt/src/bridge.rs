//! Bridge runner.
//!
//! Wires the panel driver and the MQTT supervisor together. Both run as their
//! own tasks (the panel loop on a blocking thread) and feed a single ordered
//! event channel. The bridge consumes that channel, so the message registry
//! and the last published state are only ever touched from one place.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use aqualogic_common::PanelSnapshot;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{BridgeError, Result};
use crate::monitor::{PanelLiveness, PanelMonitor, PanelStatus};
use crate::panel::{PanelCommander, PanelDriver, PanelError, StatusSink};
use crate::registry::MessageRegistry;
use crate::supervisor::{ConnectionState, ConnectionSupervisor, MqttEvent};
use crate::translator::{
    Instruction, PAYLOAD_OFFLINE, PAYLOAD_ONLINE, STATE_QOS, StateMessage, StateTranslator,
};
use crate::transport::{MqttClient, MqttTransport, Qos};

/// Capacity of the shared event channel.
const EVENT_CAPACITY: usize = 256;

/// Upper bound on waiting for each task during shutdown.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Activity reported by the panel driver.
#[derive(Debug, Clone, PartialEq)]
pub enum PanelEvent {
    /// Decoded state change.
    Changed(PanelSnapshot),
    /// Display line update.
    TextUpdated {
        text: String,
        check_system_message: Option<String>,
    },
}

/// Everything the bridge reacts to, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Panel(PanelEvent),
    Mqtt(MqttEvent),
}

impl From<MqttEvent> for BridgeEvent {
    fn from(event: MqttEvent) -> Self {
        BridgeEvent::Mqtt(event)
    }
}

/// Status sink forwarding display updates into the bridge channel.
///
/// Stops the driver once the bridge has gone away.
pub struct ChannelSink {
    events: mpsc::Sender<BridgeEvent>,
}

impl StatusSink for ChannelSink {
    fn text_updated(&mut self, panel: &PanelSnapshot, text: &str) -> ControlFlow<()> {
        let event = BridgeEvent::Panel(PanelEvent::TextUpdated {
            text: text.to_string(),
            check_system_message: panel.check_system_message().map(str::to_string),
        });
        match self.events.blocking_send(event) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }
}

/// How often the heartbeat watchdog runs for a given timeout.
fn watchdog_period(timeout: Duration) -> Duration {
    (timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1))
}

/// The bridge between one panel and one MQTT session.
pub struct Bridge<C: MqttClient> {
    translator: StateTranslator,
    monitor: PanelMonitor,
    liveness: Arc<PanelLiveness>,
    heartbeat_timeout: Duration,
    client: C,
    events: mpsc::Sender<BridgeEvent>,
    inbox: mpsc::Receiver<BridgeEvent>,
    last_snapshot: Option<PanelSnapshot>,
    last_state: Option<StateMessage>,
}

impl<C: MqttClient> Bridge<C> {
    pub fn new(
        translator: StateTranslator,
        registry: MessageRegistry,
        client: C,
        heartbeat_timeout: Duration,
    ) -> Self {
        let (events, inbox) = mpsc::channel(EVENT_CAPACITY);
        let liveness = Arc::new(PanelLiveness::new());
        let mut monitor = PanelMonitor::new(registry);
        monitor.add_delegate(Box::new(Arc::clone(&liveness)));

        Self {
            translator,
            monitor,
            liveness,
            heartbeat_timeout,
            client,
            events,
            inbox,
            last_snapshot: None,
            last_state: None,
        }
    }

    /// Status sink to hand to the panel driver when connecting it.
    pub fn status_sink(&self) -> Box<dyn StatusSink> {
        Box::new(ChannelSink {
            events: self.events.clone(),
        })
    }

    pub fn liveness(&self) -> Arc<PanelLiveness> {
        Arc::clone(&self.liveness)
    }

    /// Run until `shutdown` flips to true or either side fails for good.
    ///
    /// `supervisor` must already be connected.
    pub async fn run<T, D>(
        mut self,
        supervisor: ConnectionSupervisor<T>,
        driver: D,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()>
    where
        T: MqttTransport<Client = C>,
        D: PanelDriver,
    {
        let commander = driver.commander();
        let mqtt_state = supervisor.state_receiver();

        let stop = Arc::new(AtomicBool::new(false));
        let mut panel_task = {
            let events = self.events.clone();
            let stop = Arc::clone(&stop);
            tokio::task::spawn_blocking(move || {
                driver.process(&mut |snapshot| {
                    if stop.load(Ordering::Relaxed) {
                        return ControlFlow::Break(());
                    }
                    let event = BridgeEvent::Panel(PanelEvent::Changed(snapshot.clone()));
                    match events.blocking_send(event) {
                        Ok(()) => ControlFlow::Continue(()),
                        Err(_) => ControlFlow::Break(()),
                    }
                })
            })
        };

        let (stop_mqtt, stop_mqtt_rx) = watch::channel(false);
        let mut mqtt_task = tokio::spawn(supervisor.run(self.events.clone(), stop_mqtt_rx));

        let mut watchdog = tokio::time::interval(watchdog_period(self.heartbeat_timeout));
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            state_topic = %self.translator.state_topic(),
            entities = self.translator.entities().len(),
            "Bridge running"
        );

        let mut mqtt_done = false;
        let mut panel_done = false;

        let outcome: Result<()> = loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Received shutdown signal");
                        break Ok(());
                    }
                }
                Some(event) = self.inbox.recv() => {
                    self.handle_event(event, &commander, &mqtt_state).await;
                }
                result = &mut mqtt_task => {
                    mqtt_done = true;
                    break match result {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(e.into()),
                        Err(e) => Err(BridgeError::worker(format!("MQTT task failed: {}", e))),
                    };
                }
                result = &mut panel_task => {
                    panel_done = true;
                    break match result {
                        Ok(Ok(())) => Err(PanelError::Closed.into()),
                        Ok(Err(e)) => Err(e.into()),
                        Err(e) => Err(BridgeError::worker(format!("panel task failed: {}", e))),
                    };
                }
                _ = watchdog.tick() => {
                    self.check_liveness(&mqtt_state).await;
                }
            }
        };

        if let Err(e) = &outcome {
            error!(error = %e, "Bridge stopping");
        }

        // Availability goes out before the supervisor sends DISCONNECT.
        if !mqtt_done && is_connected(&mqtt_state) {
            self.publish_availability(PAYLOAD_OFFLINE).await;
        }

        stop.store(true, Ordering::Relaxed);
        self.inbox.close();
        let _ = stop_mqtt.send(true);

        if !mqtt_done {
            match tokio::time::timeout(JOIN_TIMEOUT, &mut mqtt_task).await {
                Ok(Ok(Err(e))) => warn!(error = %e, "MQTT session ended with error"),
                Ok(_) => {}
                Err(_) => warn!("Timed out waiting for MQTT session to close"),
            }
        }
        if !panel_done {
            match tokio::time::timeout(JOIN_TIMEOUT, &mut panel_task).await {
                Ok(Ok(Err(e))) => warn!(error = %e, "Panel loop ended with error"),
                Ok(_) => {}
                Err(_) => warn!("Timed out waiting for panel loop to stop"),
            }
        }

        info!(
            panel_updates = self.liveness.updates(),
            registry_entries = self.monitor.registry().len(),
            "Bridge stopped"
        );
        outcome
    }

    async fn handle_event<P: PanelCommander>(
        &mut self,
        event: BridgeEvent,
        commander: &P,
        mqtt_state: &watch::Receiver<ConnectionState>,
    ) {
        match event {
            BridgeEvent::Panel(PanelEvent::Changed(snapshot)) => {
                self.monitor.handle_panel_changed(&snapshot);
                self.last_snapshot = Some(snapshot);
                if is_connected(mqtt_state) {
                    self.publish_state(true).await;
                }
            }
            BridgeEvent::Panel(PanelEvent::TextUpdated {
                text,
                check_system_message,
            }) => {
                self.monitor
                    .text_updated(&text, check_system_message.as_deref(), Instant::now());
                self.check_liveness(mqtt_state).await;
                // Text-derived values may have changed without a state change.
                if is_connected(mqtt_state) {
                    self.publish_state(false).await;
                }
            }
            BridgeEvent::Mqtt(MqttEvent::Connected) => {
                let availability = match self.liveness.status() {
                    PanelStatus::Online => PAYLOAD_ONLINE,
                    PanelStatus::Stale => PAYLOAD_OFFLINE,
                };
                self.publish_availability(availability).await;
                self.publish_discovery().await;
                self.publish_state(true).await;
            }
            BridgeEvent::Mqtt(MqttEvent::Message { topic, payload }) => {
                match self.translator.handle_inbound_message(&topic, &payload) {
                    Some(Instruction::SetState {
                        entity,
                        state,
                        enabled,
                    }) => {
                        info!(entity = %entity, state = %state, enabled, "Setting panel state");
                        if let Err(e) = commander.set_state(state, enabled) {
                            error!(entity = %entity, error = %e, "Failed to set panel state");
                        }
                    }
                    Some(Instruction::RepublishDiscovery) => {
                        debug!("Home Assistant came online, republishing discovery");
                        self.publish_discovery().await;
                    }
                    None => debug!(topic = %topic, "Ignoring inbound message"),
                }
            }
        }
    }

    async fn check_liveness(&self, mqtt_state: &watch::Receiver<ConnectionState>) {
        match self
            .liveness
            .check(Instant::now(), self.heartbeat_timeout)
        {
            Some(PanelStatus::Stale) => {
                warn!(
                    timeout_secs = self.heartbeat_timeout.as_secs_f64(),
                    "No panel updates, marking unavailable"
                );
                if is_connected(mqtt_state) {
                    self.publish_availability(PAYLOAD_OFFLINE).await;
                }
            }
            Some(PanelStatus::Online) => {
                info!("Panel updates resumed");
                if is_connected(mqtt_state) {
                    self.publish_availability(PAYLOAD_ONLINE).await;
                }
            }
            None => {}
        }
    }

    /// Publish the state for the last snapshot.
    ///
    /// Unless `force` is set, nothing is sent when the payload is unchanged.
    async fn publish_state(&mut self, force: bool) {
        let Some(snapshot) = &self.last_snapshot else {
            return;
        };
        let state = self
            .translator
            .build_state_message(snapshot, self.monitor.registry());
        if !force && self.last_state.as_ref() == Some(&state) {
            return;
        }

        let topic = self.translator.state_topic();
        match self.translator.encode_state(&state) {
            Ok(payload) => {
                if self.publish(&topic, STATE_QOS, false, payload).await {
                    self.last_state = Some(state);
                }
            }
            Err(e) => error!(error = %e, "Failed to encode state"),
        }
    }

    async fn publish_discovery(&self) {
        let topic = self.translator.discovery_topic();
        match self.translator.encode_discovery() {
            Ok(payload) => {
                self.publish(&topic, STATE_QOS, false, payload).await;
            }
            Err(e) => error!(error = %e, "Failed to encode discovery descriptor"),
        }
    }

    async fn publish_availability(&self, payload: &str) {
        let topic = self.translator.availability_topic();
        self.publish(&topic, Qos::AtLeastOnce, true, payload.as_bytes().to_vec())
            .await;
    }

    /// Publish, logging failures. A failed publish is corrected by the next one.
    async fn publish(&self, topic: &str, qos: Qos, retain: bool, payload: Vec<u8>) -> bool {
        let bytes = payload.len();
        match self.client.publish(topic, qos, retain, payload).await {
            Ok(()) => {
                debug!(topic = %topic, bytes, "Published");
                true
            }
            Err(e) => {
                let err = BridgeError::Publish {
                    topic: topic.to_string(),
                    message: e.to_string(),
                };
                warn!(error = %err, "Publish failed");
                false
            }
        }
    }
}

fn is_connected(state: &watch::Receiver<ConnectionState>) -> bool {
    *state.borrow() == ConnectionState::Connected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watchdog_period() {
        assert_eq!(watchdog_period(Duration::from_secs(60)), Duration::from_secs(1));
        assert_eq!(
            watchdog_period(Duration::from_millis(200)),
            Duration::from_millis(50)
        );
        assert_eq!(
            watchdog_period(Duration::from_millis(1)),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn test_channel_sink_forwards_and_stops() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut sink = ChannelSink { events: tx };
        let panel = PanelSnapshot::new().with_check_system_message("Low Salt");

        assert_eq!(sink.text_updated(&panel, "Low Salt"), ControlFlow::Continue(()));
        assert_eq!(
            rx.try_recv().unwrap(),
            BridgeEvent::Panel(PanelEvent::TextUpdated {
                text: "Low Salt".to_string(),
                check_system_message: Some("Low Salt".to_string()),
            })
        );

        drop(rx);
        assert_eq!(sink.text_updated(&panel, "Pool Temp 80°F"), ControlFlow::Break(()));
    }
}
