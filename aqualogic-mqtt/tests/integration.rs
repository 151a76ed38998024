//! End-to-end tests: a scripted panel and the in-memory MQTT transport wired
//! through the real bridge.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::time::Duration;

use aqualogic_common::{PanelSnapshot, PanelState, SensorAttr, TopicBuilder};
use aqualogic_mqtt::entities::EntitySet;
use aqualogic_mqtt::mock::{MockBroker, MockTransport, Published};
use aqualogic_mqtt::panel::{PanelCommander, PanelDriver, PanelError, PanelSource, StatusSink};
use aqualogic_mqtt::registry::MessageRegistry;
use aqualogic_mqtt::supervisor::SupervisorError;
use aqualogic_mqtt::transport::Qos;
use aqualogic_mqtt::{Bridge, BridgeError, ConnectionSupervisor, RetryPolicy, StateTranslator};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;

enum Step {
    Change(PanelSnapshot),
    Text(PanelSnapshot, &'static str),
}

type CommandLog = Arc<Mutex<Vec<(PanelState, bool)>>>;

/// Panel driver that replays steps sent from the test.
struct ScriptedPanel {
    steps: std_mpsc::Receiver<Step>,
    sink: Box<dyn StatusSink>,
    commands: CommandLog,
}

impl ScriptedPanel {
    fn new(sink: Box<dyn StatusSink>) -> (Self, std_mpsc::Sender<Step>) {
        let (tx, rx) = std_mpsc::channel();
        let panel = Self {
            steps: rx,
            sink,
            commands: CommandLog::default(),
        };
        (panel, tx)
    }
}

#[derive(Clone)]
struct ScriptedCommander(CommandLog);

impl PanelCommander for ScriptedCommander {
    fn set_state(&self, state: PanelState, enabled: bool) -> Result<(), PanelError> {
        self.0.lock().unwrap().push((state, enabled));
        Ok(())
    }
}

impl PanelDriver for ScriptedPanel {
    type Commander = ScriptedCommander;

    fn connect(_source: &PanelSource, sink: Box<dyn StatusSink>) -> Result<Self, PanelError> {
        Ok(Self::new(sink).0)
    }

    fn commander(&self) -> ScriptedCommander {
        ScriptedCommander(Arc::clone(&self.commands))
    }

    fn process(
        mut self,
        on_change: &mut dyn FnMut(&PanelSnapshot) -> ControlFlow<()>,
    ) -> Result<(), PanelError> {
        for step in self.steps.iter() {
            let flow = match step {
                Step::Change(snapshot) => on_change(&snapshot),
                Step::Text(snapshot, text) => self.sink.text_updated(&snapshot, text),
            };
            if flow.is_break() {
                break;
            }
        }
        Ok(())
    }
}

struct Harness {
    broker: MockBroker,
    topics: TopicBuilder,
    entities: EntitySet,
    steps: std_mpsc::Sender<Step>,
    commands: CommandLog,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<aqualogic_mqtt::Result<()>>,
}

async fn start(enabled: &[&str], heartbeat_timeout: Duration, policy: RetryPolicy) -> Harness {
    let topics = TopicBuilder::new("homeassistant", "pool").unwrap();
    let enabled: Vec<String> = enabled.iter().map(|s| s.to_string()).collect();
    let entities = EntitySet::build("pool", &enabled, &[]).unwrap();
    let registry =
        MessageRegistry::new(Duration::from_secs(60), entities.watched_patterns()).unwrap();
    let translator = StateTranslator::new(topics.clone(), entities.clone());

    let (transport, broker) = MockTransport::new();
    let mut supervisor =
        ConnectionSupervisor::new(transport, translator.subscription_topics(), policy);
    broker.accept();
    supervisor.connect().await.unwrap();

    let bridge = Bridge::new(translator, registry, supervisor.client(), heartbeat_timeout);
    let (panel, steps) = ScriptedPanel::new(bridge.status_sink());
    let commands = Arc::clone(&panel.commands);

    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(bridge.run(supervisor, panel, shutdown_rx));

    let harness = Harness {
        broker,
        topics,
        entities,
        steps,
        commands,
        shutdown,
        handle,
    };
    let discovery = harness.topics.discovery_topic();
    eventually("initial discovery", || {
        !harness.broker.published_to(&discovery).is_empty()
    })
    .await;
    harness
}

async fn eventually(what: &str, mut done: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

fn json_of(published: &Published) -> Value {
    serde_json::from_slice(&published.payload).unwrap()
}

impl Harness {
    fn states(&self) -> Vec<Value> {
        self.broker
            .published_to(&self.topics.state_topic())
            .iter()
            .map(json_of)
            .collect()
    }

    fn availability(&self) -> Vec<String> {
        self.broker
            .published_to(&self.topics.availability_topic())
            .iter()
            .map(|p| p.payload_str().to_string())
            .collect()
    }

    fn command_topic(&self, key: &str) -> String {
        let entity = self.entities.get(key).unwrap();
        self.topics.command_topic(&entity.id)
    }

    async fn stop(self) -> (MockBroker, aqualogic_mqtt::Result<()>) {
        self.shutdown.send(true).unwrap();
        drop(self.steps);
        let result = self.handle.await.unwrap();
        (self.broker, result)
    }
}

async fn default_start(enabled: &[&str]) -> Harness {
    start(enabled, Duration::from_secs(60), RetryPolicy::default()).await
}

#[tokio::test]
async fn test_connect_publishes_availability_then_discovery() {
    let harness = default_start(&["l", "f", "t_p"]).await;

    let published = harness.broker.published();
    assert_eq!(published[0].topic, harness.topics.availability_topic());
    assert_eq!(published[0].payload_str(), "online");
    assert!(published[0].retain);
    assert_eq!(published[1].topic, harness.topics.discovery_topic());

    let discovery = json_of(&published[1]);
    assert_eq!(discovery["stat_t"], "homeassistant/device/pool/state");
    assert_eq!(discovery["avty_t"], "homeassistant/device/pool/availability");
    assert_eq!(discovery["cmps"].as_object().unwrap().len(), 4);

    let subscribed: Vec<String> = harness
        .broker
        .subscribed()
        .into_iter()
        .map(|(topic, _)| topic)
        .collect();
    assert_eq!(
        subscribed,
        vec!["homeassistant/device/pool/+/set", "homeassistant/status"]
    );

    // Nothing to report until the panel speaks.
    assert!(harness.states().is_empty());
    let (_, result) = harness.stop().await;
    tokio_test::assert_ok!(result);
}

#[tokio::test]
async fn test_panel_change_publishes_state() {
    let harness = default_start(&["l", "f", "t_p", "t_a"]).await;

    let snapshot = PanelSnapshot::new()
        .with_state(PanelState::Lights, true)
        .with_sensor(SensorAttr::PoolTemp, 80.0);
    harness.steps.send(Step::Change(snapshot)).unwrap();

    eventually("state publish", || !harness.states().is_empty()).await;
    assert_eq!(
        harness.states()[0],
        json!({ "cs": "OFF", "l": "ON", "f": "OFF", "t_p": 80, "t_a": null })
    );

    let published = harness.broker.published_to(&harness.topics.state_topic());
    assert_eq!(published[0].qos, Qos::ExactlyOnce);
    assert!(!published[0].retain);

    let (_, result) = harness.stop().await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_display_text_drives_derived_sensors() {
    let harness = default_start(&["sys", "salt_lo", "no_flow"]).await;

    let alert = PanelSnapshot::new()
        .with_state(PanelState::CheckSystem, true)
        .with_check_system_message("Low Salt");
    harness.steps.send(Step::Change(alert.clone())).unwrap();
    harness.steps.send(Step::Text(alert, "Low Salt")).unwrap();

    eventually("derived sensors", || {
        harness
            .states()
            .last()
            .is_some_and(|s| s["salt_lo"] == "ON")
    })
    .await;

    let states = harness.states();
    assert_eq!(
        states[0],
        json!({ "cs": "ON", "sys": "", "salt_lo": "OFF", "no_flow": "OFF" })
    );
    assert_eq!(
        states.last().unwrap(),
        &json!({ "cs": "ON", "sys": "Low Salt", "salt_lo": "ON", "no_flow": "OFF" })
    );

    // Same text again changes nothing, so nothing new goes out.
    let before = states.len();
    let quiet = PanelSnapshot::new()
        .with_state(PanelState::CheckSystem, true)
        .with_check_system_message("Low Salt");
    harness.steps.send(Step::Text(quiet, "Low Salt")).unwrap();
    harness
        .steps
        .send(Step::Change(PanelSnapshot::new()))
        .unwrap();
    eventually("next state", || harness.states().len() > before).await;
    assert_eq!(harness.states().len(), before + 1);

    let (_, result) = harness.stop().await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_commands_reach_panel() {
    let harness = default_start(&["l", "f"]).await;

    harness
        .broker
        .deliver(&harness.command_topic("l"), b"ON");
    harness
        .broker
        .deliver(&harness.command_topic("f"), b"maybe");
    harness
        .broker
        .deliver("homeassistant/device/pool/unknown/set", b"ON");

    eventually("commands", || harness.commands.lock().unwrap().len() == 2).await;
    assert_eq!(
        *harness.commands.lock().unwrap(),
        vec![(PanelState::Lights, true), (PanelState::Filter, false)]
    );

    let (_, result) = harness.stop().await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_birth_message_republishes_discovery() {
    let harness = default_start(&["l"]).await;
    let discovery = harness.topics.discovery_topic();

    harness.broker.deliver("homeassistant/status", b"offline");
    harness.broker.deliver("homeassistant/status", b"online");

    eventually("second discovery", || {
        harness.broker.published_to(&discovery).len() == 2
    })
    .await;

    let (_, result) = harness.stop().await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_reconnect_republishes_last_state() {
    let policy = RetryPolicy {
        max_retries: 3,
        initial_wait: Duration::from_millis(10),
        max_wait: Duration::from_millis(10),
    };
    let harness = start(&["l"], Duration::from_secs(60), policy).await;

    harness
        .steps
        .send(Step::Change(
            PanelSnapshot::new().with_state(PanelState::Lights, true),
        ))
        .unwrap();
    eventually("state publish", || harness.states().len() == 1).await;

    harness.broker.drop_connection("network unreachable");
    harness.broker.accept();

    eventually("republish", || harness.states().len() == 2).await;
    assert_eq!(harness.availability(), vec!["online", "online"]);
    assert_eq!(harness.states()[1], json!({ "cs": "OFF", "l": "ON" }));
    assert_eq!(harness.broker.subscribed().len(), 4);

    let (_, result) = harness.stop().await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_shutdown_publishes_offline_then_disconnects() {
    let harness = default_start(&["l"]).await;

    let (broker, result) = harness.stop().await;
    tokio_test::assert_ok!(result);

    let availability: Vec<_> = broker
        .published_to("homeassistant/device/pool/availability")
        .into_iter()
        .map(|p| (p.payload_str().to_string(), p.retain))
        .collect();
    assert_eq!(
        availability,
        vec![("online".to_string(), true), ("offline".to_string(), true)]
    );
    assert_eq!(broker.disconnects(), 1);
}

#[tokio::test]
async fn test_panel_loss_is_fatal() {
    let harness = default_start(&["l"]).await;

    drop(harness.steps);
    let result = harness.handle.await.unwrap();

    assert!(matches!(
        result,
        Err(BridgeError::Panel(PanelError::Closed))
    ));
    assert_eq!(harness.broker.disconnects(), 1);
    let last = harness
        .broker
        .published_to("homeassistant/device/pool/availability")
        .pop()
        .unwrap();
    assert_eq!(last.payload_str(), "offline");
}

#[tokio::test]
async fn test_mqtt_retries_exhausted_is_fatal() {
    let policy = RetryPolicy {
        max_retries: 1,
        initial_wait: Duration::from_millis(10),
        max_wait: Duration::from_millis(10),
    };
    let harness = start(&["l"], Duration::from_secs(60), policy).await;

    harness.broker.drop_connection("connection reset");
    harness.broker.drop_connection("connection refused");
    eventually("give up", || harness.broker.disconnects() == 1).await;
    drop(harness.steps);

    let result = harness.handle.await.unwrap();
    let err = tokio_test::assert_err!(result);
    assert!(matches!(
        err,
        BridgeError::MqttConnection(SupervisorError::RetriesExhausted { attempts: 1, .. })
    ));
    assert!(err.to_string().starts_with("MQTT connection failed"));
}

#[tokio::test]
async fn test_silent_panel_marked_unavailable() {
    let harness = start(&["l"], Duration::from_millis(100), RetryPolicy::default()).await;

    eventually("stale", || harness.availability().len() == 2).await;
    assert_eq!(harness.availability(), vec!["online", "offline"]);

    harness
        .steps
        .send(Step::Text(PanelSnapshot::new(), "Pool Temp 80°F"))
        .unwrap();
    eventually("back online", || harness.availability().len() == 3).await;
    assert_eq!(harness.availability()[2], "online");

    let (_, result) = harness.stop().await;
    assert!(result.is_ok());
}
