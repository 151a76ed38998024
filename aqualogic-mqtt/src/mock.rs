//! Scriptable in-memory MQTT transport.
//!
//! [`MockTransport`] yields events pushed through a [`MockBroker`] handle and
//! records every request made through its [`MockClient`]. Once the script is
//! exhausted `poll` waits for more events. A disconnect request is answered
//! with an orderly `Disconnected` event, the way a real session closes.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::transport::{MqttClient, MqttTransport, Qos, TransportError, TransportEvent};

/// A recorded publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

impl Published {
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or("<binary>")
    }
}

/// Everything the client was asked to do.
#[derive(Debug, Default)]
pub struct MockLog {
    pub published: Vec<Published>,
    pub subscribed: Vec<(String, Qos)>,
    pub disconnects: usize,
}

/// Handle used by tests to feed events and inspect requests.
#[derive(Clone)]
pub struct MockBroker {
    events: mpsc::UnboundedSender<TransportEvent>,
    log: Arc<Mutex<MockLog>>,
    fail_publish: Arc<Mutex<bool>>,
}

impl MockBroker {
    /// Queue an event for the transport.
    pub fn push(&self, event: TransportEvent) {
        // The transport may already be gone at the end of a test.
        let _ = self.events.send(event);
    }

    pub fn accept(&self) {
        self.push(TransportEvent::ConnAck {
            accepted: true,
            reason: "Success".to_string(),
        });
    }

    pub fn refuse(&self, reason: &str) {
        self.push(TransportEvent::ConnAck {
            accepted: false,
            reason: reason.to_string(),
        });
    }

    pub fn drop_connection(&self, reason: &str) {
        self.push(TransportEvent::Disconnected {
            failure: true,
            reason: reason.to_string(),
        });
    }

    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        self.push(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    /// Make subsequent publishes fail.
    pub fn set_fail_publish(&self, fail: bool) {
        if let Ok(mut flag) = self.fail_publish.lock() {
            *flag = fail;
        }
    }

    pub fn published(&self) -> Vec<Published> {
        self.log.lock().map(|l| l.published.clone()).unwrap_or_default()
    }

    /// Publishes on one topic, in order.
    pub fn published_to(&self, topic: &str) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| p.topic == topic)
            .collect()
    }

    pub fn subscribed(&self) -> Vec<(String, Qos)> {
        self.log.lock().map(|l| l.subscribed.clone()).unwrap_or_default()
    }

    pub fn disconnects(&self) -> usize {
        self.log.lock().map(|l| l.disconnects).unwrap_or_default()
    }

    /// Forget recorded requests.
    pub fn clear(&self) {
        if let Ok(mut log) = self.log.lock() {
            *log = MockLog::default();
        }
    }
}

/// Request handle of the mock transport.
#[derive(Clone)]
pub struct MockClient {
    broker: MockBroker,
}

impl MqttClient for MockClient {
    async fn publish(
        &self,
        topic: &str,
        qos: Qos,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let fail = self.broker.fail_publish.lock().map(|f| *f).unwrap_or(false);
        if fail {
            return Err(TransportError::Client("publish rejected".to_string()));
        }
        let mut log = self
            .broker
            .log
            .lock()
            .map_err(|e| TransportError::Client(e.to_string()))?;
        log.published.push(Published {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), TransportError> {
        let mut log = self
            .broker
            .log
            .lock()
            .map_err(|e| TransportError::Client(e.to_string()))?;
        log.subscribed.push((topic.to_string(), qos));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        {
            let mut log = self
                .broker
                .log
                .lock()
                .map_err(|e| TransportError::Client(e.to_string()))?;
            log.disconnects += 1;
        }
        self.broker.push(TransportEvent::Disconnected {
            failure: false,
            reason: "client disconnect".to_string(),
        });
        Ok(())
    }
}

/// Event loop of the mock transport.
pub struct MockTransport {
    events: mpsc::UnboundedReceiver<TransportEvent>,
    broker: MockBroker,
}

impl MockTransport {
    pub fn new() -> (Self, MockBroker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let broker = MockBroker {
            events: tx,
            log: Arc::new(Mutex::new(MockLog::default())),
            fail_publish: Arc::new(Mutex::new(false)),
        };
        (
            Self {
                events: rx,
                broker: broker.clone(),
            },
            broker,
        )
    }
}

impl MqttTransport for MockTransport {
    type Client = MockClient;

    fn client(&self) -> MockClient {
        MockClient {
            broker: self.broker.clone(),
        }
    }

    async fn poll(&mut self) -> TransportEvent {
        match self.events.recv().await {
            Some(event) => event,
            // The transport holds a sender itself, so this is unreachable in
            // practice; park like an idle connection.
            None => std::future::pending().await,
        }
    }
}
