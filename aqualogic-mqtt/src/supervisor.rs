//! MQTT session lifecycle.
//!
//! The [`ConnectionSupervisor`] owns the transport. It performs the initial
//! connect (any failure there is terminal), then drives the event loop:
//! subscribing on every accepted CONNACK, forwarding inbound messages and
//! applying a bounded exponential backoff to failed sessions.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::config::RetryConfig;
use crate::transport::{MqttClient, MqttTransport, Qos, TransportEvent};

/// How long to keep polling after DISCONNECT so queued requests go out.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Session state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Retrying,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Retrying => write!(f, "retrying"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// Terminal supervisor failures.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("broker refused connection: {0}")]
    Refused(String),

    #[error("could not connect: {0}")]
    ConnectFailed(String),

    #[error("giving up after {attempts} reconnect attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },
}

/// Reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_wait: Duration,
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(30),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_wait: Duration::from_secs(config.initial_wait_secs),
            max_wait: Duration::from_secs(config.max_wait_secs),
        }
    }
}

/// Outcome of a session failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    Retry { attempt: u32, wait: Duration },
    GiveUp { attempts: u32 },
}

/// Consecutive-failure counter.
///
/// Attempt `n` waits `min(initial * 2^(n-1), max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_failure(&mut self) -> BackoffStep {
        if self.attempt >= self.policy.max_retries {
            return BackoffStep::GiveUp {
                attempts: self.attempt,
            };
        }
        self.attempt += 1;
        let factor = 2u32.saturating_pow(self.attempt - 1);
        let wait = self
            .policy
            .initial_wait
            .checked_mul(factor)
            .map_or(self.policy.max_wait, |w| w.min(self.policy.max_wait));
        BackoffStep::Retry {
            attempt: self.attempt,
            wait,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Events forwarded to the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttEvent {
    /// A session was established and subscriptions were requested.
    Connected,
    /// Inbound message.
    Message { topic: String, payload: Vec<u8> },
}

pub struct ConnectionSupervisor<T: MqttTransport> {
    transport: T,
    client: T::Client,
    subscriptions: Vec<String>,
    backoff: Backoff,
    state: watch::Sender<ConnectionState>,
}

impl<T: MqttTransport> ConnectionSupervisor<T> {
    pub fn new(transport: T, subscriptions: Vec<String>, policy: RetryPolicy) -> Self {
        let client = transport.client();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            client,
            subscriptions,
            backoff: Backoff::new(policy),
            state,
        }
    }

    pub fn client(&self) -> T::Client {
        self.client.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "MQTT connection state changed");
        }
    }

    /// Establish the first session.
    ///
    /// Refusal or failure here is terminal and never retried.
    pub async fn connect(&mut self) -> Result<(), SupervisorError> {
        self.set_state(ConnectionState::Connecting);
        loop {
            match self.transport.poll().await {
                TransportEvent::ConnAck {
                    accepted: true, ..
                } => {
                    self.on_connected().await;
                    return Ok(());
                }
                TransportEvent::ConnAck {
                    accepted: false,
                    reason,
                } => {
                    self.set_state(ConnectionState::Failed);
                    tracing::error!(reason = %reason, "MQTT broker refused connection");
                    return Err(SupervisorError::Refused(reason));
                }
                TransportEvent::Disconnected { reason, .. } => {
                    self.set_state(ConnectionState::Failed);
                    tracing::error!(reason = %reason, "MQTT connection failed");
                    return Err(SupervisorError::ConnectFailed(reason));
                }
                TransportEvent::Message { .. } | TransportEvent::Idle => {}
            }
        }
    }

    async fn on_connected(&mut self) {
        self.backoff.reset();
        self.set_state(ConnectionState::Connected);
        tracing::info!("Connected to MQTT broker");

        for topic in &self.subscriptions {
            match self.client.subscribe(topic, Qos::AtLeastOnce).await {
                Ok(()) => tracing::debug!(topic = %topic, "Subscribed"),
                Err(e) => tracing::warn!(topic = %topic, error = %e, "Subscribe failed"),
            }
        }
    }

    /// Drive the session until shutdown or a terminal failure.
    ///
    /// Forwards [`MqttEvent`]s into `events`. When `shutdown` flips to true
    /// (or its sender goes away) a DISCONNECT is sent and the loop drains.
    pub async fn run<E>(
        mut self,
        events: mpsc::Sender<E>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SupervisorError>
    where
        E: From<MqttEvent> + Send + 'static,
    {
        if self.state() == ConnectionState::Connected
            && events.send(MqttEvent::Connected.into()).await.is_err()
        {
            self.shutdown().await;
            return Ok(());
        }

        // Set after an orderly disconnect; the socket error that follows is
        // not a failure of its own.
        let mut closing = false;

        loop {
            let event = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.shutdown().await;
                        return Ok(());
                    }
                    continue;
                }
                event = self.transport.poll() => event,
            };

            let forward = match event {
                TransportEvent::ConnAck {
                    accepted: true, ..
                } => {
                    closing = false;
                    self.on_connected().await;
                    Some(MqttEvent::Connected)
                }
                TransportEvent::Message { topic, payload } => {
                    tracing::trace!(topic = %topic, bytes = payload.len(), "MQTT message");
                    Some(MqttEvent::Message { topic, payload })
                }
                TransportEvent::Disconnected {
                    failure: false,
                    reason,
                } => {
                    tracing::info!(reason = %reason, "MQTT disconnected");
                    self.set_state(ConnectionState::Disconnected);
                    closing = true;
                    None
                }
                TransportEvent::Disconnected {
                    failure: true,
                    reason,
                } if closing => {
                    tracing::debug!(reason = %reason, "MQTT connection closed");
                    closing = false;
                    None
                }
                TransportEvent::ConnAck { reason, .. }
                | TransportEvent::Disconnected { reason, .. } => {
                    self.on_failure(reason, &mut shutdown).await?;
                    if *shutdown.borrow() {
                        self.shutdown().await;
                        return Ok(());
                    }
                    None
                }
                TransportEvent::Idle => None,
            };

            if let Some(event) = forward {
                if events.send(event.into()).await.is_err() {
                    tracing::debug!("Event receiver dropped, stopping MQTT loop");
                    self.shutdown().await;
                    return Ok(());
                }
            }
        }
    }

    /// Apply the backoff policy to a failed session, sleeping before the next
    /// reconnect attempt. The sleep ends early on shutdown.
    async fn on_failure(
        &mut self,
        reason: String,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SupervisorError> {
        match self.backoff.next_failure() {
            BackoffStep::Retry { attempt, wait } => {
                self.set_state(ConnectionState::Retrying);
                tracing::warn!(
                    reason = %reason,
                    attempt,
                    wait_secs = wait.as_secs_f64(),
                    "MQTT connection lost, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.wait_for(|stop| *stop) => {}
                }
                self.set_state(ConnectionState::Connecting);
                Ok(())
            }
            BackoffStep::GiveUp { attempts } => {
                self.set_state(ConnectionState::Failed);
                tracing::error!(reason = %reason, attempts, "MQTT connection failed for good");
                if let Err(e) = self.client.disconnect().await {
                    tracing::debug!(error = %e, "Disconnect after failure");
                }
                Err(SupervisorError::RetriesExhausted { attempts, reason })
            }
        }
    }

    /// Send DISCONNECT and keep polling briefly so queued publishes go out.
    async fn shutdown(&mut self) {
        if self.state() == ConnectionState::Connected {
            if let Err(e) = self.client.disconnect().await {
                tracing::warn!(error = %e, "Failed to send MQTT disconnect");
            }
            let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
                loop {
                    if let TransportEvent::Disconnected { .. } = self.transport.poll().await {
                        break;
                    }
                }
            })
            .await;
            if drained.is_err() {
                tracing::debug!("Timed out draining MQTT session");
            }
        }
        self.set_state(ConnectionState::Disconnected);
        tracing::info!("MQTT session closed");
    }
}
