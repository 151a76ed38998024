//! MQTT transport seam.
//!
//! The supervisor and bridge only talk to [`MqttTransport`] (the event loop)
//! and [`MqttClient`] (the request handle). [`RumqttTransport`] implements
//! both for MQTT 3.1.1 and 5 on top of rumqttc; tests use
//! [`crate::mock::MockTransport`].

use std::future::Future;
use std::sync::Arc;

use rumqttc::v5;
use rumqttc::v5::mqttbytes::v5::{
    ConnectReturnCode as ConnectReturnCodeV5, DisconnectReasonCode, Packet as PacketV5,
};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill, MqttOptions,
    Packet, QoS, TlsConfiguration, Transport,
};
use thiserror::Error;

use crate::config::{MqttConfig, ProtocolVersion, TransportKind};
use crate::translator::PAYLOAD_OFFLINE;

/// Capacity of the rumqttc request channel.
const REQUEST_CAPACITY: usize = 64;

/// Quality of service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Qos {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn level(&self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl From<Qos> for QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
            Qos::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

impl From<Qos> for v5::mqttbytes::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => v5::mqttbytes::QoS::AtMostOnce,
            Qos::AtLeastOnce => v5::mqttbytes::QoS::AtLeastOnce,
            Qos::ExactlyOnce => v5::mqttbytes::QoS::ExactlyOnce,
        }
    }
}

/// Connection lifecycle and inbound traffic, as seen by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Broker answered a CONNECT.
    ConnAck { accepted: bool, reason: String },
    /// Inbound PUBLISH.
    Message { topic: String, payload: Vec<u8> },
    /// Session ended. `failure` is false for orderly disconnects.
    Disconnected { failure: bool, reason: String },
    /// Anything the bridge does not care about (pings, acks, outgoing packets).
    Idle,
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("client request failed: {0}")]
    Client(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),
}

/// Request handle used to publish, subscribe and disconnect.
pub trait MqttClient: Clone + Send + Sync + 'static {
    fn publish(
        &self,
        topic: &str,
        qos: Qos,
        retain: bool,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn subscribe(
        &self,
        topic: &str,
        qos: Qos,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Event loop driving the connection.
///
/// Polling after a failure reconnects.
pub trait MqttTransport: Send + 'static {
    type Client: MqttClient;

    fn client(&self) -> Self::Client;

    fn poll(&mut self) -> impl Future<Output = TransportEvent> + Send;
}

/// rumqttc request handle.
#[derive(Clone)]
pub enum RumqttClient {
    V311(AsyncClient),
    V5(v5::AsyncClient),
}

fn client_error(err: impl std::fmt::Display) -> TransportError {
    TransportError::Client(err.to_string())
}

impl MqttClient for RumqttClient {
    async fn publish(
        &self,
        topic: &str,
        qos: Qos,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        match self {
            RumqttClient::V311(client) => client
                .publish(topic, qos.into(), retain, payload)
                .await
                .map_err(client_error),
            RumqttClient::V5(client) => client
                .publish(topic, qos.into(), retain, payload)
                .await
                .map_err(client_error),
        }
    }

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), TransportError> {
        match self {
            RumqttClient::V311(client) => {
                client.subscribe(topic, qos.into()).await.map_err(client_error)
            }
            RumqttClient::V5(client) => {
                client.subscribe(topic, qos.into()).await.map_err(client_error)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        match self {
            RumqttClient::V311(client) => client.disconnect().await.map_err(client_error),
            RumqttClient::V5(client) => client.disconnect().await.map_err(client_error),
        }
    }
}

/// rumqttc event loop for either protocol version.
pub enum RumqttTransport {
    V311 {
        client: AsyncClient,
        event_loop: EventLoop,
    },
    V5 {
        client: v5::AsyncClient,
        event_loop: v5::EventLoop,
    },
}

impl RumqttTransport {
    /// Build the client and event loop. Nothing is sent until the first poll.
    ///
    /// A retained `"offline"` last will is registered on `will_topic`.
    pub fn new(config: &MqttConfig, client_id: &str, will_topic: &str) -> Result<Self, TransportError> {
        let transport_kind = config.effective_transport();
        let transport = build_transport(config, transport_kind)?;
        let host = match transport_kind {
            TransportKind::Tcp => config.host.clone(),
            TransportKind::Websockets => {
                let scheme = if config.tls.is_enabled() { "wss" } else { "ws" };
                format!("{}://{}:{}/mqtt", scheme, host_literal(&config.host), config.port)
            }
        };
        let credentials = config.credentials();

        tracing::debug!(
            host = %host,
            port = config.port,
            protocol = u8::from(config.protocol),
            tls = config.tls.is_enabled(),
            auth = credentials.is_some(),
            "Configuring MQTT client"
        );

        match config.protocol {
            ProtocolVersion::V311 => {
                let mut options = MqttOptions::new(client_id, host, config.port);
                options.set_keep_alive(config.keepalive());
                if let Some((user, password)) = credentials {
                    options.set_credentials(user, password);
                }
                options.set_last_will(LastWill::new(
                    will_topic,
                    PAYLOAD_OFFLINE,
                    QoS::AtLeastOnce,
                    true,
                ));
                options.set_transport(transport);

                let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
                Ok(RumqttTransport::V311 { client, event_loop })
            }
            ProtocolVersion::V5 => {
                let mut options = v5::MqttOptions::new(client_id, host, config.port);
                options.set_keep_alive(config.keepalive());
                if let Some((user, password)) = credentials {
                    options.set_credentials(user, password);
                }
                options.set_last_will(v5::mqttbytes::v5::LastWill::new(
                    will_topic,
                    PAYLOAD_OFFLINE,
                    v5::mqttbytes::QoS::AtLeastOnce,
                    true,
                    None,
                ));
                options.set_transport(transport);

                let (client, event_loop) = v5::AsyncClient::new(options, REQUEST_CAPACITY);
                Ok(RumqttTransport::V5 { client, event_loop })
            }
        }
    }
}

impl MqttTransport for RumqttTransport {
    type Client = RumqttClient;

    fn client(&self) -> RumqttClient {
        match self {
            RumqttTransport::V311 { client, .. } => RumqttClient::V311(client.clone()),
            RumqttTransport::V5 { client, .. } => RumqttClient::V5(client.clone()),
        }
    }

    async fn poll(&mut self) -> TransportEvent {
        match self {
            RumqttTransport::V311 { event_loop, .. } => match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => TransportEvent::ConnAck {
                    accepted: ack.code == ConnectReturnCode::Success,
                    reason: format!("{:?}", ack.code),
                },
                Ok(Event::Incoming(Packet::Publish(publish))) => TransportEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                },
                Ok(Event::Incoming(Packet::Disconnect)) => TransportEvent::Disconnected {
                    failure: false,
                    reason: "broker sent DISCONNECT".to_string(),
                },
                Ok(_) => TransportEvent::Idle,
                Err(ConnectionError::ConnectionRefused(code)) => TransportEvent::ConnAck {
                    accepted: false,
                    reason: format!("{:?}", code),
                },
                Err(err) => TransportEvent::Disconnected {
                    failure: true,
                    reason: err.to_string(),
                },
            },
            RumqttTransport::V5 { event_loop, .. } => match event_loop.poll().await {
                Ok(v5::Event::Incoming(PacketV5::ConnAck(ack))) => TransportEvent::ConnAck {
                    accepted: ack.code == ConnectReturnCodeV5::Success,
                    reason: format!("{:?}", ack.code),
                },
                Ok(v5::Event::Incoming(PacketV5::Publish(publish))) => TransportEvent::Message {
                    topic: String::from_utf8_lossy(&publish.topic).into_owned(),
                    payload: publish.payload.to_vec(),
                },
                Ok(v5::Event::Incoming(PacketV5::Disconnect(disconnect))) => {
                    TransportEvent::Disconnected {
                        failure: disconnect.reason_code
                            != DisconnectReasonCode::NormalDisconnection,
                        reason: format!("{:?}", disconnect.reason_code),
                    }
                }
                Ok(_) => TransportEvent::Idle,
                Err(v5::ConnectionError::ConnectionRefused(code)) => TransportEvent::ConnAck {
                    accepted: false,
                    reason: format!("{:?}", code),
                },
                Err(err) => TransportEvent::Disconnected {
                    failure: true,
                    reason: err.to_string(),
                },
            },
        }
    }
}

/// Bracket IPv6 literals for use in a URL.
fn host_literal(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

fn build_transport(config: &MqttConfig, kind: TransportKind) -> Result<Transport, TransportError> {
    let tls = &config.tls;
    if !tls.is_enabled() {
        return Ok(match kind {
            TransportKind::Tcp => Transport::tcp(),
            TransportKind::Websockets => Transport::Ws,
        });
    }

    let tls_config = if tls.insecure {
        tracing::warn!("MQTT broker certificate validation is disabled");
        insecure::tls_configuration()?
    } else if let Some(path) = &tls.ca_path {
        let ca = std::fs::read(path).map_err(|e| {
            TransportError::Tls(format!("failed to read CA file '{}': {}", path.display(), e))
        })?;
        TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: None,
        }
    } else {
        TlsConfiguration::default()
    };

    Ok(match kind {
        TransportKind::Tcp => Transport::tls_with_config(tls_config),
        TransportKind::Websockets => Transport::wss_with_config(tls_config),
    })
}

mod insecure {
    use super::*;

    use rumqttc::tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rumqttc::tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rumqttc::tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, SignatureScheme};

    /// Accepts any server certificate.
    #[derive(Debug)]
    struct AcceptAnyCert;

    impl ServerCertVerifier for AcceptAnyCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }

    pub(super) fn tls_configuration() -> Result<TlsConfiguration, TransportError> {
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth();
        Ok(TlsConfiguration::Rustls(Arc::new(config)))
    }
}
