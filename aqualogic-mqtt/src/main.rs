//! MQTT bridge for Hayward AquaLogic pool controllers.
//!
//! Reads the panel (or a simulated one), publishes its state with Home
//! Assistant discovery and applies commands received over MQTT.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use aqualogic_mqtt::args::Args;
use aqualogic_mqtt::config::BridgeConfig;
use aqualogic_mqtt::entities::EntitySet;
use aqualogic_mqtt::panel::{PanelDriver, PanelError};
use aqualogic_mqtt::registry::MessageRegistry;
use aqualogic_mqtt::simulator::SimulatedPanel;
use aqualogic_mqtt::{Bridge, ConnectionSupervisor, RetryPolicy, RumqttTransport, StateTranslator};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.list_entities {
        println!("{}", Args::entity_listing());
        return Ok(());
    }

    // Load configuration
    let mut config = match &args.config {
        Some(path) => BridgeConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => BridgeConfig::default(),
    };
    config.apply_args(&args)?;

    aqualogic_common::init_tracing(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    config.validate()?;

    info!("Starting aqualogic-mqtt {}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let topics = config.discovery.topics()?;
    let entities = EntitySet::build(
        &config.discovery.identifier,
        &config.entities,
        &config.text_patterns,
    )?;
    let registry = MessageRegistry::new(config.panel.message_expiry(), entities.watched_patterns())?;
    let translator = StateTranslator::new(topics, entities);

    let client_id = config.client_id();
    let transport = RumqttTransport::new(&config.mqtt, &client_id, &translator.availability_topic())
        .context("MQTT connection failed")?;
    let mut supervisor = ConnectionSupervisor::new(
        transport,
        translator.subscription_topics(),
        RetryPolicy::from(&config.mqtt.retry),
    );

    let bridge = Bridge::new(
        translator,
        registry,
        supervisor.client(),
        config.panel.heartbeat_timeout(),
    );

    let Some(source) = config.panel.source.clone() else {
        anyhow::bail!("panel connection failed: no panel source configured");
    };
    info!(source = %source, "Connecting to panel");
    let driver = match SimulatedPanel::connect(&source, bridge.status_sink()) {
        Ok(driver) => driver,
        Err(PanelError::UnsupportedSource(kind)) => {
            anyhow::bail!(
                "panel connection failed: no protocol driver for {} panels is linked into this build (use --simulate)",
                kind
            );
        }
        Err(e) => return Err(e).context("panel connection failed"),
    };

    info!(
        host = %config.mqtt.host,
        port = config.mqtt.port,
        client_id = %client_id,
        "Connecting to MQTT broker"
    );
    supervisor.connect().await.context("MQTT connection failed")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    bridge.run(supervisor, driver, shutdown_rx).await?;

    info!("aqualogic-mqtt stopped");
    Ok(())
}

async fn wait_for_signal() {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        warn!("Failed to listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
