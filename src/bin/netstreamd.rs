//! netstreamd - Publish frames from a network video stream over MQTT.
//!
//! Runs one streaming session and exits when it ends; a process supervisor is
//! expected to restart it. The exit status is non-zero only when the session
//! could not start (bad config, broker setup, device arm, pipeline spawn).

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use netstream::transport::MqttSettings;
use netstream::{ConnectionManager, MqttPublisher, SessionConfig, ShutdownSignal, StreamLoop};

const DAEMON_NAME: &str = "netstreamd";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Publish raw frames from a GStreamer pipeline to an MQTT topic"
)]
struct Args {
    /// Session config file (JSON or TOML, by extension).
    #[arg(long, env = "NETSTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// MQTT broker address, `host[:port]` with an optional `mqtt://` or `mqtts://` scheme.
    #[arg(long, env = "MQTT_BROKER_ADDR", default_value = "127.0.0.1:1883")]
    mqtt_broker_addr: String,

    /// MQTT username for authentication.
    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    /// MQTT password for authentication.
    #[arg(long, env = "MQTT_PASSWORD")]
    mqtt_password: Option<String>,

    /// Enable TLS for MQTT without an `mqtts://` scheme.
    #[arg(long, env = "MQTT_USE_TLS")]
    mqtt_use_tls: bool,

    /// Path to a PEM-encoded CA certificate to trust for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CA_PATH")]
    mqtt_tls_ca_path: Option<PathBuf>,

    /// Path to a PEM-encoded client certificate for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_CERT_PATH")]
    mqtt_tls_client_cert_path: Option<PathBuf>,

    /// Path to a PEM-encoded client private key for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_KEY_PATH")]
    mqtt_tls_client_key_path: Option<PathBuf>,

    /// MQTT client identifier.
    #[arg(long, env = "MQTT_CLIENT_ID", default_value = DAEMON_NAME)]
    mqtt_client_id: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = SessionConfig::load(args.config.as_deref())?;
    let layout = config
        .frame_layout()
        .context("session config has an invalid frame layout")?;
    log::info!(
        "{} {}: {} {}x{}x{} -> '{}'",
        DAEMON_NAME,
        env!("CARGO_PKG_VERSION"),
        config.mode,
        layout.width(),
        layout.height(),
        layout.channels(),
        config.pub_topic
    );

    let settings = MqttSettings {
        broker: args.mqtt_broker_addr,
        use_tls: args.mqtt_use_tls,
        tls_ca_path: args.mqtt_tls_ca_path,
        tls_client_cert_path: args.mqtt_tls_client_cert_path,
        tls_client_key_path: args.mqtt_tls_client_key_path,
        client_id: args.mqtt_client_id,
        username: args.mqtt_username,
        password: args.mqtt_password,
    };
    let broker = settings.broker()?;
    settings
        .transport(&broker)
        .context("invalid MQTT TLS settings")?;

    let shutdown = ShutdownSignal::new();
    shutdown.install_handler()?;

    let publisher = MqttPublisher::connect(&settings, &config.pub_topic, layout.byte_len())?;
    let mut session = StreamLoop::new(config, ConnectionManager::new(), publisher, shutdown);
    let outcome = session.run();

    let (_, publisher) = session.into_parts();
    if let Err(e) = publisher.disconnect() {
        log::warn!("MQTT disconnect failed: {:#}", e);
    }

    let report = outcome?;
    if report.conversion_faults > 0 || report.publish_faults > 0 {
        log::warn!(
            "{} frames dropped ({} conversion, {} publish)",
            report.conversion_faults + report.publish_faults,
            report.conversion_faults,
            report.publish_faults
        );
    }
    if let Some(e) = &report.close_error {
        log::warn!("pipeline did not close cleanly: {}", e);
    }
    Ok(())
}
