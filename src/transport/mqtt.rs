//! MQTT-backed `FramePublisher`.
//!
//! Frames go out at QoS 0 through a short request queue. When the queue is
//! full the frame is dropped and reported, so a slow broker never stalls the
//! read loop. A lost broker connection is not re-established; later frames
//! fail to enqueue and the session keeps reading.

use anyhow::{anyhow, bail, Context, Result};
use rumqttc::{Client, Connection, Event, MqttOptions, QoS, Transport};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{FramePublisher, PublishError};
use crate::frame::FrameMessage;
use crate::message;

const REQUEST_QUEUE_CAPACITY: usize = 5;
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;
/// Room for the length prefix and JSON image header on top of the pixels.
const HEADER_ALLOWANCE: usize = 4 * 1024;

/// Where and how to reach the broker, as given on the command line.
#[derive(Clone, Debug, Default)]
pub struct MqttSettings {
    /// `host[:port]`, optionally with an `mqtt://`, `tcp://`, `mqtts://` or
    /// `ssl://` scheme. IPv6 hosts go in brackets.
    pub broker: String,
    /// Force TLS even without a TLS scheme.
    pub use_tls: bool,
    pub tls_ca_path: Option<PathBuf>,
    pub tls_client_cert_path: Option<PathBuf>,
    pub tls_client_key_path: Option<PathBuf>,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// A parsed broker address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Broker {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl MqttSettings {
    pub fn broker(&self) -> Result<Broker> {
        let addr = self.broker.trim();
        let (tls, rest) = match addr.split_once("://") {
            None => (self.use_tls, addr),
            Some(("mqtt" | "tcp", rest)) => (self.use_tls, rest),
            Some(("mqtts" | "ssl", rest)) => (true, rest),
            Some((scheme, _)) => bail!("unsupported MQTT scheme '{}' in '{}'", scheme, addr),
        };
        if rest.contains('/') {
            bail!(
                "MQTT broker '{}' must not carry a path; set the topic in the session config",
                addr
            );
        }

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| anyhow!("unterminated IPv6 host in MQTT broker '{}'", addr))?;
            (host, tail.strip_prefix(':'))
        } else if rest.matches(':').count() > 1 {
            bail!("IPv6 MQTT broker '{}' must be written as [host]:port", addr);
        } else {
            match rest.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };
        if host.is_empty() {
            bail!("MQTT broker '{}' has no host", addr);
        }
        let port = match port {
            Some(port) => port
                .parse()
                .with_context(|| format!("invalid port in MQTT broker '{}'", addr))?,
            None if tls => DEFAULT_TLS_PORT,
            None => DEFAULT_PORT,
        };

        Ok(Broker {
            host: host.to_string(),
            port,
            tls,
        })
    }

    /// Plain TCP, TLS with webpki roots, or TLS with a custom CA and optional client cert.
    pub fn transport(&self, broker: &Broker) -> Result<Transport> {
        let has_materials = self.tls_ca_path.is_some()
            || self.tls_client_cert_path.is_some()
            || self.tls_client_key_path.is_some();
        if !broker.tls {
            if has_materials {
                bail!("MQTT TLS files given but TLS is off; use --mqtt-use-tls or mqtts://");
            }
            return Ok(Transport::tcp());
        }

        let client_auth = match (&self.tls_client_cert_path, &self.tls_client_key_path) {
            (Some(cert), Some(key)) => Some((
                read_pem(cert, "client cert")?,
                read_pem(key, "client key")?,
            )),
            (None, None) => None,
            _ => bail!("MQTT TLS client cert and key must be given together"),
        };
        match &self.tls_ca_path {
            Some(ca) => Ok(Transport::tls(read_pem(ca, "CA")?, client_auth, None)),
            None if client_auth.is_some() => {
                bail!("MQTT TLS client cert needs --mqtt-tls-ca-path to verify the broker")
            }
            None => Ok(Transport::tls_with_default_config()),
        }
    }
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path)
        .with_context(|| format!("failed to read MQTT TLS {} '{}'", what, path.display()))
}

pub struct MqttPublisher {
    client: Client,
    topic: String,
    closing: Arc<AtomicBool>,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttPublisher {
    /// Connect to the broker and publish to `topic`.
    ///
    /// `frame_bytes` is the size of one raw frame; the packet limit is sized from it.
    pub fn connect(settings: &MqttSettings, topic: &str, frame_bytes: usize) -> Result<Self> {
        let broker = settings.broker()?;
        let mut options = MqttOptions::new(
            settings.client_id.as_str(),
            broker.host.as_str(),
            broker.port,
        );
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        let max_packet = frame_bytes.saturating_add(HEADER_ALLOWANCE);
        options.set_max_packet_size(max_packet, max_packet);
        if let Some(user) = settings.username.as_deref() {
            options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
        }
        options.set_transport(
            settings
                .transport(&broker)
                .context("configure MQTT transport")?,
        );

        let (client, connection) = Client::new(options, REQUEST_QUEUE_CAPACITY);
        log::info!(
            "MQTT publisher for '{}' via {}:{} (TLS: {}, auth: {})",
            topic,
            broker.host,
            broker.port,
            broker.tls,
            settings.username.is_some()
        );
        Ok(Self::from_parts(client, connection, topic))
    }

    fn from_parts(client: Client, mut connection: Connection, topic: &str) -> Self {
        let closing = Arc::new(AtomicBool::new(false));
        let closing_flag = Arc::clone(&closing);
        let handle = std::thread::spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        if !closing_flag.load(Ordering::SeqCst) {
                            log::warn!("MQTT connection error: {}", e);
                        }
                        break;
                    }
                }
            }
        });

        Self {
            client,
            topic: topic.to_string(),
            closing,
            connection_handle: Some(handle),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Disconnect from the broker and wait for the connection thread.
    pub fn disconnect(mut self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        self.client
            .disconnect()
            .context("request MQTT disconnect")?;
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl FramePublisher for MqttPublisher {
    fn publish(&mut self, frame: FrameMessage) -> Result<(), PublishError> {
        let payload = message::encode(&frame)?;
        self.client
            .try_publish(self.topic.as_str(), QoS::AtMostOnce, false, payload)
            .map_err(|e| PublishError::Transport(e.to_string()))
    }
}
