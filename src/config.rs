use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::frame::{FrameError, FrameLayout};

const DEFAULT_URI_POSTFIX: &str = "";
const DEFAULT_PIPELINE_PROGRAM: &str = "gst-launch-1.0";
const DEFAULT_CONTROL_PORT: u16 = 8000;
const DEFAULT_SONAR_RANGE: u32 = 40;
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 5;

/// How the decoding pipeline reaches the video source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportMode {
    /// Listen for an RTP/H.264 stream on a local UDP port.
    Udp,
    /// Pull the stream from an RTSP server.
    Rtsp,
}

impl TransportMode {
    /// URI scheme handed to the pipeline source element.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Rtsp => "rtsp",
        }
    }
}

impl FromStr for TransportMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "0" | "udp" => Ok(Self::Udp),
            "1" | "rtsp" => Ok(Self::Rtsp),
            other => Err(anyhow!(
                "unknown transport mode '{}': expected 0/udp or 1/rtsp",
                other
            )),
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Source-specific behavior that brackets a streaming session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExceptionalCase {
    #[default]
    None,
    /// The source is a sonar that must be armed over its HTTP API before
    /// streaming and disarmed afterwards.
    DeviceHandshake,
}

impl ExceptionalCase {
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Self::None),
            1 => Ok(Self::DeviceHandshake),
            other => Err(anyhow!(
                "unsupported exceptional_case {}: expected 0 (none) or 1 (device handshake)",
                other
            )),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::DeviceHandshake => 1,
        }
    }
}

/// Settings for the device arm/disarm exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeSettings {
    pub control_port: u16,
    pub sonar_range: u32,
    /// Explicit stream type value; `None` picks the value matching the transport mode.
    pub stream_type: Option<u32>,
    pub timeout: Duration,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            control_port: DEFAULT_CONTROL_PORT,
            sonar_range: DEFAULT_SONAR_RANGE,
            stream_type: None,
            timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
        }
    }
}

/// Validated, immutable configuration for one streaming session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub mode: TransportMode,
    pub pub_topic: String,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub host: String,
    pub uri_postfix: String,
    pub exceptional_case: ExceptionalCase,
    pub pipeline_program: String,
    pub handshake: HandshakeSettings,
}

#[derive(Debug, Deserialize, Default)]
struct SessionConfigFile {
    mode: Option<ModeValue>,
    pub_topic: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    channels: Option<u32>,
    host: Option<String>,
    uri_postfix: Option<String>,
    exceptional_case: Option<u32>,
    pipeline_program: Option<String>,
    handshake: Option<HandshakeConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct HandshakeConfigFile {
    control_port: Option<u16>,
    sonar_range: Option<u32>,
    stream_type: Option<u32>,
    timeout_secs: Option<u64>,
}

/// Mode as written in a config file: the numeric convention (`0`/`1`) or a name.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ModeValue {
    Code(u32),
    Name(String),
}

impl ModeValue {
    fn resolve(&self) -> Result<TransportMode> {
        match self {
            Self::Code(code) => code.to_string().parse(),
            Self::Name(name) => name.parse(),
        }
    }
}

impl SessionConfig {
    /// Load from `path`, or from the file named by `NETSTREAM_CONFIG`, then
    /// apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => std::env::var("NETSTREAM_CONFIG")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from),
        };
        let mut file_cfg = match config_path.as_deref() {
            Some(path) => read_config_file(path)?,
            None => SessionConfigFile::default(),
        };
        apply_env(&mut file_cfg)?;
        let cfg = Self::from_file(file_cfg)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SessionConfigFile) -> Result<Self> {
        let mode = file
            .mode
            .as_ref()
            .ok_or_else(|| anyhow!("missing required parameter 'mode'"))?
            .resolve()?;
        let pub_topic = file
            .pub_topic
            .ok_or_else(|| anyhow!("missing required parameter 'pub_topic'"))?;
        let width = file
            .width
            .ok_or_else(|| anyhow!("missing required parameter 'width'"))?;
        let height = file
            .height
            .ok_or_else(|| anyhow!("missing required parameter 'height'"))?;
        let channels = file
            .channels
            .ok_or_else(|| anyhow!("missing required parameter 'channels'"))?;
        let host = file
            .host
            .ok_or_else(|| anyhow!("missing required parameter 'host'"))?;
        let exceptional_case = ExceptionalCase::from_code(file.exceptional_case.unwrap_or(0))?;
        let handshake = file.handshake.unwrap_or_default();
        let handshake = HandshakeSettings {
            control_port: handshake.control_port.unwrap_or(DEFAULT_CONTROL_PORT),
            sonar_range: handshake.sonar_range.unwrap_or(DEFAULT_SONAR_RANGE),
            stream_type: handshake.stream_type,
            timeout: Duration::from_secs(
                handshake
                    .timeout_secs
                    .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            ),
        };

        Ok(Self {
            mode,
            pub_topic,
            width,
            height,
            channels,
            host,
            uri_postfix: file
                .uri_postfix
                .unwrap_or_else(|| DEFAULT_URI_POSTFIX.to_string()),
            exceptional_case,
            pipeline_program: file
                .pipeline_program
                .unwrap_or_else(|| DEFAULT_PIPELINE_PROGRAM.to_string()),
            handshake,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.channels == 0 {
            return Err(anyhow!(
                "frame dimensions must be positive (width={}, height={}, channels={})",
                self.width,
                self.height,
                self.channels
            ));
        }
        FrameLayout::new(self.width, self.height, self.channels)?;
        if self.host.trim().is_empty() {
            return Err(anyhow!("host must not be empty"));
        }
        validate_topic(&self.pub_topic)?;
        if self.pipeline_program.trim().is_empty() {
            return Err(anyhow!("pipeline_program must not be empty"));
        }
        if self.handshake.timeout.is_zero() {
            return Err(anyhow!("handshake timeout must be greater than zero"));
        }
        Ok(())
    }

    /// Frame geometry; every read from the pipeline is exactly this many bytes.
    pub fn frame_layout(&self) -> Result<FrameLayout, FrameError> {
        FrameLayout::new(self.width, self.height, self.channels)
    }

    /// Source URI handed to the pipeline, e.g. `rtsp://10.0.0.1:8554/stream`.
    pub fn source_uri(&self) -> String {
        format!("{}://{}{}", self.mode.scheme(), self.host, self.uri_postfix)
    }

    pub fn requires_handshake(&self) -> bool {
        self.exceptional_case == ExceptionalCase::DeviceHandshake
    }
}

fn apply_env(file: &mut SessionConfigFile) -> Result<()> {
    if let Some(mode) = env_value("NETSTREAM_MODE") {
        file.mode = Some(ModeValue::Name(mode));
    }
    if let Some(host) = env_value("NETSTREAM_HOST") {
        file.host = Some(host);
    }
    if let Ok(postfix) = std::env::var("NETSTREAM_URI_POSTFIX") {
        file.uri_postfix = Some(postfix);
    }
    if let Some(topic) = env_value("NETSTREAM_PUB_TOPIC") {
        file.pub_topic = Some(topic);
    }
    if let Some(width) = env_u32("NETSTREAM_WIDTH")? {
        file.width = Some(width);
    }
    if let Some(height) = env_u32("NETSTREAM_HEIGHT")? {
        file.height = Some(height);
    }
    if let Some(channels) = env_u32("NETSTREAM_CHANNELS")? {
        file.channels = Some(channels);
    }
    if let Some(case) = env_u32("NETSTREAM_EXCEPTIONAL_CASE")? {
        file.exceptional_case = Some(case);
    }
    if let Some(program) = env_value("NETSTREAM_PIPELINE_PROGRAM") {
        file.pipeline_program = Some(program);
    }
    Ok(())
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_u32(key: &str) -> Result<Option<u32>> {
    match env_value(key) {
        Some(raw) => {
            let value = raw
                .trim()
                .parse()
                .map_err(|_| anyhow!("{} must be a non-negative integer", key))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn validate_topic(topic: &str) -> Result<()> {
    if topic.trim().is_empty() {
        return Err(anyhow!("pub_topic must not be empty"));
    }
    if topic.contains(['+', '#']) {
        return Err(anyhow!(
            "pub_topic '{}' must not contain MQTT wildcards",
            topic
        ));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<SessionConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
