//! Device arm/disarm handshake.
//!
//! Some sources (the multibeam sonar) only stream after being armed through
//! their HTTP API, and should be disarmed once we stop reading. Each call is a
//! single synchronous attempt; there is no retry.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::config::{SessionConfig, TransportMode};

const TRANSPONDER_PATH: &str = "/transponder";
const STREAM_TYPE_PATH: &str = "/streamtype";
const STREAM_TYPE_UDP: u32 = 1;
const STREAM_TYPE_RTSP: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Patch,
    Put,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Patch => "PATCH",
            Self::Put => "PUT",
        }
    }
}

/// The device control API, addressed by paths relative to its `/api/v1` root.
pub trait ControlApi {
    fn send(&mut self, method: Method, path: &str, body: &Value) -> Result<()>;
}

/// `ControlApi` over HTTP.
pub struct HttpControlApi {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpControlApi {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            base_url: format!("http://{}:{}/api/v1", host, port),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl ControlApi for HttpControlApi {
    fn send(&mut self, method: Method, path: &str, body: &Value) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .agent
            .request(method.as_str(), &url)
            .set("Content-Type", "application/json")
            .send_string(&body.to_string())
            .with_context(|| format!("{} {}", method.as_str(), url))?;
        log::debug!("{} {} -> {}", method.as_str(), url, response.status());
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStep {
    EnableTransponder,
    SelectStreamType,
    DisableTransponder,
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EnableTransponder => f.write_str("enable transponder"),
            Self::SelectStreamType => f.write_str("select stream type"),
            Self::DisableTransponder => f.write_str("disable transponder"),
        }
    }
}

#[derive(Debug, Error)]
#[error("device handshake failed at '{step}': {source}")]
pub struct HandshakeError {
    pub step: HandshakeStep,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

/// Arms the device before a session and disarms it after.
pub struct DeviceHandshake {
    api: Box<dyn ControlApi>,
    sonar_range: u32,
    stream_type: u32,
}

impl DeviceHandshake {
    pub fn new(api: Box<dyn ControlApi>, sonar_range: u32, stream_type: u32) -> Self {
        Self {
            api,
            sonar_range,
            stream_type,
        }
    }

    /// HTTP handshake for `config`, or `None` when the source needs no handshake.
    pub fn for_config(config: &SessionConfig) -> Option<Self> {
        if !config.requires_handshake() {
            return None;
        }
        let api = HttpControlApi::new(
            &config.host,
            config.handshake.control_port,
            config.handshake.timeout,
        );
        log::debug!("device control api at {}", api.base_url());
        Some(Self::with_api(config, Box::new(api)))
    }

    /// Handshake for `config` over a caller-supplied API.
    pub fn with_api(config: &SessionConfig, api: Box<dyn ControlApi>) -> Self {
        let stream_type = config
            .handshake
            .stream_type
            .unwrap_or_else(|| stream_type_for(config.mode));
        Self::new(api, config.handshake.sonar_range, stream_type)
    }

    /// Enable the sonar at its operating range, then select the stream type.
    pub fn pre_arm(&mut self) -> Result<(), HandshakeError> {
        self.call(
            HandshakeStep::EnableTransponder,
            Method::Patch,
            TRANSPONDER_PATH,
            json!({ "enable": true, "sonar_range": self.sonar_range }),
        )?;
        self.call(
            HandshakeStep::SelectStreamType,
            Method::Put,
            STREAM_TYPE_PATH,
            json!({ "value": self.stream_type }),
        )
    }

    /// Disable the sonar.
    pub fn post_disarm(&mut self) -> Result<(), HandshakeError> {
        self.call(
            HandshakeStep::DisableTransponder,
            Method::Patch,
            TRANSPONDER_PATH,
            json!({ "enable": false }),
        )
    }

    fn call(
        &mut self,
        step: HandshakeStep,
        method: Method,
        path: &str,
        body: Value,
    ) -> Result<(), HandshakeError> {
        self.api
            .send(method, path, &body)
            .map_err(|e| HandshakeError {
                step,
                source: e.into(),
            })
    }
}

/// Stream type value the device expects for each transport mode.
pub fn stream_type_for(mode: TransportMode) -> u32 {
    match mode {
        TransportMode::Udp => STREAM_TYPE_UDP,
        TransportMode::Rtsp => STREAM_TYPE_RTSP,
    }
}
