//! netstream
//!
//! Bridges a network video source into a publish-subscribe topic. An external
//! GStreamer process receives and decodes the stream (H.264 over RTP/UDP or
//! RTSP) and writes raw BGR frames to its stdout; this crate reads those
//! frames in fixed-size chunks and publishes each one as an image message.
//!
//! # Session lifecycle
//!
//! 1. Optional device arm over HTTP (sources that need it)
//! 2. Spawn the pipeline process
//! 3. Read and publish frames; a read that sees no data within 3 s is a strike
//! 4. Stop on the fifth consecutive strike, end of stream, a read fault, or shutdown
//! 5. Close the pipeline exactly once, then disarm the device
//!
//! # Module Structure
//!
//! - `config`: SessionConfig (file, env overrides, validation)
//! - `frame`: Frame layout and FrameMessage
//! - `ingest`: Pipeline process and frame reader
//! - `message`: Image message wire form
//! - `device`: Arm/disarm handshake
//! - `session`: StreamLoop
//! - `transport`: FramePublisher and the MQTT publisher
//! - `shutdown`: Signal-driven shutdown flag

#[cfg(not(unix))]
compile_error!("netstream drives a child process through Unix pipes and signals");

pub mod config;
pub mod device;
pub mod frame;
pub mod ingest;
pub mod message;
pub mod session;
pub mod shutdown;
pub mod transport;

pub use config::{ExceptionalCase, HandshakeSettings, SessionConfig, TransportMode};
pub use device::{ControlApi, DeviceHandshake, HandshakeError, HttpControlApi};
pub use frame::{Frame, FrameError, FrameLayout, FrameMessage};
pub use ingest::{
    ConnectionManager, Connector, FrameReader, FrameSource, PipelineCommand, PipelineHandle,
    PipelineStartError, ReadOutcome,
};
pub use session::{
    EndReason, SessionError, SessionReport, SessionState, StreamLoop, TimeoutCounter,
    MAX_CONSECUTIVE_TIMEOUTS, READ_TIMEOUT,
};
pub use shutdown::ShutdownSignal;
pub use transport::{FramePublisher, MqttPublisher, MqttSettings, PublishError};
