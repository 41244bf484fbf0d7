//! Frame publishing.
//!
//! The session loop hands every frame to a `FramePublisher`; the broker-backed
//! implementation, with broker address and TLS setup, lives in `mqtt`.

pub mod mqtt;

use thiserror::Error;

use crate::frame::FrameMessage;
use crate::message::ConversionError;

pub use mqtt::{Broker, MqttPublisher, MqttSettings};

#[derive(Debug, Error)]
pub enum PublishError {
    /// The frame could not be turned into an image message. Nothing was sent.
    #[error("image conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    #[error("transport rejected message: {0}")]
    Transport(String),
}

/// Sink for stamped frames, one topic per publisher.
pub trait FramePublisher {
    /// Fire-and-forget: returning `Ok` means the message was handed off, not delivered.
    fn publish(&mut self, message: FrameMessage) -> Result<(), PublishError>;
}
