//! Wire form of a `FrameMessage`.
//!
//! The payload carries the same fields as a ROS `sensor_msgs/Image`:
//!
//! ```text
//! +----------------+----------------------+------------------------+
//! | header_len u32 | JSON `ImageHeader`   | pixel data             |
//! | (big endian)   | (header_len bytes)   | (height * step bytes)  |
//! +----------------+----------------------+------------------------+
//! ```

use serde::{Deserialize, Serialize};
use std::time::UNIX_EPOCH;
use thiserror::Error;

use crate::frame::FrameMessage;

const HEADER_LEN_BYTES: usize = 4;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("no image encoding for {0} channels (expected 1, 3 or 4)")]
    UnsupportedChannels(u32),

    #[error("pixel buffer holds {actual} bytes, image header declares {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("capture timestamp is before the unix epoch")]
    StampBeforeEpoch,

    #[error("image header is not valid JSON: {0}")]
    Header(#[from] serde_json::Error),

    #[error("image payload truncated")]
    Truncated,
}

/// Capture time split the way ROS stamps are.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stamp {
    pub secs: u64,
    pub nsecs: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageHeader {
    pub stamp: Stamp,
    pub height: u32,
    pub width: u32,
    pub encoding: String,
    pub is_bigendian: u8,
    pub step: u32,
}

/// Image encoding name for an interleaved 8-bit frame.
pub fn encoding_for_channels(channels: u32) -> Result<&'static str, ConversionError> {
    match channels {
        1 => Ok("mono8"),
        3 => Ok("bgr8"),
        4 => Ok("bgra8"),
        other => Err(ConversionError::UnsupportedChannels(other)),
    }
}

pub fn encode(message: &FrameMessage) -> Result<Vec<u8>, ConversionError> {
    let frame = message.frame();
    let layout = frame.layout();
    let encoding = encoding_for_channels(layout.channels())?;
    let expected = layout.byte_len();
    let pixels = frame.as_bytes();
    if pixels.len() != expected {
        return Err(ConversionError::LengthMismatch {
            expected,
            actual: pixels.len(),
        });
    }
    let since_epoch = message
        .captured_at()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| ConversionError::StampBeforeEpoch)?;

    let header = ImageHeader {
        stamp: Stamp {
            secs: since_epoch.as_secs(),
            nsecs: since_epoch.subsec_nanos(),
        },
        height: layout.height(),
        width: layout.width(),
        encoding: encoding.to_string(),
        is_bigendian: 0,
        step: layout.row_stride() as u32,
    };
    let header_json = serde_json::to_vec(&header)?;

    let mut payload = Vec::with_capacity(HEADER_LEN_BYTES + header_json.len() + pixels.len());
    payload.extend_from_slice(&(header_json.len() as u32).to_be_bytes());
    payload.extend_from_slice(&header_json);
    payload.extend_from_slice(pixels);
    Ok(payload)
}

/// Split a payload back into its header and pixel bytes.
pub fn decode(payload: &[u8]) -> Result<(ImageHeader, &[u8]), ConversionError> {
    let len_bytes: [u8; HEADER_LEN_BYTES] = payload
        .get(..HEADER_LEN_BYTES)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(ConversionError::Truncated)?;
    let header_len = u32::from_be_bytes(len_bytes) as usize;
    let header_end = HEADER_LEN_BYTES
        .checked_add(header_len)
        .ok_or(ConversionError::Truncated)?;
    let header_bytes = payload
        .get(HEADER_LEN_BYTES..header_end)
        .ok_or(ConversionError::Truncated)?;
    let header: ImageHeader = serde_json::from_slice(header_bytes)?;
    let pixels = &payload[header_end..];
    let expected = header.step as usize * header.height as usize;
    if pixels.len() != expected {
        return Err(ConversionError::LengthMismatch {
            expected,
            actual: pixels.len(),
        });
    }
    Ok((header, pixels))
}
