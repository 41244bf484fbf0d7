//! Raw frame types.
//!
//! - `FrameLayout`: frame geometry and the fixed byte length derived from it.
//! - `Frame`: one complete pixel buffer, row-major, interleaved BGR channels.
//! - `FrameMessage`: a frame stamped with its read-completion time and bound for a channel.
//!
//! A `Frame` can only be built from a buffer of exactly `layout.byte_len()` bytes,
//! so a partially read buffer never becomes a frame.

use std::time::SystemTime;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame dimensions must be positive (width={width}, height={height}, channels={channels})")]
    EmptyLayout {
        width: u32,
        height: u32,
        channels: u32,
    },

    #[error("frame byte length overflows usize (width={width}, height={height}, channels={channels})")]
    LayoutOverflow {
        width: u32,
        height: u32,
        channels: u32,
    },

    #[error("frame buffer holds {actual} bytes, layout requires {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Geometry of every frame in a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameLayout {
    width: u32,
    height: u32,
    channels: u32,
    byte_len: usize,
}

impl FrameLayout {
    pub fn new(width: u32, height: u32, channels: u32) -> Result<Self, FrameError> {
        if width == 0 || height == 0 || channels == 0 {
            return Err(FrameError::EmptyLayout {
                width,
                height,
                channels,
            });
        }
        let byte_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(channels as usize))
            .ok_or(FrameError::LayoutOverflow {
                width,
                height,
                channels,
            })?;
        Ok(Self {
            width,
            height,
            channels,
            byte_len,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    /// `width * height * channels`: the exact size of every read.
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    /// Bytes per row.
    pub fn row_stride(&self) -> usize {
        self.width as usize * self.channels as usize
    }
}

/// One decoded frame.
///
/// Not `Clone`: a frame is produced once per read and moved into the publish step.
#[derive(Debug)]
pub struct Frame {
    data: Vec<u8>,
    layout: FrameLayout,
}

impl Frame {
    pub fn from_raw(data: Vec<u8>, layout: FrameLayout) -> Result<Self, FrameError> {
        if data.len() != layout.byte_len() {
            return Err(FrameError::LengthMismatch {
                expected: layout.byte_len(),
                actual: data.len(),
            });
        }
        Ok(Self { data, layout })
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    pub fn width(&self) -> u32 {
        self.layout.width
    }

    pub fn height(&self) -> u32 {
        self.layout.height
    }

    pub fn channels(&self) -> u32 {
        self.layout.channels
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Bytes of row `row`, or `None` past the last row.
    pub fn row(&self, row: u32) -> Option<&[u8]> {
        if row >= self.layout.height {
            return None;
        }
        let stride = self.layout.row_stride();
        let start = row as usize * stride;
        self.data.get(start..start + stride)
    }

    /// Interleaved channel bytes of one pixel (B, G, R for a 3-channel frame).
    pub fn pixel(&self, row: u32, col: u32) -> Option<&[u8]> {
        if col >= self.layout.width {
            return None;
        }
        let channels = self.layout.channels as usize;
        let start = col as usize * channels;
        self.row(row)?.get(start..start + channels)
    }
}

/// A frame on its way to the publish-subscribe channel.
#[derive(Debug)]
pub struct FrameMessage {
    frame: Frame,
    captured_at: SystemTime,
    channel: String,
}

impl FrameMessage {
    pub fn new(frame: Frame, captured_at: SystemTime, channel: impl Into<String>) -> Self {
        Self {
            frame,
            captured_at,
            channel: channel.into(),
        }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Wall-clock time at which the read of this frame completed.
    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn into_frame(self) -> Frame {
        self.frame
    }
}
