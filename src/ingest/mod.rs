//! Frame ingestion from the decoding pipeline.
//!
//! - `pipeline`: spawns and tears down the `gst-launch-1.0` process (ConnectionManager)
//! - `reader`: timeout-bounded, frame-sized reads from its stdout (FrameReader)
//!
//! The session loop only sees the `Connector` and `FrameSource` traits, so the
//! process-backed implementation can be swapped for scripted sources in tests.

pub mod pipeline;
pub mod reader;

use std::io;
use std::time::Duration;

use crate::config::SessionConfig;

pub use pipeline::{ConnectionManager, PipelineCommand, PipelineHandle, PipelineStartError};
pub use reader::{FrameReader, ReadOutcome};

/// Something frames can be pulled from, one complete frame at a time.
pub trait FrameSource {
    /// Wait up to `timeout` for one frame. `Err` is an unexpected fault that ends the session.
    fn read_frame(&mut self, timeout: Duration) -> io::Result<ReadOutcome>;
}

/// Opens and releases frame sources.
pub trait Connector {
    type Source: FrameSource;

    fn open(&mut self, config: &SessionConfig) -> Result<Self::Source, PipelineStartError>;

    /// Release `source`. Must be safe to call on a source that already faulted.
    fn close(&mut self, source: &mut Self::Source) -> io::Result<()>;
}
