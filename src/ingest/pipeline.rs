//! GStreamer pipeline process.
//!
//! `ConnectionManager` builds the `gst-launch-1.0` invocation for the configured
//! transport mode, spawns it with stdout captured, and tears it down. The
//! process does all protocol and codec work; we only own its lifetime and its
//! stdout.
//!
//! Teardown is explicit: `PipelineHandle` has no `Drop` impl, and
//! `ConnectionManager::close` is the only path that terminates the process.

use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

use super::reader::{FrameReader, ReadOutcome};
use super::{Connector, FrameSource};
use crate::config::{SessionConfig, TransportMode};
use crate::frame::{FrameError, FrameLayout};

const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum PipelineStartError {
    #[error("failed to spawn pipeline program '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("pipeline program '{program}' started without a captured stdout")]
    MissingStdout { program: String },

    #[error("invalid frame layout: {0}")]
    Layout(#[from] FrameError),
}

/// Program and argv for the pipeline process. Arguments are passed as-is, no shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl PipelineCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// H.264 over RTP (UDP listen) or RTSP pull, decoded to raw BGR on stdout.
    pub fn for_session(config: &SessionConfig) -> Self {
        let uri = config.source_uri();
        let mut args = vec!["--quiet".to_string()];
        match config.mode {
            TransportMode::Udp => {
                args.extend([
                    "udpsrc".to_string(),
                    format!("uri={}", uri),
                    "close-socket=false".to_string(),
                    "multicast-iface=false".to_string(),
                    "auto-multicast=true".to_string(),
                    "!".to_string(),
                    "application/x-rtp,".to_string(),
                    "payload=96".to_string(),
                ]);
            }
            TransportMode::Rtsp => {
                args.extend(["rtspsrc".to_string(), format!("location={}", uri)]);
            }
        }
        args.extend(
            [
                "!",
                "queue2",
                "!",
                "rtph264depay",
                "!",
                "avdec_h264",
                "!",
                "videoconvert",
                "!",
                "capsfilter",
                "caps=video/x-raw, format=BGR",
                "!",
                "fdsink",
            ]
            .map(String::from),
        );
        Self {
            program: config.pipeline_program.clone(),
            args,
        }
    }

    /// Shell-style rendering for logs.
    pub fn display(&self) -> String {
        let mut rendered = self.program.clone();
        for arg in &self.args {
            rendered.push(' ');
            if arg.contains(' ') {
                rendered.push('"');
                rendered.push_str(arg);
                rendered.push('"');
            } else {
                rendered.push_str(arg);
            }
        }
        rendered
    }
}

/// Spawns and tears down pipeline processes.
#[derive(Clone, Debug)]
pub struct ConnectionManager {
    terminate_grace: Duration,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self {
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        }
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long a process gets to exit after SIGTERM before it is killed.
    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Spawn `command` with stdout captured as a frame pipe of `layout`.
    ///
    /// The child gets the default SIGPIPE disposition so a stalled or departed
    /// reader terminates it instead of leaving it wedged on a broken pipe.
    pub fn spawn(
        &self,
        command: &PipelineCommand,
        layout: FrameLayout,
    ) -> Result<PipelineHandle, PipelineStartError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        unsafe {
            cmd.pre_exec(|| {
                if libc::signal(libc::SIGPIPE, libc::SIG_DFL) == libc::SIG_ERR {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|source| PipelineStartError::Spawn {
            program: command.program.clone(),
            source,
        })?;
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PipelineStartError::MissingStdout {
                program: command.program.clone(),
            });
        };

        log::debug!("pipeline pid {}: {}", child.id(), command.display());
        Ok(PipelineHandle {
            pid: child.id(),
            child: Some(child),
            reader: Some(FrameReader::new(stdout, layout)),
            terminate_grace: self.terminate_grace,
        })
    }

    /// Close the stream and terminate the process. Idempotent.
    pub fn close(&self, handle: &mut PipelineHandle) -> io::Result<()> {
        handle.close()
    }
}

impl Connector for ConnectionManager {
    type Source = PipelineHandle;

    fn open(&mut self, config: &SessionConfig) -> Result<PipelineHandle, PipelineStartError> {
        let layout = config.frame_layout()?;
        let command = PipelineCommand::for_session(config);
        log::info!("starting pipeline: {}", command.display());
        self.spawn(&command, layout)
    }

    fn close(&mut self, source: &mut PipelineHandle) -> io::Result<()> {
        source.close()
    }
}

/// A running pipeline process and the read end of its stdout.
pub struct PipelineHandle {
    pid: u32,
    child: Option<Child>,
    reader: Option<FrameReader<ChildStdout>>,
    terminate_grace: Duration,
}

impl PipelineHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_closed(&self) -> bool {
        self.child.is_none()
    }

    fn close(&mut self) -> io::Result<()> {
        // Closing our end first lets a writer blocked on a full pipe see EPIPE.
        drop(self.reader.take());
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        match terminate(child, self.terminate_grace) {
            Ok(status) => {
                self.child = None;
                log::info!("pipeline pid {} exited: {}", self.pid, status);
                Ok(())
            }
            Err(e) => {
                // Keep the child so a later close() retries the reap.
                let _ = child.kill();
                Err(e)
            }
        }
    }
}

impl FrameSource for PipelineHandle {
    fn read_frame(&mut self, timeout: Duration) -> io::Result<ReadOutcome> {
        let reader = self.reader.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "pipeline already closed")
        })?;
        reader.read(timeout)
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Always reaps the child.
fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    let pid = child.id() as libc::pid_t;
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            log::warn!("failed to signal pipeline pid {}: {}", pid, err);
        }
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }

    log::warn!(
        "pipeline pid {} still running {:?} after SIGTERM, killing",
        pid,
        grace
    );
    if let Err(e) = child.kill() {
        if e.kind() != io::ErrorKind::InvalidInput {
            return Err(e);
        }
    }
    child.wait()
}
