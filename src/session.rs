//! The streaming session: arm, open, read/publish until something ends it,
//! close, disarm.
//!
//! A session ends on the fifth consecutive read timeout, end of stream, an
//! unexpected read fault, or a shutdown request. Every one of those paths goes
//! through the same teardown: the pipeline is closed exactly once and the
//! device (if any) is disarmed even when closing failed.

use std::fmt;
use std::time::{Duration, SystemTime};
use thiserror::Error;

use crate::config::SessionConfig;
use crate::device::{DeviceHandshake, HandshakeError};
use crate::frame::FrameMessage;
use crate::ingest::{Connector, FrameSource, PipelineStartError, ReadOutcome};
use crate::shutdown::ShutdownSignal;
use crate::transport::{FramePublisher, PublishError};

pub const READ_TIMEOUT: Duration = Duration::from_secs(3);
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Connected,
    Waiting,
    Reading,
    TimedOut,
    Ending,
    Terminated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndReason {
    TimeoutsExhausted,
    Eof,
    Shutdown,
    ReadFault,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimeoutsExhausted => write!(f, "{} consecutive timeouts", MAX_CONSECUTIVE_TIMEOUTS),
            Self::Eof => f.write_str("end of stream"),
            Self::Shutdown => f.write_str("shutdown requested"),
            Self::ReadFault => f.write_str("read fault"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    PipelineStart(#[from] PipelineStartError),

    #[error("session already ran")]
    AlreadyRun,
}

/// Consecutive read timeouts since the last frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeoutCounter {
    count: u32,
}

impl TimeoutCounter {
    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Record one timeout and return the new count.
    pub fn strike(&mut self) -> u32 {
        self.count = self.count.saturating_add(1);
        self.count
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn exhausted(&self) -> bool {
        self.count >= MAX_CONSECUTIVE_TIMEOUTS
    }
}

/// What happened during one session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionReport {
    pub end_reason: EndReason,
    pub frames_published: u64,
    pub conversion_faults: u64,
    pub publish_faults: u64,
    pub timeouts_total: u64,
    pub peak_consecutive_timeouts: u32,
    /// Set when closing the pipeline reported an error.
    pub close_error: Option<String>,
}

impl SessionReport {
    fn new(end_reason: EndReason) -> Self {
        Self {
            end_reason,
            frames_published: 0,
            conversion_faults: 0,
            publish_faults: 0,
            timeouts_total: 0,
            peak_consecutive_timeouts: 0,
            close_error: None,
        }
    }
}

/// One streaming session over a `Connector` and a `FramePublisher`.
pub struct StreamLoop<C: Connector, P: FramePublisher> {
    config: SessionConfig,
    connector: C,
    publisher: P,
    handshake: Option<DeviceHandshake>,
    shutdown: ShutdownSignal,
    read_timeout: Duration,
    state: SessionState,
}

impl<C: Connector, P: FramePublisher> StreamLoop<C, P> {
    /// Session over `connector` and `publisher`. The device handshake is the
    /// HTTP one when `config` asks for it.
    pub fn new(config: SessionConfig, connector: C, publisher: P, shutdown: ShutdownSignal) -> Self {
        let handshake = DeviceHandshake::for_config(&config);
        Self {
            config,
            connector,
            publisher,
            handshake,
            shutdown,
            read_timeout: READ_TIMEOUT,
            state: SessionState::Starting,
        }
    }

    pub fn with_handshake(mut self, handshake: Option<DeviceHandshake>) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn into_parts(self) -> (C, P) {
        (self.connector, self.publisher)
    }

    /// Run the session to completion. Runs at most once.
    ///
    /// `Err` means the session never started streaming (handshake or pipeline
    /// start failed). Everything after a successful open ends in `Ok`.
    pub fn run(&mut self) -> Result<SessionReport, SessionError> {
        if self.state != SessionState::Starting {
            return Err(SessionError::AlreadyRun);
        }

        if let Some(handshake) = self.handshake.as_mut() {
            log::info!("arming device at {}", self.config.host);
            if let Err(e) = handshake.pre_arm() {
                log::error!("{}", e);
                self.state = SessionState::Terminated;
                return Err(e.into());
            }
        }

        let mut source = match self.connector.open(&self.config) {
            Ok(source) => source,
            Err(e) => {
                log::error!("{}", e);
                self.disarm();
                self.state = SessionState::Terminated;
                return Err(e.into());
            }
        };
        self.state = SessionState::Connected;
        log::info!(
            "streaming {} to '{}'",
            self.config.source_uri(),
            self.config.pub_topic
        );

        let mut report = self.stream(&mut source);

        self.state = SessionState::Ending;
        if let Err(e) = self.connector.close(&mut source) {
            log::error!("failed to close pipeline: {}", e);
            report.close_error = Some(e.to_string());
        }
        self.disarm();
        self.state = SessionState::Terminated;

        log::info!(
            "session ended ({}): {} frames published, {} timeouts",
            report.end_reason,
            report.frames_published,
            report.timeouts_total
        );
        Ok(report)
    }

    fn stream(&mut self, source: &mut C::Source) -> SessionReport {
        let mut report = SessionReport::new(EndReason::Shutdown);
        let mut timeouts = TimeoutCounter::default();

        report.end_reason = loop {
            if self.shutdown.is_requested() {
                log::info!("shutdown requested");
                break EndReason::Shutdown;
            }

            self.state = SessionState::Waiting;
            match source.read_frame(self.read_timeout) {
                Ok(ReadOutcome::FrameReady(frame)) => {
                    self.state = SessionState::Reading;
                    timeouts.reset();
                    let message =
                        FrameMessage::new(frame, SystemTime::now(), self.config.pub_topic.as_str());
                    match self.publisher.publish(message) {
                        Ok(()) => report.frames_published += 1,
                        Err(PublishError::Conversion(e)) => {
                            report.conversion_faults += 1;
                            log::warn!("dropping frame: {}", e);
                        }
                        Err(e @ PublishError::Transport(_)) => {
                            report.publish_faults += 1;
                            log::warn!("dropping frame: {}", e);
                        }
                    }
                }
                Ok(ReadOutcome::TimedOut) => {
                    self.state = SessionState::TimedOut;
                    let count = timeouts.strike();
                    report.timeouts_total += 1;
                    report.peak_consecutive_timeouts = report.peak_consecutive_timeouts.max(count);
                    log::warn!("timed out: {} / {}", count, MAX_CONSECUTIVE_TIMEOUTS);
                    if timeouts.exhausted() {
                        break EndReason::TimeoutsExhausted;
                    }
                }
                Ok(ReadOutcome::Eof) => {
                    log::info!("pipeline stream ended");
                    break EndReason::Eof;
                }
                Err(e) => {
                    log::error!("pipeline read failed: {}", e);
                    break EndReason::ReadFault;
                }
            }
        };
        report
    }

    fn disarm(&mut self) {
        if let Some(handshake) = self.handshake.as_mut() {
            match handshake.post_disarm() {
                Ok(()) => log::info!("device disarmed"),
                Err(e) => log::warn!("{}", e),
            }
        }
    }
}
