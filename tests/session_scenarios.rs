//! StreamLoop driven by scripted sources, socket-backed readers, and recording sinks.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde_json::{json, Value};

use netstream::config::{ExceptionalCase, HandshakeSettings, SessionConfig, TransportMode};
use netstream::device::{ControlApi, DeviceHandshake, Method};
use netstream::frame::{Frame, FrameLayout, FrameMessage};
use netstream::ingest::{Connector, FrameReader, FrameSource, PipelineStartError, ReadOutcome};
use netstream::session::{EndReason, SessionError, SessionState, StreamLoop};
use netstream::shutdown::ShutdownSignal;
use netstream::transport::{FramePublisher, PublishError};

const FAST_TIMEOUT: Duration = Duration::from_millis(250);

fn config(width: u32, height: u32, channels: u32) -> SessionConfig {
    SessionConfig {
        mode: TransportMode::Rtsp,
        pub_topic: "camera/image_raw".to_string(),
        width,
        height,
        channels,
        host: "192.168.2.42".to_string(),
        uri_postfix: ":8554/raw".to_string(),
        exceptional_case: ExceptionalCase::None,
        pipeline_program: "gst-launch-1.0".to_string(),
        handshake: HandshakeSettings::default(),
    }
}

fn handshake_config() -> SessionConfig {
    SessionConfig {
        exceptional_case: ExceptionalCase::DeviceHandshake,
        ..config(4, 2, 3)
    }
}

// --- scripted source ---

enum Step {
    Frame(u8),
    Timeout,
    Fault,
}

struct ScriptedSource {
    layout: FrameLayout,
    steps: VecDeque<Step>,
}

impl FrameSource for ScriptedSource {
    fn read_frame(&mut self, _timeout: Duration) -> io::Result<ReadOutcome> {
        match self.steps.pop_front() {
            Some(Step::Frame(fill)) => {
                let frame = Frame::from_raw(vec![fill; self.layout.byte_len()], self.layout)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(ReadOutcome::FrameReady(frame))
            }
            Some(Step::Timeout) => Ok(ReadOutcome::TimedOut),
            Some(Step::Fault) => Err(io::Error::new(io::ErrorKind::Other, "pipe fault")),
            None => Ok(ReadOutcome::Eof),
        }
    }
}

#[derive(Default)]
struct ScriptedConnector {
    steps: Vec<Step>,
    fail_open: bool,
    fail_close: bool,
    opens: usize,
    closes: usize,
}

impl ScriptedConnector {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }
}

impl Connector for ScriptedConnector {
    type Source = ScriptedSource;

    fn open(&mut self, config: &SessionConfig) -> Result<ScriptedSource, PipelineStartError> {
        self.opens += 1;
        if self.fail_open {
            return Err(PipelineStartError::MissingStdout {
                program: config.pipeline_program.clone(),
            });
        }
        Ok(ScriptedSource {
            layout: config.frame_layout()?,
            steps: std::mem::take(&mut self.steps).into(),
        })
    }

    fn close(&mut self, _source: &mut ScriptedSource) -> io::Result<()> {
        self.closes += 1;
        if self.fail_close {
            return Err(io::Error::new(io::ErrorKind::Other, "pipeline refused to exit"));
        }
        Ok(())
    }
}

// --- socket-backed source ---

enum Chunk {
    Bytes(usize, u8),
    Pause(Duration),
}

/// Feeds a real `FrameReader` from a writer thread over a socket pair.
struct SocketConnector {
    plan: Vec<Chunk>,
    opens: usize,
    closes: usize,
}

impl SocketConnector {
    fn new(plan: Vec<Chunk>) -> Self {
        Self {
            plan,
            opens: 0,
            closes: 0,
        }
    }
}

impl Connector for SocketConnector {
    type Source = FrameReader<UnixStream>;

    fn open(
        &mut self,
        config: &SessionConfig,
    ) -> Result<FrameReader<UnixStream>, PipelineStartError> {
        self.opens += 1;
        let layout = config.frame_layout()?;
        let (reader, mut writer) = UnixStream::pair().map_err(|source| PipelineStartError::Spawn {
            program: "socketpair".to_string(),
            source,
        })?;
        let plan = std::mem::take(&mut self.plan);
        std::thread::spawn(move || {
            for chunk in plan {
                match chunk {
                    Chunk::Bytes(len, fill) => {
                        if writer.write_all(&vec![fill; len]).is_err() {
                            return;
                        }
                    }
                    Chunk::Pause(pause) => std::thread::sleep(pause),
                }
            }
        });
        Ok(FrameReader::new(reader, layout))
    }

    fn close(&mut self, _source: &mut FrameReader<UnixStream>) -> io::Result<()> {
        self.closes += 1;
        Ok(())
    }
}

// --- recording publisher ---

struct Published {
    channel: String,
    first_byte: u8,
    len: usize,
    captured_at: SystemTime,
}

#[derive(Default)]
struct RecordingPublisher {
    published: Vec<Published>,
    reject_all: bool,
    stop_after: Option<(usize, ShutdownSignal)>,
}

impl FramePublisher for RecordingPublisher {
    fn publish(&mut self, message: FrameMessage) -> Result<(), PublishError> {
        netstream::message::encode(&message)?;
        if self.reject_all {
            return Err(PublishError::Transport("queue full".to_string()));
        }
        let bytes = message.frame().as_bytes();
        self.published.push(Published {
            channel: message.channel().to_string(),
            first_byte: bytes[0],
            len: bytes.len(),
            captured_at: message.captured_at(),
        });
        if let Some((limit, signal)) = &self.stop_after {
            if self.published.len() >= *limit {
                signal.request();
            }
        }
        Ok(())
    }
}

// --- recording control api ---

type Call = (Method, String, Value);

/// Records every call; refuses calls to `fail_path`.
#[derive(Clone, Default)]
struct RecordingControlApi {
    calls: Arc<Mutex<Vec<Call>>>,
    fail_path: Option<&'static str>,
}

impl RecordingControlApi {
    fn new() -> Self {
        Self::default()
    }

    fn failing_on(path: &'static str) -> Self {
        Self {
            fail_path: Some(path),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

impl ControlApi for RecordingControlApi {
    fn send(&mut self, method: Method, path: &str, body: &Value) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((method, path.to_string(), body.clone()));
        if self.fail_path == Some(path) {
            anyhow::bail!("{} {} refused", method.as_str(), path);
        }
        Ok(())
    }
}

fn frames(count: u8) -> Vec<Step> {
    (0..count).map(Step::Frame).collect()
}

#[test]
fn ten_frames_then_idle_ends_after_five_timeouts() {
    let layout = FrameLayout::new(640, 480, 3).unwrap();
    let mut plan: Vec<Chunk> = (0..10)
        .map(|i| Chunk::Bytes(layout.byte_len(), i as u8))
        .collect();
    plan.push(Chunk::Pause(Duration::from_secs(3)));

    let started = SystemTime::now();
    let mut session = StreamLoop::new(
        config(640, 480, 3),
        SocketConnector::new(plan),
        RecordingPublisher::default(),
        ShutdownSignal::new(),
    )
    .with_read_timeout(FAST_TIMEOUT);

    let report = session.run().expect("session runs");
    let finished = SystemTime::now();

    assert_eq!(report.end_reason, EndReason::TimeoutsExhausted);
    assert_eq!(report.frames_published, 10);
    assert_eq!(report.timeouts_total, 5);
    assert_eq!(report.peak_consecutive_timeouts, 5);
    assert_eq!(report.close_error, None);
    assert_eq!(session.state(), SessionState::Terminated);
    assert_eq!(session.connector().opens, 1);
    assert_eq!(session.connector().closes, 1);

    let published = &session.publisher().published;
    assert_eq!(published.len(), 10);
    for (i, p) in published.iter().enumerate() {
        assert_eq!(p.first_byte, i as u8);
        assert_eq!(p.len, 921_600);
        assert_eq!(p.channel, "camera/image_raw");
        assert!(p.captured_at >= started && p.captured_at <= finished);
    }
    assert!(published
        .windows(2)
        .all(|pair| pair[0].captured_at <= pair[1].captured_at));
}

#[test]
fn short_read_ends_session_without_publishing() {
    let plan = vec![Chunk::Bytes(900_000, 7)];
    let mut session = StreamLoop::new(
        config(640, 480, 3),
        SocketConnector::new(plan),
        RecordingPublisher::default(),
        ShutdownSignal::new(),
    )
    .with_read_timeout(Duration::from_secs(5));

    let report = session.run().expect("session runs");

    assert_eq!(report.end_reason, EndReason::Eof);
    assert_eq!(report.frames_published, 0);
    assert!(session.publisher().published.is_empty());
    assert_eq!(session.connector().closes, 1);
}

#[test]
fn upstream_stalling_mid_frame_ends_within_read_window() {
    // Writer stays connected after half a frame, so only the deadline can end the read.
    let plan = vec![
        Chunk::Bytes(460_800, 7),
        Chunk::Pause(Duration::from_secs(5)),
    ];
    let started = std::time::Instant::now();
    let mut session = StreamLoop::new(
        config(640, 480, 3),
        SocketConnector::new(plan),
        RecordingPublisher::default(),
        ShutdownSignal::new(),
    )
    .with_read_timeout(FAST_TIMEOUT);

    let report = session.run().expect("session runs");

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(report.end_reason, EndReason::Eof);
    assert_eq!(report.frames_published, 0);
    assert_eq!(session.connector().closes, 1);
}

#[test]
fn frame_between_timeouts_resets_the_streak() {
    let mut steps: Vec<Step> = (0..4).map(|_| Step::Timeout).collect();
    steps.push(Step::Frame(1));
    steps.extend((0..5).map(|_| Step::Timeout));

    let mut session = StreamLoop::new(
        config(4, 2, 3),
        ScriptedConnector::new(steps),
        RecordingPublisher::default(),
        ShutdownSignal::new(),
    );
    let report = session.run().expect("session runs");

    assert_eq!(report.end_reason, EndReason::TimeoutsExhausted);
    assert_eq!(report.frames_published, 1);
    assert_eq!(report.timeouts_total, 9);
    assert_eq!(report.peak_consecutive_timeouts, 5);
    assert_eq!(session.connector().closes, 1);
}

#[test]
fn four_timeouts_do_not_end_the_session() {
    let mut steps: Vec<Step> = (0..4).map(|_| Step::Timeout).collect();
    steps.extend(frames(2));

    let mut session = StreamLoop::new(
        config(4, 2, 3),
        ScriptedConnector::new(steps),
        RecordingPublisher::default(),
        ShutdownSignal::new(),
    );
    let report = session.run().expect("session runs");

    assert_eq!(report.end_reason, EndReason::Eof);
    assert_eq!(report.frames_published, 2);
    assert_eq!(report.peak_consecutive_timeouts, 4);
}

#[test]
fn read_fault_ends_session_through_close() {
    let mut steps = frames(3);
    steps.push(Step::Fault);
    steps.extend(frames(3));

    let mut session = StreamLoop::new(
        config(4, 2, 3),
        ScriptedConnector::new(steps),
        RecordingPublisher::default(),
        ShutdownSignal::new(),
    );
    let report = session.run().expect("session runs");

    assert_eq!(report.end_reason, EndReason::ReadFault);
    assert_eq!(report.frames_published, 3);
    assert_eq!(session.connector().opens, 1);
    assert_eq!(session.connector().closes, 1);
}

#[test]
fn conversion_fault_drops_frame_and_continues() {
    // Two channels has no image encoding.
    let mut session = StreamLoop::new(
        config(4, 2, 2),
        ScriptedConnector::new(frames(3)),
        RecordingPublisher::default(),
        ShutdownSignal::new(),
    );
    let report = session.run().expect("session runs");

    assert_eq!(report.end_reason, EndReason::Eof);
    assert_eq!(report.conversion_faults, 3);
    assert_eq!(report.frames_published, 0);
    assert_eq!(session.connector().closes, 1);
}

#[test]
fn publish_fault_drops_frame_and_continues() {
    let publisher = RecordingPublisher {
        reject_all: true,
        ..RecordingPublisher::default()
    };
    let mut session = StreamLoop::new(
        config(4, 2, 3),
        ScriptedConnector::new(frames(4)),
        publisher,
        ShutdownSignal::new(),
    );
    let report = session.run().expect("session runs");

    assert_eq!(report.end_reason, EndReason::Eof);
    assert_eq!(report.publish_faults, 4);
    assert_eq!(report.frames_published, 0);
}

#[test]
fn shutdown_before_first_read_still_closes() {
    let shutdown = ShutdownSignal::new();
    shutdown.request();
    let mut session = StreamLoop::new(
        config(4, 2, 3),
        ScriptedConnector::new(frames(5)),
        RecordingPublisher::default(),
        shutdown,
    );
    let report = session.run().expect("session runs");

    assert_eq!(report.end_reason, EndReason::Shutdown);
    assert_eq!(report.frames_published, 0);
    assert_eq!(session.connector().opens, 1);
    assert_eq!(session.connector().closes, 1);
}

#[test]
fn shutdown_mid_stream_stops_at_next_iteration() {
    let shutdown = ShutdownSignal::new();
    let publisher = RecordingPublisher {
        stop_after: Some((3, shutdown.clone())),
        ..RecordingPublisher::default()
    };
    let mut session = StreamLoop::new(
        config(4, 2, 3),
        ScriptedConnector::new(frames(10)),
        publisher,
        shutdown,
    );
    let report = session.run().expect("session runs");

    assert_eq!(report.end_reason, EndReason::Shutdown);
    assert_eq!(report.frames_published, 3);
    assert_eq!(session.connector().closes, 1);
}

#[test]
fn handshake_brackets_the_session() {
    let cfg = handshake_config();
    let api = RecordingControlApi::new();
    let handshake = DeviceHandshake::with_api(&cfg, Box::new(api.clone()));
    let mut session = StreamLoop::new(
        cfg,
        ScriptedConnector::new(frames(2)),
        RecordingPublisher::default(),
        ShutdownSignal::new(),
    )
    .with_handshake(Some(handshake));

    let report = session.run().expect("session runs");
    assert_eq!(report.frames_published, 2);

    let calls = api.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(
        calls[0],
        (
            Method::Patch,
            "/transponder".to_string(),
            json!({ "enable": true, "sonar_range": 40 })
        )
    );
    assert_eq!(
        calls[1],
        (Method::Put, "/streamtype".to_string(), json!({ "value": 2 }))
    );
    assert_eq!(
        calls[2],
        (
            Method::Patch,
            "/transponder".to_string(),
            json!({ "enable": false })
        )
    );
}

#[test]
fn failed_pre_arm_aborts_before_open() {
    let cfg = handshake_config();
    let api = RecordingControlApi::failing_on("/transponder");
    let handshake = DeviceHandshake::with_api(&cfg, Box::new(api.clone()));
    let mut session = StreamLoop::new(
        cfg,
        ScriptedConnector::new(frames(2)),
        RecordingPublisher::default(),
        ShutdownSignal::new(),
    )
    .with_handshake(Some(handshake));

    let err = session.run().unwrap_err();
    assert!(matches!(err, SessionError::Handshake(_)));
    assert_eq!(session.connector().opens, 0);
    assert_eq!(session.connector().closes, 0);
    assert_eq!(api.calls().len(), 1);
    assert_eq!(session.state(), SessionState::Terminated);
}

#[test]
fn failed_open_still_disarms_device() {
    let cfg = handshake_config();
    let api = RecordingControlApi::new();
    let handshake = DeviceHandshake::with_api(&cfg, Box::new(api.clone()));
    let connector = ScriptedConnector {
        fail_open: true,
        ..ScriptedConnector::default()
    };
    let mut session = StreamLoop::new(
        cfg,
        connector,
        RecordingPublisher::default(),
        ShutdownSignal::new(),
    )
    .with_handshake(Some(handshake));

    let err = session.run().unwrap_err();
    assert!(matches!(err, SessionError::PipelineStart(_)));
    assert_eq!(session.connector().closes, 0);
    let calls = api.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2].2, json!({ "enable": false }));
}

#[test]
fn close_error_is_reported_and_device_still_disarmed() {
    let cfg = handshake_config();
    let api = RecordingControlApi::new();
    let handshake = DeviceHandshake::with_api(&cfg, Box::new(api.clone()));
    let connector = ScriptedConnector {
        steps: frames(1),
        fail_close: true,
        ..ScriptedConnector::default()
    };
    let mut session = StreamLoop::new(
        cfg,
        connector,
        RecordingPublisher::default(),
        ShutdownSignal::new(),
    )
    .with_handshake(Some(handshake));

    let report = session.run().expect("session runs");
    assert_eq!(report.frames_published, 1);
    assert!(report
        .close_error
        .as_deref()
        .is_some_and(|e| e.contains("refused to exit")));
    assert_eq!(session.connector().closes, 1);
    assert_eq!(api.calls().last().map(|c| c.2.clone()), Some(json!({ "enable": false })));
}

/// Arms fine, refuses to disarm.
struct DisarmRefusingApi {
    inner: RecordingControlApi,
}

impl ControlApi for DisarmRefusingApi {
    fn send(&mut self, method: Method, path: &str, body: &Value) -> anyhow::Result<()> {
        self.inner.send(method, path, body)?;
        if body.get("enable") == Some(&Value::Bool(false)) {
            anyhow::bail!("device busy");
        }
        Ok(())
    }
}

#[test]
fn failed_disarm_is_logged_not_fatal() {
    let cfg = handshake_config();
    let recorder = RecordingControlApi::new();
    let api = DisarmRefusingApi {
        inner: recorder.clone(),
    };
    let handshake = DeviceHandshake::with_api(&cfg, Box::new(api));
    let mut session = StreamLoop::new(
        cfg,
        ScriptedConnector::new(frames(1)),
        RecordingPublisher::default(),
        ShutdownSignal::new(),
    )
    .with_handshake(Some(handshake));

    let report = session.run().expect("session runs");
    assert_eq!(report.end_reason, EndReason::Eof);
    assert_eq!(report.frames_published, 1);
    assert_eq!(recorder.calls().len(), 3);
    assert_eq!(session.connector().closes, 1);
}

#[test]
fn session_runs_only_once() {
    let mut session = StreamLoop::new(
        config(4, 2, 3),
        ScriptedConnector::new(frames(1)),
        RecordingPublisher::default(),
        ShutdownSignal::new(),
    );
    session.run().expect("first run");
    assert!(matches!(session.run(), Err(SessionError::AlreadyRun)));
    assert_eq!(session.connector().opens, 1);
    assert_eq!(session.connector().closes, 1);
}
