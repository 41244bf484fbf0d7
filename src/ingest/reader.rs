//! Timeout-bounded frame reads from an unframed byte pipe.
//!
//! The pipeline writes raw pixels with no framing, so frame boundaries are pure
//! byte accounting: every read takes exactly `layout.byte_len()` bytes. A read
//! either yields a whole frame or reports end of stream; nothing is carried over
//! between calls.

use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use crate::frame::{Frame, FrameLayout};

/// Result of one read attempt.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete frame.
    FrameReady(Frame),
    /// Nothing became readable within the timeout.
    TimedOut,
    /// The stream ended before a complete frame arrived.
    Eof,
}

/// Reads fixed-size frames from a pipe it owns exclusively.
pub struct FrameReader<R> {
    inner: R,
    layout: FrameLayout,
}

impl<R: Read + AsRawFd> FrameReader<R> {
    pub fn new(inner: R, layout: FrameLayout) -> Self {
        Self { inner, layout }
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    /// Read one frame within `timeout`.
    ///
    /// Nothing readable by the deadline is `TimedOut`. A frame that starts but
    /// does not complete by the same deadline is dropped and reported as `Eof`,
    /// as is a stream that closes mid-frame.
    pub fn read(&mut self, timeout: Duration) -> io::Result<ReadOutcome> {
        let deadline = Instant::now() + timeout;
        let fd = self.inner.as_raw_fd();
        if !wait_readable(fd, deadline)? {
            return Ok(ReadOutcome::TimedOut);
        }

        let expected = self.layout.byte_len();
        let mut buf = vec![0u8; expected];
        let filled = read_full(&mut self.inner, fd, &mut buf, deadline)?;
        if filled < expected {
            log::debug!(
                "pipeline stream ended after {} of {} frame bytes",
                filled,
                expected
            );
            return Ok(ReadOutcome::Eof);
        }

        let frame = Frame::from_raw(buf, self.layout)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(ReadOutcome::FrameReady(frame))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + AsRawFd> super::FrameSource for FrameReader<R> {
    fn read_frame(&mut self, timeout: Duration) -> io::Result<ReadOutcome> {
        self.read(timeout)
    }
}

/// Read until `buf` is full, the stream ends, or `deadline` passes with the
/// pipe idle. Returns the bytes filled.
fn read_full(
    reader: &mut impl Read,
    fd: RawFd,
    buf: &mut [u8],
    deadline: Instant,
) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        if filled > 0 && !wait_readable(fd, deadline)? {
            log::warn!(
                "pipeline stalled mid-frame ({} of {} bytes), dropping partial frame",
                filled,
                buf.len()
            );
            break;
        }
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// `poll(2)` for readability. Hang-up and error conditions count as readable:
/// the following read reports them without blocking.
fn wait_readable(fd: RawFd, deadline: Instant) -> io::Result<bool> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        // Round up so a sub-millisecond remainder still waits instead of spinning.
        let millis = remaining
            .as_nanos()
            .div_ceil(1_000_000)
            .min(libc::c_int::MAX as u128) as libc::c_int;
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };

        let ready = unsafe { libc::poll(&mut pollfd, 1, millis) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if ready == 0 {
            return Ok(false);
        }
        if pollfd.revents & libc::POLLNVAL != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "pipeline stream descriptor is not open",
            ));
        }
        return Ok(true);
    }
}
