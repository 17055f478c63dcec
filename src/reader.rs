//! Blocking-read wrappers over raw descriptors.
//!
//! Two wrappers with one rule between them: a readiness timeout and an
//! end-of-stream are different outcomes and must never be conflated.
//!
//! - [`TimeoutReader`] bounds each read with a readiness wait and reports
//!   the expired bound as `io::ErrorKind::TimedOut`: "no data yet", not
//!   stream end. Callers retry.
//! - [`HangupReader`] lets a *different* thread force a blocked read to
//!   report end-of-stream without closing the wrapped descriptor. The
//!   descriptor arrived from another process and is jointly owned; closing
//!   it out from under the peer is not ours to do.

use std::io::{self, Read};
use std::os::unix::io::{AsFd, AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

use crate::poll::{wait_readable, wait_readable_or_cancel, CancelToken, Readiness};

fn read_fd(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe {
            libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// A reader whose `read` waits at most a configured duration for data.
///
/// Owns the descriptor for its lifetime; drop closes it.
pub struct TimeoutReader {
    fd: OwnedFd,
    timeout: Option<Duration>,
}

impl TimeoutReader {
    /// Wrap `fd` with a per-read readiness bound.
    pub fn new(fd: OwnedFd, timeout: Duration) -> Self {
        Self { fd, timeout: Some(timeout) }
    }

    /// Wrap `fd` with no bound (plain blocking reads).
    pub fn unbounded(fd: OwnedFd) -> Self {
        Self { fd, timeout: None }
    }

    /// Change the bound for subsequent reads. Not retroactive: a read
    /// already blocked keeps the bound it started with.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }
}

impl Read for TimeoutReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match wait_readable(self.fd.as_fd(), self.timeout)? {
            Readiness::TimedOut => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "no data within readiness bound",
            )),
            _ => read_fd(&self.fd, buf),
        }
    }
}

/// Handle for waking a [`HangupReader`] blocked in `read`.
///
/// Clone-cheap (`Arc` inside); callable from any thread; idempotent.
#[derive(Clone)]
pub struct Hangup {
    token: Arc<CancelToken>,
}

impl Hangup {
    /// Force the paired reader to report end-of-stream from now on.
    pub fn hangup(&self) {
        self.token.fire();
    }
}

/// A reader that can be forced to report end-of-stream on demand.
///
/// `read` waits on readiness of either the wrapped descriptor or an
/// internal signaling pipe. Once the pipe fires: via [`Hangup::hangup`]
/// every current and future `read` returns `Ok(0)` without touching the
/// wrapped descriptor again. Drop closes both the descriptor and the pipe.
pub struct HangupReader {
    fd: OwnedFd,
    token: Arc<CancelToken>,
    hung_up: bool,
}

impl HangupReader {
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        let token = CancelToken::new()
            .map_err(|e| io::Error::other(format!("signaling pipe: {e}")))?;
        Ok(Self {
            fd,
            token: Arc::new(token),
            hung_up: false,
        })
    }

    /// A handle other tasks can use to wake and terminate blocked reads.
    pub fn hangup_handle(&self) -> Hangup {
        Hangup { token: Arc::clone(&self.token) }
    }
}

impl Read for HangupReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.hung_up {
            return Ok(0);
        }
        match wait_readable_or_cancel(self.fd.as_fd(), &self.token, None)? {
            Readiness::Cancelled => {
                self.hung_up = true;
                Ok(0)
            }
            _ => read_fd(&self.fd, buf),
        }
    }
}
