//! Readiness waits over raw descriptors.
//!
//! The broker operates on descriptors it did not create (they arrive from
//! another process via SCM_RIGHTS), so all blocking-read wrappers are built
//! on `poll(2)` rather than on changing the descriptor's own blocking mode.
//! Two primitives live here:
//!
//! - [`wait_readable`]: bounded wait for one descriptor, with a
//!   distinguished timeout outcome.
//! - [`CancelToken`]: a self-pipe token that lets another thread abandon a
//!   wait on a descriptor it does not exclusively own.

use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use anyhow::{Context, Result};

/// Outcome of a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The descriptor is readable (data or EOF: the caller's read decides).
    Ready,
    /// The bound elapsed with no readability. Retryable; never EOF.
    TimedOut,
    /// The cancellation token fired before the descriptor became readable.
    Cancelled,
}

/// Wait until `fd` is readable, up to `timeout` (`None` = wait forever).
///
/// `EINTR` restarts the wait with the remaining budget untouched: the
/// bound is best-effort in the presence of signals, matching `poll(2)`.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout: Option<Duration>) -> io::Result<Readiness> {
    let mut fds = [libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    }];
    poll_loop(&mut fds, timeout).map(|n| match n {
        0 => Readiness::TimedOut,
        _ => Readiness::Ready,
    })
}

/// Wait until `fd` is readable or `token` fires, up to `timeout`.
///
/// Once the token has fired this returns `Cancelled` immediately on every
/// call: the sentinel byte is never drained from the token pipe.
pub fn wait_readable_or_cancel(
    fd: BorrowedFd<'_>,
    token: &CancelToken,
    timeout: Option<Duration>,
) -> io::Result<Readiness> {
    let mut fds = [
        libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: token.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    let n = poll_loop(&mut fds, timeout)?;
    if n == 0 {
        return Ok(Readiness::TimedOut);
    }
    // Cancellation wins over data: the caller asked to abandon the read, so
    // pending bytes on the main descriptor are deliberately left unread.
    if fds[1].revents & (libc::POLLIN | libc::POLLHUP) != 0 {
        return Ok(Readiness::Cancelled);
    }
    Ok(Readiness::Ready)
}

fn poll_loop(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<i32> {
    let millis: i32 = match timeout {
        None => -1,
        Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
    };
    loop {
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, millis) };
        if n >= 0 {
            return Ok(n);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// A one-shot cancellation token backed by a pipe pair.
///
/// `fire()` writes a single sentinel byte into the pipe, waking any
/// [`wait_readable_or_cancel`] blocked on the read end. The write end is
/// closed after the first fire, making repeated calls no-ops. The sentinel
/// is never drained, so the token stays fired for its whole lifetime.
pub struct CancelToken {
    read_end: OwnedFd,
    write_end: std::sync::Mutex<Option<OwnedFd>>,
}

impl CancelToken {
    /// Create a fresh, unfired token.
    pub fn new() -> Result<Self> {
        let mut fds: [libc::c_int; 2] = [0; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if ret != 0 {
            return Err(io::Error::last_os_error()).context("create cancellation pipe");
        }
        let (read_end, write_end) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self {
            read_end,
            write_end: std::sync::Mutex::new(Some(write_end)),
        })
    }

    /// Fire the token. Idempotent; safe to call from any thread.
    pub fn fire(&self) {
        let mut guard = self
            .write_end
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(w) = guard.take() {
            let buf = [1u8];
            // A pipe with an empty buffer always accepts one byte; failure
            // here means the read end is gone, which is equivalent to fired.
            unsafe { libc::write(w.as_raw_fd(), buf.as_ptr() as *const libc::c_void, 1) };
            // `w` drops here: the write end closes, so the token cannot be
            // fired twice and a blocked poll also sees POLLHUP.
        }
    }

    /// True if `fire()` has been called at least once.
    pub fn fired(&self) -> bool {
        self.write_end
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }

    fn read_fd(&self) -> RawFd {
        self.read_end.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsFd;
    use std::time::Instant;

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        let mut fds: [libc::c_int; 2] = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn readable_pipe_reports_ready() {
        let (r, w) = pipe_pair();
        unsafe { libc::write(w.as_raw_fd(), b"x".as_ptr() as *const libc::c_void, 1) };
        let out = wait_readable(r.as_fd(), Some(Duration::from_secs(1))).unwrap();
        assert_eq!(out, Readiness::Ready);
    }

    #[test]
    fn empty_pipe_times_out() {
        let (r, _w) = pipe_pair();
        let start = Instant::now();
        let out = wait_readable(r.as_fd(), Some(Duration::from_millis(50))).unwrap();
        assert_eq!(out, Readiness::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn cancel_wakes_blocked_wait() {
        let (r, _w) = pipe_pair();
        let token = std::sync::Arc::new(CancelToken::new().unwrap());
        let fired = std::sync::Arc::clone(&token);
        let h = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            fired.fire();
        });
        let out = wait_readable_or_cancel(r.as_fd(), &token, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(out, Readiness::Cancelled);
        h.join().unwrap();
    }

    #[test]
    fn cancel_is_idempotent_and_sticky() {
        let (r, _w) = pipe_pair();
        let token = CancelToken::new().unwrap();
        token.fire();
        token.fire();
        assert!(token.fired());
        for _ in 0..3 {
            let out = wait_readable_or_cancel(r.as_fd(), &token, Some(Duration::from_millis(100)))
                .unwrap();
            assert_eq!(out, Readiness::Cancelled);
        }
    }
}
