//! Caller side of the broker protocol.
//!
//! `connect` hands the process's own stdio to the broker and waits for the
//! broker to finish with it; `forward` builds a pipe-backed tunnel and
//! returns a stream handle. Both send exactly one Request Envelope with
//! exactly three descriptors and never write anything else on the socket.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::terminal;
use crossterm::tty::IsTty;
use log::debug;

use crate::passfd::send_fds;
use crate::poll::{wait_readable, Readiness};
use crate::protocol::Request;

/// An in-flight Connect request. The broker is driving this process's
/// stdio; the caller holds this and [`Session::wait`]s for the close.
pub struct Session {
    stream: UnixStream,
    _raw: Option<RawModeGuard>,
}

/// Connect using this process's stdin/stdout/stderr.
///
/// For an interactive shell on a tty, the local terminal is switched to
/// raw mode so keystrokes reach the remote PTY unmangled; it is restored
/// when the session ends, on every path.
pub fn connect(socket_path: &Path, command: &str, init: bool) -> Result<Session> {
    let stream = UnixStream::connect(socket_path)
        .with_context(|| format!("connect to broker at {}", socket_path.display()))?;

    let request = Request::connect(command, init);
    let stdin = io::stdin();
    send_fds(
        &stream,
        &request.encode()?,
        &[stdin.as_fd(), io::stdout().as_fd(), io::stderr().as_fd()],
    )
    .context("hand stdio to broker")?;

    let raw = if command.is_empty() && stdin.is_tty() {
        terminal::enable_raw_mode().context("enter raw mode")?;
        Some(RawModeGuard)
    } else {
        None
    };

    Ok(Session { stream, _raw: raw })
}

impl Session {
    /// Block until the broker closes the connection, then restore the
    /// terminal. The broker never writes on the socket, so any bytes seen
    /// here are ignored.
    pub fn wait(mut self) -> Result<()> {
        let mut buf = [0u8; 64];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => debug!("[client] ignoring unexpected bytes from broker"),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("wait for broker"),
            }
        }
        Ok(())
    }
}

struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// A tunnel to `host:port` dialed through the broker's shared connection.
///
/// Reads and writes go over local pipes; the broker bridges them to the
/// remote end. Dropping the handle tears the tunnel down.
pub struct Tunnel {
    target: String,
    local: String,
    to_remote: Option<File>,
    from_remote: File,
    read_timeout: Option<Duration>,
    // Held open so the broker-side connection outlives the pipes.
    _stream: UnixStream,
}

/// How opening a tunnel failed; the split matters to CLI exit codes.
#[derive(Debug)]
pub enum ForwardError {
    /// Local pipe plumbing could not be set up.
    Setup(anyhow::Error),
    /// The broker could not be reached or refused the handoff.
    Connect(anyhow::Error),
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::Setup(e) | ForwardError::Connect(e) => write!(f, "{e:#}"),
        }
    }
}

impl std::error::Error for ForwardError {}

/// Open a tunnel to `target` (`host:port`).
pub fn forward(socket_path: &Path, target: &str) -> Result<Tunnel, ForwardError> {
    let stream = UnixStream::connect(socket_path)
        .with_context(|| format!("connect to broker at {}", socket_path.display()))
        .map_err(ForwardError::Connect)?;

    // Outbound pair: we write, the broker reads. Inbound pair: the broker
    // writes, we read. The third slot is unused for Forward; a /dev/null
    // handle keeps the arity fixed.
    let (out_read, out_write) = pipe_pair().context("outbound pipe").map_err(ForwardError::Setup)?;
    let (in_read, in_write) = pipe_pair().context("inbound pipe").map_err(ForwardError::Setup)?;
    let null = File::open("/dev/null").context("open /dev/null").map_err(ForwardError::Setup)?;

    let request = Request::forward(target);
    send_fds(
        &stream,
        &request.encode().map_err(ForwardError::Setup)?,
        &[out_read.as_fd(), in_write.as_fd(), null.as_fd()],
    )
    .context("hand tunnel pipes to broker")
    .map_err(ForwardError::Connect)?;
    // The broker holds kernel duplicates now; our copies of its ends close
    // here so EOF can propagate.
    drop(out_read);
    drop(in_write);

    Ok(Tunnel {
        target: target.to_owned(),
        local: socket_path.display().to_string(),
        to_remote: Some(File::from(out_write)),
        from_remote: File::from(in_read),
        read_timeout: None,
        _stream: stream,
    })
}

impl Tunnel {
    /// The `host:port` this tunnel was dialed to.
    pub fn peer(&self) -> &str {
        &self.target
    }

    /// The broker socket this tunnel runs through.
    pub fn local(&self) -> &str {
        &self.local
    }

    /// Bound subsequent reads; `None` blocks indefinitely.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// Finish the outbound direction. The remote sees end-of-input; reads
    /// of remote output continue to work.
    pub fn close_write(&mut self) {
        self.to_remote.take();
    }

    /// Split into independently owned halves so the two directions can run
    /// on separate threads. Either half keeps the broker connection alive.
    pub fn into_split(self) -> (TunnelReader, TunnelWriter) {
        let stream = std::sync::Arc::new(self._stream);
        (
            TunnelReader { from_remote: self.from_remote, _stream: std::sync::Arc::clone(&stream) },
            TunnelWriter { to_remote: self.to_remote, _stream: stream },
        )
    }
}

/// Remote-to-local half of a split [`Tunnel`].
pub struct TunnelReader {
    from_remote: File,
    _stream: std::sync::Arc<UnixStream>,
}

impl Read for TunnelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.from_remote.read(buf)
    }
}

/// Local-to-remote half of a split [`Tunnel`]. Dropping it signals
/// end-of-input to the remote.
pub struct TunnelWriter {
    to_remote: Option<File>,
    _stream: std::sync::Arc<UnixStream>,
}

impl Write for TunnelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.to_remote {
            Some(f) => f.write(buf),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "tunnel write side closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.to_remote {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl Read for Tunnel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Readiness::TimedOut = wait_readable(self.from_remote.as_fd(), self.read_timeout)? {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no tunnel data within bound"));
        }
        self.from_remote.read(buf)
    }
}

impl Write for Tunnel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.to_remote {
            Some(f) => f.write(buf),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "tunnel write side closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.to_remote {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

pub(crate) fn pipe_pair() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error()).context("pipe");
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passfd::recv_fds;
    use crate::protocol::Service;

    /// A Forward handshake delivers the envelope plus three descriptors,
    /// wired so the broker's ends see our tunnel I/O.
    #[test]
    fn forward_handshake_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("t.sock");
        let listener = std::os::unix::net::UnixListener::bind(&sock).unwrap();

        let accept = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            recv_fds(&stream).unwrap()
        });

        let mut tunnel = forward(&sock, "db:5432").unwrap();
        let (payload, fds) = accept.join().unwrap();

        let req = Request::decode(&payload).unwrap();
        assert_eq!(req.service, Service::Forward);
        assert_eq!(req.dial_target, "db:5432");
        assert_eq!(fds.len(), 3);

        let mut fds = fds.into_iter();
        let broker_source = fds.next().unwrap();
        let broker_sink = fds.next().unwrap();
        drop(fds.next().unwrap()); // unused slot

        // Our writes surface on the broker's source end.
        tunnel.write_all(b"ping").unwrap();
        let mut src = File::from(broker_source);
        let mut buf = [0u8; 4];
        src.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        // The broker's sink end feeds our reads.
        let mut sink = File::from(broker_sink);
        sink.write_all(b"pong").unwrap();
        tunnel.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");

        // close_write propagates EOF to the broker's source.
        tunnel.close_write();
        assert_eq!(src.read(&mut buf).unwrap(), 0);
        assert!(tunnel.write(b"x").is_err());
    }

    #[test]
    fn tunnel_read_timeout_is_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("t.sock");
        let listener = std::os::unix::net::UnixListener::bind(&sock).unwrap();
        let accept = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            recv_fds(&stream).unwrap()
        });

        let mut tunnel = forward(&sock, "h:1").unwrap();
        let _held = accept.join().unwrap(); // keep broker ends open

        tunnel.set_read_timeout(Some(Duration::from_millis(40)));
        let err = tunnel.read(&mut [0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
