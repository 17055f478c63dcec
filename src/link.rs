//! The seam between the broker and the SSH client library.
//!
//! The broker multiplexes many logical streams onto one authenticated
//! remote connection but never touches the SSH wire protocol itself. This
//! module defines that boundary: a [`RemoteLink`] opens sessions and
//! proxied TCP dials, each materializing as a [`RemoteConduit`]: a pair of
//! message channels owned by a per-channel task on the implementation's
//! side. The channel-pair shape keeps the dispatcher free of any SSH
//! library types and makes the dispatcher testable against a fake link.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Parameters for an interactive or exec session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    /// Remote command; empty requests a PTY and an interactive shell.
    pub command: String,
    /// Terminal size for the PTY case (cols, rows).
    pub term_size: (u32, u32),
}

/// Bytes and control flowing toward the remote side.
#[derive(Debug)]
pub enum RemoteInput {
    /// Payload for the remote stdin / tunnel.
    Data(Vec<u8>),
    /// Local source is done writing; remote may still send.
    Eof,
    /// Tear the channel down.
    Close,
}

/// Events flowing back from the remote side.
#[derive(Debug)]
pub enum RemoteEvent {
    /// Remote stdout / tunnel payload.
    Data(Vec<u8>),
    /// Remote stderr payload (sessions only).
    Stderr(Vec<u8>),
    /// Remote finished writing (half-close).
    Eof,
    /// Channel fully closed.
    Closed,
}

/// One logical remote stream: a sender for input and a receiver for
/// events. Dropping both halves releases the underlying channel.
pub struct RemoteConduit {
    /// Toward the remote.
    pub tx: mpsc::Sender<RemoteInput>,
    /// From the remote.
    pub rx: mpsc::Receiver<RemoteEvent>,
}

/// One authenticated connection to one remote host, safe for concurrent
/// session/dial calls (the concurrency contract is delegated to the
/// implementation: for SSH, to the client library).
#[async_trait]
pub trait RemoteLink: Send + Sync {
    /// Open an interactive or exec session.
    async fn open_session(&self, spec: &SessionSpec) -> Result<RemoteConduit>;

    /// Dial `host:port` through the remote side (proxied TCP).
    async fn dial(&self, target: &str) -> Result<RemoteConduit>;

    /// Identifier of the remote host, for logs and the init hook.
    fn host_id(&self) -> &str;
}
