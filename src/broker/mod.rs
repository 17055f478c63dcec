//! Connection broker: accept loop, request dispatch, and the per-request
//! pump between local descriptors and remote channels.
//!
//! One broker process owns one authenticated remote link. Local callers
//! connect over a Unix socket and hand across a Request Envelope plus
//! exactly three descriptors; the broker serves each request on the shared
//! link and touches nothing but the descriptors it was given.
//!
//! While the gate is closed (an init script has not finished), every
//! non-init request is dropped without a reply: connection and received
//! descriptors are closed, nothing is written back. Callers observe a
//! clean close, not an error they could mistake for remote state.

use std::fs::File;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use tokio::net::UnixListener;

use crate::link::{RemoteConduit, RemoteEvent, RemoteInput, RemoteLink, SessionSpec};
use crate::passfd::{recv_fds, DescriptorSet};
use crate::protocol::{Request, Service};
use crate::reader::HangupReader;


/// Fallback terminal size when the caller's stdin is not a tty.
const DEFAULT_TERM: (u32, u32) = (80, 24);

const READ_CHUNK: usize = 8 * 1024;

/// Runs once before the gate opens, with the remote host identifier.
/// Failure is fatal to the broker.
pub type InitHook = Box<dyn FnOnce(&str) -> Result<()> + Send + 'static>;

/// Admission gate: closed until initialization completes.
struct Gate {
    closed: AtomicBool,
}

impl Gate {
    fn new(closed: bool) -> Self {
        Self { closed: AtomicBool::new(closed) }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn open(&self) {
        if self.closed.swap(false, Ordering::AcqRel) {
            info!("[broker] gate open, serving all callers");
        }
    }
}

pub struct Broker {
    link: Arc<dyn RemoteLink>,
    gate: Gate,
    conn_seq: AtomicU64,
}

impl Broker {
    /// A broker over an established link. `gated` holds non-init callers
    /// until [`Broker::serve`]'s init hook has completed.
    pub fn new(link: Arc<dyn RemoteLink>, gated: bool) -> Arc<Self> {
        Arc::new(Self {
            link,
            gate: Gate::new(gated),
            conn_seq: AtomicU64::new(0),
        })
    }

    /// Accept and dispatch until the process dies.
    ///
    /// With a closed gate, `init_hook` runs (on the blocking pool) as soon
    /// as the accept loop is up; its connection is the one request admitted
    /// through the closed gate. Hook failure aborts the broker: a caller
    /// admitted later must never see a half-initialized remote.
    pub async fn serve(
        self: Arc<Self>,
        listener: UnixListener,
        init_hook: Option<InitHook>,
    ) -> Result<()> {
        let accept = tokio::spawn(Arc::clone(&self).accept_loop(listener));

        match (self.gate.is_closed(), init_hook) {
            (true, Some(hook)) => {
                info!("[broker] gate closed, running initialization");
                let host = self.link.host_id().to_owned();
                let outcome = tokio::task::spawn_blocking(move || hook(&host))
                    .await
                    .context("initialization hook panicked")?;
                if let Err(e) = outcome {
                    accept.abort();
                    return Err(e.context("initialization failed, shutting down"));
                }
                self.gate.open();
            }
            (true, None) => {
                accept.abort();
                bail!("gated broker needs an init script");
            }
            (false, Some(_)) => {
                debug!("[broker] init hook ignored: gate already open");
            }
            (false, None) => {}
        }

        accept.await.context("accept loop ended")?
    }

    async fn accept_loop(self: Arc<Self>, listener: UnixListener) -> Result<()> {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!("[broker] accept failed: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
            };
            let conn_id = self.conn_seq.fetch_add(1, Ordering::Relaxed) + 1;
            let broker = Arc::clone(&self);
            tokio::spawn(async move {
                debug!("[broker] conn {conn_id}: accepted");
                if let Err(e) = broker.handle_connection(stream, conn_id).await {
                    warn!("[broker] conn {conn_id}: {e:#}");
                }
                debug!("[broker] conn {conn_id}: finished");
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: tokio::net::UnixStream,
        conn_id: u64,
    ) -> Result<()> {
        // Descriptor receipt and the pumps do blocking I/O; take the
        // socket off the reactor and keep it open until dispatch is done
        // so the caller can wait for our close.
        let stream = stream.into_std().context("detach stream")?;
        stream.set_nonblocking(false)?;
        let stream = Arc::new(stream);

        let recv_stream = Arc::clone(&stream);
        let (payload, fds) = tokio::task::spawn_blocking(move || recv_fds(&recv_stream))
            .await
            .context("receive task panicked")??;
        if payload.is_empty() && fds.is_empty() {
            debug!("[broker] conn {conn_id}: closed before sending a request");
            return Ok(());
        }

        let request = Request::decode(&payload).context("decode request envelope")?;
        let set = DescriptorSet::from_received(fds)?;

        if self.gate.is_closed() && !request.init {
            // Silent drop: descriptors and connection close, no reply.
            warn!("[broker] conn {conn_id}: dropped, initialization pending");
            return Ok(());
        }

        match request.service {
            Service::None => bail!("request carries no service"),
            Service::Connect => self.serve_connect(request, set, conn_id).await,
            Service::Forward => self.serve_forward(request, set, conn_id).await,
        }
    }

    async fn serve_connect(&self, request: Request, set: DescriptorSet, conn_id: u64) -> Result<()> {
        let (stdin, stdout, stderr) = set.into_parts();
        let term_size = if request.command.is_empty() {
            term_size(&stdin).unwrap_or(DEFAULT_TERM)
        } else {
            DEFAULT_TERM
        };

        info!(
            "[broker] conn {conn_id}: connect {} on {}",
            if request.command.is_empty() { "shell" } else { request.command.as_str() },
            self.link.host_id(),
        );
        let spec = SessionSpec { command: request.command, term_size };
        let conduit = self.link.open_session(&spec).await.context("open session")?;
        pump(conduit, stdin, stdout, Some(stderr), conn_id).await
    }

    async fn serve_forward(&self, request: Request, set: DescriptorSet, conn_id: u64) -> Result<()> {
        if request.dial_target.is_empty() {
            bail!("forward request without a dial target");
        }
        let (source, sink, unused) = set.into_parts();
        drop(unused); // third slot is reserved; close it right away

        info!(
            "[broker] conn {conn_id}: forward to {} via {}",
            request.dial_target,
            self.link.host_id(),
        );
        let conduit = self
            .link
            .dial(&request.dial_target)
            .await
            .with_context(|| format!("dial {}", request.dial_target))?;
        pump(conduit, source, sink, None, conn_id).await
    }
}

/// Bridge one remote conduit onto local descriptors. The two directions
/// run as independent tasks. Remote completion tears the connection down
/// at once, hanging up the other direction's blocked read; local
/// end-of-input becomes a remote EOF and the remote direction drains to
/// completion first. A remote EOF closes the local sinks before the
/// channel-close arrives, so every delivered byte reaches the caller.
async fn pump(
    conduit: RemoteConduit,
    local_in: OwnedFd,
    local_out: OwnedFd,
    local_err: Option<OwnedFd>,
    conn_id: u64,
) -> Result<()> {
    let RemoteConduit { tx, mut rx } = conduit;

    let mut reader = HangupReader::new(local_in).context("wrap local source")?;
    let hangup = reader.hangup_handle();

    let outbound_tx = tx.clone();
    let outbound = async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let (r, b, res) = tokio::task::spawn_blocking(move || {
                let mut reader = reader;
                let mut buf = buf;
                let res = std::io::Read::read(&mut reader, &mut buf);
                (reader, buf, res)
            })
            .await
            .context("local read task panicked")?;
            reader = r;
            buf = b;
            match res {
                Ok(0) => break,
                Ok(n) => {
                    if outbound_tx.send(RemoteInput::Data(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("[broker] conn {conn_id}: local read ended: {e}");
                    break;
                }
            }
        }
        let _ = outbound_tx.send(RemoteInput::Eof).await;
        anyhow::Ok(())
    };

    let inbound = async move {
        let mut out = Some(File::from(local_out));
        let mut err_out = local_err.map(File::from);
        while let Some(event) = rx.recv().await {
            match event {
                RemoteEvent::Data(data) => {
                    if let Some(f) = out.take() {
                        match write_blocking(f, data).await {
                            Ok(f) => out = Some(f),
                            Err(e) => debug!("[broker] conn {conn_id}: local sink gone: {e}"),
                        }
                    }
                }
                RemoteEvent::Stderr(data) => {
                    if let Some(f) = err_out.take() {
                        match write_blocking(f, data).await {
                            Ok(f) => err_out = Some(f),
                            Err(e) => debug!("[broker] conn {conn_id}: stderr sink gone: {e}"),
                        }
                    }
                }
                RemoteEvent::Eof => {
                    // Remote is done writing: close the local sinks so the
                    // caller sees end-of-stream, keep draining control
                    // messages until the channel closes.
                    out.take();
                    err_out.take();
                }
                RemoteEvent::Closed => break,
            }
        }
        anyhow::Ok(())
    };

    tokio::pin!(inbound);
    tokio::select! {
        res = &mut inbound => res?,
        res = outbound => {
            res?;
            // Local input is exhausted; the remote may still be flushing
            // output. Drain it so a short-lived exec loses no bytes.
            inbound.await?;
        }
    }

    hangup.hangup();
    let _ = tx.send(RemoteInput::Close).await;
    Ok(())
}

async fn write_blocking(mut f: File, data: Vec<u8>) -> Result<File> {
    tokio::task::spawn_blocking(move || -> Result<File> {
        std::io::Write::write_all(&mut f, &data)?;
        Ok(f)
    })
    .await
    .context("local write task panicked")?
}

/// Terminal size of the caller's stdin, when it is a tty.
fn term_size(fd: &OwnedFd) -> Option<(u32, u32)> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ, &mut ws) };
    if rc == 0 && ws.ws_col > 0 && ws.ws_row > 0 {
        Some((u32::from(ws.ws_col), u32::from(ws.ws_row)))
    } else {
        None
    }
}
