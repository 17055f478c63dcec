//! russh-backed implementation of the remote link.
//!
//! One [`SshLink`] holds one authenticated `client::Handle` for the whole
//! broker lifetime. Every session or dial opens a fresh channel on that
//! handle and hands it to a small owner task that translates between the
//! channel's message vocabulary and the [`RemoteConduit`] pair.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::HashAlg;
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc;

use crate::config::{AuthConfig, RemoteConfig};
use crate::link::{RemoteConduit, RemoteEvent, RemoteInput, RemoteLink, SessionSpec};

const CHANNEL_QUEUE: usize = 64;

/// One authenticated SSH connection, shared by all broker callers.
pub struct SshLink {
    handle: client::Handle<HostKeyCheck>,
    host_id: String,
}

impl SshLink {
    /// Connect and authenticate according to `cfg`. The returned link owns
    /// the connection until dropped.
    pub async fn connect(cfg: &RemoteConfig) -> Result<Self> {
        let addr = format!("{}:{}", cfg.host, cfg.port);
        info!("[link] connecting to {addr}");

        let socket_addr = addr
            .to_socket_addrs()
            .with_context(|| format!("resolve {addr}"))?
            .next()
            .ok_or_else(|| anyhow!("no address for {addr}"))?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };
        let checker = HostKeyCheck {
            host: cfg.host.clone(),
            pinned_sha256: cfg.host_key.pinned_sha256.clone(),
            accept_unknown: cfg.host_key.accept_unknown,
        };

        let mut handle = tokio::time::timeout(
            Duration::from_secs(cfg.connect_timeout_secs),
            client::connect(Arc::new(ssh_config), socket_addr, checker),
        )
        .await
        .map_err(|_| anyhow!("connection to {addr} timed out"))?
        .with_context(|| format!("connect to {addr}"))?;
        debug!("[link] handshake with {addr} complete");

        let authenticated = match &cfg.auth {
            AuthConfig::Password { password_env } => {
                let password = std::env::var(password_env)
                    .with_context(|| format!("password env var {password_env} not set"))?;
                handle
                    .authenticate_password(&cfg.username, &password)
                    .await
                    .context("password authentication")?
            }
            AuthConfig::Key { key_path, passphrase } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .with_context(|| format!("load key {key_path}"))?;
                handle
                    .authenticate_publickey(
                        &cfg.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), None),
                    )
                    .await
                    .context("publickey authentication")?
            }
        };
        if !authenticated.success() {
            bail!("authentication rejected for {}@{}", cfg.username, cfg.host);
        }
        info!("[link] authenticated as {}@{}", cfg.username, cfg.host);

        Ok(Self { handle, host_id: addr })
    }
}

#[async_trait]
impl RemoteLink for SshLink {
    async fn open_session(&self, spec: &SessionSpec) -> Result<RemoteConduit> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .context("open session channel")?;

        if spec.command.is_empty() {
            let (cols, rows) = spec.term_size;
            channel
                .request_pty(false, "xterm-256color", cols, rows, 0, 0, &[])
                .await
                .context("request pty")?;
            channel.request_shell(false).await.context("request shell")?;
        } else {
            channel
                .exec(true, spec.command.as_str())
                .await
                .with_context(|| format!("exec {:?}", spec.command))?;
        }

        Ok(spawn_channel_task(channel))
    }

    async fn dial(&self, target: &str) -> Result<RemoteConduit> {
        let (host, port) = split_target(target)?;
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .with_context(|| format!("dial {target}"))?;
        Ok(spawn_channel_task(channel))
    }

    fn host_id(&self) -> &str {
        &self.host_id
    }
}

/// Parse `host:port`, allowing colons in the host only for bracketed IPv6.
pub fn split_target(target: &str) -> Result<(&str, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("dial target {target:?} is not host:port"))?;
    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    if host.is_empty() {
        bail!("dial target {target:?} has an empty host");
    }
    let port: u16 = port
        .parse()
        .with_context(|| format!("dial target {target:?} has an invalid port"))?;
    Ok((host, port))
}

/// Own the channel for its lifetime: pump caller input down and channel
/// messages up until either side finishes.
fn spawn_channel_task(channel: Channel<client::Msg>) -> RemoteConduit {
    let (in_tx, mut in_rx) = mpsc::channel::<RemoteInput>(CHANNEL_QUEUE);
    let (ev_tx, ev_rx) = mpsc::channel::<RemoteEvent>(CHANNEL_QUEUE);

    tokio::spawn(async move {
        let mut channel = channel;
        loop {
            tokio::select! {
                input = in_rx.recv() => {
                    match input {
                        Some(RemoteInput::Data(bytes)) => {
                            if let Err(e) = channel.data(&bytes[..]).await {
                                debug!("[link] channel write failed: {e}");
                                break;
                            }
                        }
                        Some(RemoteInput::Eof) => {
                            let _ = channel.eof().await;
                        }
                        Some(RemoteInput::Close) | None => break,
                    }
                }
                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if ev_tx.send(RemoteEvent::Data(data.to_vec())).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                            if ev_tx.send(RemoteEvent::Stderr(data.to_vec())).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExtendedData { .. }) => {}
                        Some(ChannelMsg::Eof) => {
                            // Remote is done writing; the channel stays open
                            // for exit status and our own pending input.
                            let _ = ev_tx.send(RemoteEvent::Eof).await;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            debug!("[link] remote exit status: {exit_status}");
                        }
                        Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                            debug!("[link] remote exit signal: {signal_name:?}");
                        }
                        Some(ChannelMsg::Close) | None => {
                            let _ = ev_tx.send(RemoteEvent::Closed).await;
                            break;
                        }
                        Some(_) => {}
                    }
                }
            }
        }
        let _ = channel.close().await;
    });

    RemoteConduit { tx: in_tx, rx: ev_rx }
}

/// Host key policy: pinned SHA-256 fingerprint, or accept-unknown for
/// explicitly opted-in setups. No pin and no opt-in means refuse.
struct HostKeyCheck {
    host: String,
    pinned_sha256: Option<String>,
    accept_unknown: bool,
}

impl client::Handler for HostKeyCheck {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, server_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_key.fingerprint(HashAlg::Sha256).to_string();
        if let Some(pinned) = &self.pinned_sha256 {
            if &fingerprint == pinned {
                debug!("[link] host key for {} matches pin", self.host);
                return Ok(true);
            }
            bail!(
                "host key mismatch for {}: expected {pinned}, got {fingerprint}",
                self.host
            );
        }
        if self.accept_unknown {
            warn!("[link] accepting unverified host key for {}: {fingerprint}", self.host);
            return Ok(true);
        }
        bail!(
            "no pinned host key for {} (server offered {fingerprint}); \
             set remote.host_key.pinned_sha256 or accept_unknown",
            self.host
        );
    }
}
