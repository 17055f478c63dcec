//! sshmux binary: broker daemon plus the connect/forward client tools.
//!
//! Exit codes follow the convention the client tools are built around:
//! `0` success, `1` connection or dial failure, `2` local resource setup
//! failure, `126` invalid usage or configuration, `127` a named file
//! (config, script) that does not exist.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use mimalloc::MiMalloc;

use sshmux::automate::{self, Script};
use sshmux::broker::{Broker, InitHook};
use sshmux::client::{self, ForwardError};
use sshmux::config::Config;
use sshmux::socket;
use sshmux::ssh::{split_target, SshLink};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const EXIT_RUNTIME: u8 = 1;
const EXIT_SETUP: u8 = 2;
const EXIT_USAGE: u8 = 126;
const EXIT_NOT_FOUND: u8 = 127;

#[derive(Parser)]
#[command(name = "sshmux", version, about = "Single-hop SSH connection broker")]
struct Cli {
    /// Logical endpoint name; selects the broker socket.
    #[arg(long, global = true)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the broker daemon: connect to the remote once, serve callers.
    Broker {
        /// Config file (default: ~/.config/sshmux/config.json).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run a remote command, or an interactive shell, over the broker.
    Connect {
        /// Mark this as the gated initialization connection.
        #[arg(long)]
        init: bool,
        /// Remote command; omit for an interactive shell.
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Bridge stdin/stdout to a TCP endpoint dialed through the broker.
    Forward {
        /// Destination as host:port.
        target: String,
    },
}

struct Failure {
    code: u8,
    err: anyhow::Error,
}

impl Failure {
    fn new(code: u8, err: anyhow::Error) -> Self {
        Self { code, err }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Broker { ref config } => cmd_broker(&cli, config.as_deref()),
        Command::Connect { init, ref command } => cmd_connect(&cli, init, command),
        Command::Forward { ref target } => cmd_forward(&cli, target),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(f) => {
            error!("{:#}", f.err);
            ExitCode::from(f.code)
        }
    }
}

fn resolve_socket(cli: &Cli, config_endpoint: Option<&str>) -> Result<PathBuf, Failure> {
    let endpoint = cli
        .endpoint
        .as_deref()
        .or(config_endpoint)
        .unwrap_or("default");
    socket::socket_path(endpoint).map_err(|e| Failure::new(EXIT_USAGE, e))
}

fn cmd_broker(cli: &Cli, config_path: Option<&std::path::Path>) -> Result<(), Failure> {
    if let Some(p) = config_path {
        if !p.exists() {
            return Err(Failure::new(
                EXIT_NOT_FOUND,
                anyhow!("config file not found: {}", p.display()),
            ));
        }
    }
    let cfg = Config::load(config_path).map_err(|e| Failure::new(EXIT_USAGE, e))?;
    let path = resolve_socket(cli, Some(cfg.endpoint.as_str()))?;

    let init_hook = build_init_hook(&cfg, &path)?;

    socket::prepare(&path).map_err(|e| Failure::new(EXIT_SETUP, e))?;
    // Remove the socket on every exit path; the signal handler covers the
    // paths this scope never reaches.
    let socket_file = path.clone();
    scopeguard::defer! {
        let _ = std::fs::remove_file(&socket_file);
    }
    let cleanup_path = path.clone();
    ctrlc::set_handler(move || {
        let _ = std::fs::remove_file(&cleanup_path);
        info!("[broker] interrupted, socket removed");
        std::process::exit(0);
    })
    .map_err(|e| Failure::new(EXIT_SETUP, anyhow!(e).context("install signal handler")))?;

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| Failure::new(EXIT_SETUP, anyhow!(e).context("start runtime")))?;

    runtime.block_on(async {
        let link = SshLink::connect(&cfg.remote)
            .await
            .map_err(|e| Failure::new(EXIT_RUNTIME, e))?;
        let listener = tokio::net::UnixListener::bind(&path)
            .with_context(|| format!("bind {}", path.display()))
            .map_err(|e| Failure::new(EXIT_SETUP, e))?;
        socket::restrict(&path);
        info!("[broker] listening on {}", path.display());

        let broker = Broker::new(Arc::new(link), cfg.gated);
        broker
            .serve(listener, init_hook)
            .await
            .map_err(|e| Failure::new(EXIT_RUNTIME, e))
    })
}

fn build_init_hook(cfg: &Config, socket_path: &std::path::Path) -> Result<Option<InitHook>, Failure> {
    if !cfg.gated {
        return Ok(None);
    }
    let script_path = cfg.init_script.as_ref().ok_or_else(|| {
        Failure::new(EXIT_USAGE, anyhow!("gated broker needs init_script in the config"))
    })?;
    if !script_path.exists() {
        return Err(Failure::new(
            EXIT_NOT_FOUND,
            anyhow!("init script not found: {}", script_path.display()),
        ));
    }
    let script = Script::load(script_path).map_err(|e| Failure::new(EXIT_USAGE, e))?;
    Ok(Some(automate::init_hook(
        socket_path.to_path_buf(),
        script,
        Duration::from_secs(cfg.expect_timeout_secs),
    )))
}

fn cmd_connect(cli: &Cli, init: bool, command: &[String]) -> Result<(), Failure> {
    let path = resolve_socket(cli, None)?;
    let command = command.join(" ");
    let session = client::connect(&path, &command, init)
        .map_err(|e| Failure::new(EXIT_RUNTIME, e))?;
    session.wait().map_err(|e| Failure::new(EXIT_RUNTIME, e))
}

fn cmd_forward(cli: &Cli, target: &str) -> Result<(), Failure> {
    split_target(target).map_err(|e| Failure::new(EXIT_USAGE, e))?;
    let path = resolve_socket(cli, None)?;
    let tunnel = client::forward(&path, target).map_err(|e| match e {
        ForwardError::Setup(err) => Failure::new(EXIT_SETUP, err),
        ForwardError::Connect(err) => Failure::new(EXIT_RUNTIME, err),
    })?;

    let (mut from_remote, mut to_remote) = tunnel.into_split();

    // stdin -> tunnel on a helper thread; dropping the writer at stdin EOF
    // half-closes the tunnel. The thread is abandoned at process exit if
    // the remote hangs up first while stdin is still open.
    std::thread::spawn(move || {
        let mut stdin = io::stdin().lock();
        let _ = io::copy(&mut stdin, &mut to_remote);
    });

    let mut stdout = io::stdout().lock();
    copy_until_eof(&mut from_remote, &mut stdout)
        .map_err(|e| Failure::new(EXIT_RUNTIME, anyhow!(e).context("tunnel closed abnormally")))
}

fn copy_until_eof<R: Read, W: Write>(src: &mut R, dst: &mut W) -> io::Result<()> {
    let mut buf = [0u8; 8 * 1024];
    loop {
        match src.read(&mut buf) {
            Ok(0) => return dst.flush(),
            Ok(n) => dst.write_all(&buf[..n])?,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
