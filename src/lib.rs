//! sshmux - single-hop SSH connection broker.
//!
//! One broker process authenticates to a remote host once and holds the
//! connection open; local callers share it through a per-user Unix domain
//! socket. A caller sends one small request plus three open descriptors
//! (SCM_RIGHTS), and the broker bridges those descriptors to a fresh
//! session or tunnel on the shared connection. The marginal cost of a
//! "new" SSH session drops to one local socket round trip.
//!
//! # Modules
//!
//! - [`broker`] - accept loop, admission gate, request dispatch
//! - [`client`] - caller side: hand over stdio, or open a pipe tunnel
//! - [`link`] - abstraction over the shared remote connection
//! - [`ssh`] - russh-backed link implementation
//! - [`passfd`] - SCM_RIGHTS descriptor transport
//! - [`protocol`] - Request Envelope wire codec
//! - [`expect`] - streaming first-match pattern engine
//! - [`automate`] - expect/send scripts and the broker init hook
//! - [`reader`] - timeout and hangup read wrappers
//! - [`poll`] - readiness waits and the cancellation token

pub mod automate;
pub mod broker;
pub mod client;
pub mod config;
pub mod expect;
pub mod link;
pub mod passfd;
pub mod poll;
pub mod protocol;
pub mod reader;
pub mod socket;
pub mod ssh;

pub use broker::Broker;
pub use client::{Session, Tunnel};
pub use config::Config;
pub use expect::Expecter;
pub use protocol::{Request, Service};
