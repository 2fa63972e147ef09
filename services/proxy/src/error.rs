//! Error types for the proxy core.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::proxy::{DatagramError, ProxyKind, RequestError};

/// Errors that stop a proxy manager or prevent the proxy from starting.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The listening socket could not be opened.
    #[error("failed to bind {kind} proxy on {addr}: {source}")]
    Bind {
        kind: ProxyKind,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Accepting connections kept failing.
    #[error("{kind} proxy gave up after {failures} consecutive accept failures: {source}")]
    Accept {
        kind: ProxyKind,
        failures: u32,
        #[source]
        source: io::Error,
    },

    /// The worker pool could not be created.
    #[error("failed to start proxy dispatcher: {0}")]
    Dispatcher(#[source] io::Error),

    /// A manager can only run once.
    #[error("{0} proxy manager was already started")]
    AlreadyStarted(ProxyKind),

    /// The permission guard refused to start.
    #[error("missing required permissions")]
    PermissionDenied,

    /// A VPN on the device would swallow proxied traffic.
    #[error("a VPN is active")]
    VpnActive,

    /// The broadcast network has no address to bind to.
    #[error("no broadcast network address")]
    NoAddress,
}

/// Errors that end a single proxy session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The request head could not be parsed.
    #[error("bad request: {0}")]
    Request(#[from] RequestError),

    /// The UDP datagram framing is invalid.
    #[error("bad datagram: {0}")]
    Datagram(#[from] DatagramError),

    /// The destination could not be resolved.
    #[error("could not resolve {authority}")]
    Resolve { authority: String },

    /// Connecting upstream did not finish in time.
    #[error("connect to {authority} timed out")]
    ConnectTimeout { authority: String },

    /// Connecting upstream failed.
    #[error("failed to connect to {authority}: {source}")]
    Connect {
        authority: String,
        #[source]
        source: io::Error,
    },

    /// No reply arrived for a forwarded datagram.
    #[error("no reply from {authority} within timeout")]
    ReplyTimeout { authority: String },

    /// Neither side sent anything for the configured idle timeout.
    #[error("connection idle for {timeout:?}")]
    IdleTimeout { timeout: Duration },

    /// Reading or writing a socket failed mid-exchange.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
