//! TCP and UDP proxy managers and the sessions they run.
//!
//! ## Architecture
//!
//! ```text
//! Client -> Manager (accept loop) -> Session -> Upstream
//!                |                      |
//!          Dispatcher runtime     BufferPool / UrlFixers / event logs / clients
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{ProxyKind, ProxyManagerFactory, SessionContext};
//!
//! let factory = ProxyManagerFactory::new(SessionContext::new(connections, errors));
//! let dispatcher = dispatchers.ensure_active_dispatcher()?;
//! let manager = factory.create(ProxyKind::Tcp, "0.0.0.0:8228".parse()?, dispatcher);
//! manager.run().await?;
//! ```

mod datagram;
mod factory;
mod manager;
mod request;
mod session;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use datagram::{decode_datagram, encode_datagram, Datagram, DatagramError};
pub use factory::ProxyManagerFactory;
pub use manager::{
    ManagerState, ProxyManager, TcpProxyManager, UdpProxyManager, MAX_ACCEPT_FAILURES,
};
pub use request::{parse_destination, parse_request_line, RequestError, RequestHead};
pub use session::{SessionContext, DEFAULT_CONNECT_TIMEOUT, DEFAULT_UDP_REPLY_TIMEOUT};

/// Transport handled by a proxy manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    Tcp,
    Udp,
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyKind::Tcp => write!(f, "TCP"),
            ProxyKind::Udp => write!(f, "UDP"),
        }
    }
}
