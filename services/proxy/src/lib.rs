//! Core of a local tethering proxy.
//!
//! Accepts HTTP proxy connections over TCP and framed datagrams over UDP
//! from devices on a shared network, relays them upstream, and exposes the
//! proxy's running status, per-session events and per-client totals to
//! observers.

pub mod clients;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod mempool;
pub mod proxy;
pub mod shared;
pub mod status;
pub mod urlfixer;

pub use clients::{ClientRegistry, STALE_CLIENT_AGE};
pub use dispatcher::{ProxyDispatcher, ServerDispatcher};
pub use error::{ProxyError, SessionError};
pub use logging::{ConnectionLog, ErrorLog, LogStorage, LogSubscription};
pub use mempool::{BufferPool, BufferPoolStats, PooledBuffer, BUFFER_SIZE};
pub use proxy::{
    ManagerState, ProxyKind, ProxyManager, ProxyManagerFactory, SessionContext, TcpProxyManager,
    UdpProxyManager,
};
pub use shared::{
    AddressProvider, Collaborators, PermissionGuard, ProxyOptions, SharedProxy,
    StaticAddressProvider, StaticPermissionGuard, StaticVpnChecker, VpnChecker,
};
pub use status::StatusBroadcaster;
pub use urlfixer::{PsnUrlFixer, UrlFixer, UrlFixers};
