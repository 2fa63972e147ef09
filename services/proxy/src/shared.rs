//! The tethering proxy as a whole: both managers, the status cell, the
//! event logs and the client registry, started and stopped together.
//!
//! Platform concerns (permissions, VPN detection, the group network address)
//! are reached through small collaborator traits so the core can run on any
//! host. The binary wires static implementations.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tetherfi_events::{ConnectionEvent, ErrorEvent, RunningStatus};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clients::ClientRegistry;
use crate::dispatcher::{default_parallelism, ProxyDispatcher};
use crate::error::ProxyError;
use crate::logging::{ConnectionLog, ErrorLog};
use crate::proxy::{
    ProxyKind, ProxyManager, ProxyManagerFactory, SessionContext, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_UDP_REPLY_TIMEOUT,
};
use crate::status::StatusBroadcaster;

/// Default port for both the TCP and UDP proxies.
pub const DEFAULT_PROXY_PORT: u16 = 8228;

/// Default inactivity limit for TCP sessions.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Collaborators
// =============================================================================

/// Supplies the address of the network clients join.
#[async_trait]
pub trait AddressProvider: Send + Sync {
    async fn current_address(&self) -> Option<IpAddr>;
}

/// Decides whether the host allows the proxy to run.
#[async_trait]
pub trait PermissionGuard: Send + Sync {
    async fn is_allowed(&self) -> bool;
}

/// Reports whether a VPN would capture proxied traffic.
#[async_trait]
pub trait VpnChecker: Send + Sync {
    async fn is_active(&self) -> bool;
}

/// Always answers with the same address.
#[derive(Debug, Clone, Copy)]
pub struct StaticAddressProvider(pub Option<IpAddr>);

#[async_trait]
impl AddressProvider for StaticAddressProvider {
    async fn current_address(&self) -> Option<IpAddr> {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StaticPermissionGuard(pub bool);

#[async_trait]
impl PermissionGuard for StaticPermissionGuard {
    async fn is_allowed(&self) -> bool {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StaticVpnChecker(pub bool);

#[async_trait]
impl VpnChecker for StaticVpnChecker {
    async fn is_active(&self) -> bool {
        self.0
    }
}

/// The host-side checks consulted on every start.
#[derive(Clone)]
pub struct Collaborators {
    pub address: Arc<dyn AddressProvider>,
    pub permissions: Arc<dyn PermissionGuard>,
    pub vpn: Arc<dyn VpnChecker>,
}

impl Collaborators {
    /// Collaborators that always allow starting on `address`.
    pub fn permissive(address: IpAddr) -> Self {
        Self {
            address: Arc::new(StaticAddressProvider(Some(address))),
            permissions: Arc::new(StaticPermissionGuard(true)),
            vpn: Arc::new(StaticVpnChecker(false)),
        }
    }
}

// =============================================================================
// Options
// =============================================================================

/// Tunables for a [`SharedProxy`].
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub tcp_port: u16,
    pub udp_port: u16,
    pub udp_enabled: bool,
    /// Bind the unspecified address of the provider's family instead of the
    /// provided address itself.
    pub bind_all: bool,
    pub debug: bool,
    pub connect_timeout: Duration,
    pub udp_reply_timeout: Duration,
    /// Close TCP sessions idle this long; `None` never does.
    pub idle_timeout: Option<Duration>,
    pub parallelism: usize,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            tcp_port: DEFAULT_PROXY_PORT,
            udp_port: DEFAULT_PROXY_PORT,
            udp_enabled: true,
            bind_all: false,
            debug: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            udp_reply_timeout: DEFAULT_UDP_REPLY_TIMEOUT,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            parallelism: default_parallelism(),
        }
    }
}

// =============================================================================
// SharedProxy
// =============================================================================

struct RunningManager {
    manager: Arc<dyn ProxyManager>,
    task: JoinHandle<Result<(), ProxyError>>,
}

/// Starts, stops and observes the TCP and UDP proxies as one unit.
pub struct SharedProxy {
    options: ProxyOptions,
    collaborators: Collaborators,
    factory: ProxyManagerFactory,
    dispatchers: ProxyDispatcher,
    status: Arc<StatusBroadcaster>,
    connections: Arc<ConnectionLog>,
    errors: Arc<ErrorLog>,
    clients: Arc<ClientRegistry>,
    running: Mutex<Vec<RunningManager>>,
}

impl SharedProxy {
    pub fn new(options: ProxyOptions, collaborators: Collaborators) -> Self {
        Self::with_status(options, collaborators, StatusBroadcaster::new())
    }

    /// Like [`SharedProxy::new`] but with a caller-built status cell, e.g. one
    /// carrying a refresh hook.
    pub fn with_status(
        options: ProxyOptions,
        collaborators: Collaborators,
        status: StatusBroadcaster,
    ) -> Self {
        let connections = Arc::new(ConnectionLog::new());
        let errors = Arc::new(ErrorLog::new());
        let clients = Arc::new(ClientRegistry::new());
        let ctx = SessionContext::new(Arc::clone(&connections), Arc::clone(&errors))
            .with_clients(Arc::clone(&clients))
            .with_debug(options.debug)
            .with_connect_timeout(options.connect_timeout)
            .with_udp_reply_timeout(options.udp_reply_timeout)
            .with_idle_timeout(options.idle_timeout);

        Self {
            dispatchers: ProxyDispatcher::with_parallelism(options.parallelism),
            factory: ProxyManagerFactory::new(ctx),
            options,
            collaborators,
            status: Arc::new(status),
            connections,
            errors,
            clients,
            running: Mutex::new(Vec::new()),
        }
    }

    pub fn status(&self) -> &Arc<StatusBroadcaster> {
        &self.status
    }

    pub fn connections(&self) -> &Arc<ConnectionLog> {
        &self.connections
    }

    pub fn errors(&self) -> &Arc<ErrorLog> {
        &self.errors
    }

    /// Devices seen since the last start, with their transfer totals.
    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    /// Addresses of the managers that are currently listening.
    pub async fn local_addrs(&self) -> Vec<(ProxyKind, SocketAddr)> {
        self.running
            .lock()
            .await
            .iter()
            .filter_map(|r| r.manager.local_addr().map(|addr| (r.manager.kind(), addr)))
            .collect()
    }

    /// Start both proxies.
    ///
    /// Does nothing if already running. On failure the status is left at
    /// `Error` and nothing keeps running.
    pub async fn start(&self) -> Result<(), ProxyError> {
        let mut running = self.running.lock().await;
        if !running.is_empty() {
            if self.status.get().is_running() {
                debug!("Proxy already running");
                return Ok(());
            }
            // A manager failed after start; tear the rest down first.
            self.stop_managers(&mut running).await;
        }

        self.status.set(RunningStatus::Starting);
        self.reset_logs().await;

        match self.launch(&mut running).await {
            Ok(()) => {
                self.status.set(RunningStatus::Running);
                info!("Proxy running");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Proxy failed to start");
                self.stop_managers(&mut running).await;
                self.dispatchers.shutdown();
                self.status.set(RunningStatus::error(&e));
                Err(e)
            }
        }
    }

    /// Stop both proxies and wait for every session to end.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        self.status.set(RunningStatus::Stopping);

        self.stop_managers(&mut running).await;
        self.dispatchers.shutdown();
        self.submit_clear().await;

        self.status.set(RunningStatus::NotRunning);
        info!("Proxy stopped");
    }

    async fn launch(&self, running: &mut Vec<RunningManager>) -> Result<(), ProxyError> {
        let address = self.check_collaborators().await?;
        let ip = match (self.options.bind_all, address) {
            (false, ip) => ip,
            (true, IpAddr::V4(_)) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            (true, IpAddr::V6(_)) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };

        let dispatcher = self
            .dispatchers
            .ensure_active_dispatcher()
            .map_err(ProxyError::Dispatcher)?;

        let mut ports = vec![(ProxyKind::Tcp, self.options.tcp_port)];
        if self.options.udp_enabled {
            ports.push((ProxyKind::Udp, self.options.udp_port));
        }

        for (kind, port) in ports {
            let manager = self
                .factory
                .create(kind, SocketAddr::new(ip, port), Arc::clone(&dispatcher));
            let status = Arc::clone(&self.status);
            let task = dispatcher.spawn({
                let manager = Arc::clone(&manager);
                async move {
                    let result = manager.run().await;
                    if let Err(e) = &result {
                        status.set(RunningStatus::error(e));
                    }
                    result
                }
            });
            running.push(RunningManager { manager, task });
        }

        for index in 0..running.len() {
            if running[index].manager.wait_until_ready().await.is_none() {
                return Err(self.startup_failure(running, index).await);
            }
        }
        Ok(())
    }

    async fn check_collaborators(&self) -> Result<IpAddr, ProxyError> {
        if !self.collaborators.permissions.is_allowed().await {
            return Err(ProxyError::PermissionDenied);
        }
        if self.collaborators.vpn.is_active().await {
            return Err(ProxyError::VpnActive);
        }
        self.collaborators
            .address
            .current_address()
            .await
            .ok_or(ProxyError::NoAddress)
    }

    /// Take the error out of the manager at `index`, which failed to listen.
    async fn startup_failure(&self, running: &mut Vec<RunningManager>, index: usize) -> ProxyError {
        let failed = running.remove(index);
        let kind = failed.manager.kind();
        match failed.task.await {
            Ok(Err(e)) => e,
            _ => ProxyError::Bind {
                kind,
                addr: failed.manager.bind_addr(),
                source: std::io::Error::other("manager closed before listening"),
            },
        }
    }

    async fn stop_managers(&self, running: &mut Vec<RunningManager>) {
        for r in running.iter() {
            r.manager.stop();
        }
        for r in running.drain(..) {
            let kind = r.manager.kind();
            match r.task.await {
                Ok(Ok(())) => debug!(kind = %kind, "Proxy manager stopped"),
                Ok(Err(e)) => warn!(kind = %kind, error = %e, "Proxy manager stopped with error"),
                Err(e) => debug!(kind = %kind, error = %e, "Proxy manager task cancelled"),
            }
        }
    }

    async fn submit_clear(&self) {
        self.connections.submit(ConnectionEvent::clear()).await;
        self.errors.submit(ErrorEvent::clear()).await;
    }

    async fn reset_logs(&self) {
        self.submit_clear().await;
        self.connections.clear().await;
        self.errors.clear().await;
        self.clients.clear();
    }
}
