//! Construction of proxy managers by kind.
//!
//! Every manager a factory creates shares the factory's [`SessionContext`],
//! so TCP and UDP sessions feed the same logs, buffer pool and client
//! registry.

use std::net::SocketAddr;
use std::sync::Arc;

use super::manager::{ProxyManager, TcpProxyManager, UdpProxyManager};
use super::session::SessionContext;
use super::ProxyKind;
use crate::dispatcher::ServerDispatcher;

/// Builds proxy managers that share one [`SessionContext`].
#[derive(Clone)]
pub struct ProxyManagerFactory {
    ctx: Arc<SessionContext>,
}

impl ProxyManagerFactory {
    pub fn new(ctx: SessionContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Create a manager of `kind` bound to `bind_addr` once run.
    pub fn create(
        &self,
        kind: ProxyKind,
        bind_addr: SocketAddr,
        dispatcher: Arc<ServerDispatcher>,
    ) -> Arc<dyn ProxyManager> {
        let ctx = Arc::clone(&self.ctx);
        match kind {
            ProxyKind::Tcp => Arc::new(TcpProxyManager::new(bind_addr, ctx, dispatcher)),
            ProxyKind::Udp => Arc::new(UdpProxyManager::new(bind_addr, ctx, dispatcher)),
        }
    }
}
