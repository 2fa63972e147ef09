//! Per-connection proxy sessions.

pub(crate) mod tcp;
pub(crate) mod udp;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clients::ClientRegistry;
use crate::error::SessionError;
use crate::logging::{ConnectionLog, ErrorLog};
use crate::mempool::BufferPool;
use crate::urlfixer::UrlFixers;

/// Default upper bound on connecting to an upstream host.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait for the reply to a forwarded datagram.
pub const DEFAULT_UDP_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a session needs besides its own socket.
///
/// One context is shared by every session of every manager a factory
/// creates.
#[derive(Clone)]
pub struct SessionContext {
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) fixers: UrlFixers,
    pub(crate) connections: Arc<ConnectionLog>,
    pub(crate) errors: Arc<ErrorLog>,
    pub(crate) clients: Arc<ClientRegistry>,
    pub(crate) debug: bool,
    pub(crate) connect_timeout: Duration,
    pub(crate) udp_reply_timeout: Duration,
    pub(crate) idle_timeout: Option<Duration>,
}

impl SessionContext {
    pub fn new(connections: Arc<ConnectionLog>, errors: Arc<ErrorLog>) -> Self {
        Self {
            pool: Arc::new(BufferPool::new()),
            fixers: UrlFixers::with_defaults(),
            connections,
            errors,
            clients: Arc::new(ClientRegistry::new()),
            debug: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            udp_reply_timeout: DEFAULT_UDP_REPLY_TIMEOUT,
            idle_timeout: None,
        }
    }

    /// Log every session at `info` instead of `debug`.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_udp_reply_timeout(mut self, timeout: Duration) -> Self {
        self.udp_reply_timeout = timeout;
        self
    }

    /// Close TCP sessions that move no bytes in either direction for
    /// `timeout`. `None` waits forever.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_clients(mut self, clients: Arc<ClientRegistry>) -> Self {
        self.clients = clients;
        self
    }

    pub fn with_url_fixers(mut self, fixers: UrlFixers) -> Self {
        self.fixers = fixers;
        self
    }

    pub fn with_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn connections(&self) -> &Arc<ConnectionLog> {
        &self.connections
    }

    pub fn errors(&self) -> &Arc<ErrorLog> {
        &self.errors
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub fn debug(&self) -> bool {
        self.debug
    }
}

/// Shared inactivity deadline for one TCP session.
///
/// Both relay directions touch the same clock, so a long one-way download
/// does not time out the quiet direction.
pub(crate) struct IdleTimer {
    limit: Option<Duration>,
    start: Instant,
    last_activity_ms: AtomicU64,
}

impl IdleTimer {
    pub(crate) fn new(limit: Option<Duration>) -> Self {
        Self {
            limit,
            start: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    /// Record that bytes moved.
    pub(crate) fn touch(&self) {
        let elapsed = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_activity_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Time left before the session counts as idle, `None` if it never does.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        let limit = self.limit?;
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        let idle = self.start.elapsed().saturating_sub(last);
        Some(limit.saturating_sub(idle))
    }

    pub(crate) fn expired(&self) -> SessionError {
        SessionError::IdleTimeout {
            timeout: self.limit.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_timer_never_expires() {
        let timer = IdleTimer::new(None);
        assert_eq!(timer.remaining(), None);
    }

    #[test]
    fn test_touch_pushes_deadline_back() {
        let timer = IdleTimer::new(Some(Duration::from_secs(10)));
        std::thread::sleep(Duration::from_millis(1100));
        assert!(timer.remaining().unwrap() <= Duration::from_millis(8900));

        timer.touch();
        assert!(timer.remaining().unwrap() > Duration::from_millis(9500));
    }

    #[test]
    fn test_zero_limit_is_already_expired() {
        let timer = IdleTimer::new(Some(Duration::ZERO));
        assert_eq!(timer.remaining(), Some(Duration::ZERO));
        assert!(matches!(timer.expired(), SessionError::IdleTimeout { .. }));
    }
}
