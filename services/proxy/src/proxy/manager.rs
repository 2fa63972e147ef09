//! Proxy managers: own a listening socket and dispatch sessions.
//!
//! A manager moves through [`ManagerState`] exactly once:
//!
//! ```text
//! Idle -> Binding -> Listening -> Closing -> Closed
//!            \
//!             +---------------------------> Closed   (bind failed)
//! ```
//!
//! The accept loop and every session run on the dispatcher's runtime. The
//! loop never waits on a session; sessions are tracked so `stop()` can cancel
//! them and the manager can wait for them to unwind before closing.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::session::{self, SessionContext};
use super::ProxyKind;
use crate::dispatcher::ServerDispatcher;
use crate::error::ProxyError;

/// Consecutive accept failures tolerated before a manager gives up.
pub const MAX_ACCEPT_FAILURES: u32 = 10;

/// Pause between retries after a failed accept.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Lifecycle of a proxy manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Idle,
    Binding,
    Listening,
    Closing,
    Closed,
}

impl ManagerState {
    /// Whether the manager has either started serving or given up.
    pub fn is_settled(&self) -> bool {
        !matches!(self, ManagerState::Idle | ManagerState::Binding)
    }
}

/// A TCP or UDP proxy bound to one address.
#[async_trait]
pub trait ProxyManager: Send + Sync {
    fn kind(&self) -> ProxyKind;

    /// The address the manager was asked to bind.
    fn bind_addr(&self) -> SocketAddr;

    /// The address actually bound, once listening.
    fn local_addr(&self) -> Option<SocketAddr>;

    fn state(&self) -> ManagerState;

    fn subscribe_state(&self) -> watch::Receiver<ManagerState>;

    /// Bind and serve until stopped.
    ///
    /// Returns once the manager is `Closed`. A manager can only be run once.
    async fn run(&self) -> Result<(), ProxyError>;

    /// Ask the manager to stop. Returns immediately; `run` resolves once all
    /// sessions have unwound.
    fn stop(&self);

    /// Wait until the manager is listening or has failed to.
    ///
    /// Returns the bound address when listening.
    async fn wait_until_ready(&self) -> Option<SocketAddr> {
        let mut state = self.subscribe_state();
        let settled = state.wait_for(ManagerState::is_settled).await.ok().map(|s| *s);
        match settled {
            Some(ManagerState::Listening) => self.local_addr(),
            _ => None,
        }
    }
}

/// State and resources shared by both manager kinds.
struct ManagerCore {
    kind: ProxyKind,
    bind_addr: SocketAddr,
    ctx: Arc<SessionContext>,
    dispatcher: Arc<ServerDispatcher>,
    state: watch::Sender<ManagerState>,
    local_addr: OnceLock<SocketAddr>,
    started: AtomicBool,
    cancel: CancellationToken,
    sessions: TaskTracker,
}

impl ManagerCore {
    fn new(
        kind: ProxyKind,
        bind_addr: SocketAddr,
        ctx: Arc<SessionContext>,
        dispatcher: Arc<ServerDispatcher>,
    ) -> Self {
        let (state, _) = watch::channel(ManagerState::Idle);
        Self {
            kind,
            bind_addr,
            ctx,
            dispatcher,
            state,
            local_addr: OnceLock::new(),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            sessions: TaskTracker::new(),
        }
    }

    fn set_state(&self, next: ManagerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(kind = %self.kind, from = ?previous, to = ?next, "Proxy manager state changed");
        }
    }

    fn begin(&self) -> Result<(), ProxyError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::AlreadyStarted(self.kind));
        }
        Ok(())
    }

    fn bind_failed(&self, source: io::Error) -> ProxyError {
        error!(kind = %self.kind, bind_addr = %self.bind_addr, error = %source, "Failed to bind proxy");
        self.set_state(ManagerState::Closed);
        ProxyError::Bind {
            kind: self.kind,
            addr: self.bind_addr,
            source,
        }
    }

    fn listening(&self, local_addr: SocketAddr) {
        let _ = self.local_addr.set(local_addr);
        self.set_state(ManagerState::Listening);
        info!(kind = %self.kind, bind_addr = %local_addr, "Proxy listening");
    }

    /// Record an accept failure, pausing before the next attempt.
    ///
    /// Fails once more than [`MAX_ACCEPT_FAILURES`] happened in a row.
    async fn accept_failed(&self, failures: &mut u32, source: io::Error) -> Result<(), ProxyError> {
        *failures += 1;
        if *failures > MAX_ACCEPT_FAILURES {
            error!(kind = %self.kind, failures = *failures, error = %source, "Giving up on accepting");
            return Err(ProxyError::Accept {
                kind: self.kind,
                failures: *failures,
                source,
            });
        }

        warn!(kind = %self.kind, failures = *failures, error = %source, "Accept failed, retrying");
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
        }
        Ok(())
    }

    /// Cancel and wait for every session.
    async fn drain(&self) {
        self.set_state(ManagerState::Closing);
        self.cancel.cancel();
        self.sessions.close();
        self.sessions.wait().await;
    }

    fn closed(&self) {
        self.set_state(ManagerState::Closed);
        info!(kind = %self.kind, bind_addr = %self.bind_addr, "Proxy closed");
    }

    /// Await the accept loop spawned on the dispatcher.
    async fn join(&self, task: JoinHandle<Result<(), ProxyError>>) -> Result<(), ProxyError> {
        match task.await {
            Ok(result) => result,
            Err(e) => {
                // Dispatcher closed underneath us; nothing left to clean up.
                debug!(kind = %self.kind, error = %e, "Accept loop cancelled");
                self.cancel.cancel();
                self.set_state(ManagerState::Closed);
                Ok(())
            }
        }
    }

    async fn serve_tcp(self: Arc<Self>) -> Result<(), ProxyError> {
        self.set_state(ManagerState::Binding);
        let listener = match TcpListener::bind(self.bind_addr).await {
            Ok(listener) => listener,
            Err(e) => return Err(self.bind_failed(e)),
        };
        self.listening(listener.local_addr().unwrap_or(self.bind_addr));

        let mut failures = 0u32;
        let result = loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    failures = 0;
                    let session = session::tcp::run(
                        Arc::clone(&self.ctx),
                        stream,
                        peer,
                        self.cancel.child_token(),
                    );
                    self.sessions.spawn_on(
                        session.instrument(info_span!("tcp_session", peer = %peer)),
                        self.dispatcher.handle(),
                    );
                }
                Err(e) => {
                    if let Err(e) = self.accept_failed(&mut failures, e).await {
                        break Err(e);
                    }
                }
            }
        };

        self.drain().await;
        drop(listener);
        self.closed();
        result
    }

    async fn serve_udp(self: Arc<Self>) -> Result<(), ProxyError> {
        self.set_state(ManagerState::Binding);
        let socket = match UdpSocket::bind(self.bind_addr).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => return Err(self.bind_failed(e)),
        };
        self.listening(socket.local_addr().unwrap_or(self.bind_addr));

        let mut failures = 0u32;
        let result = loop {
            let mut packet = self.ctx.pool.claim();
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                received = socket.recv_from(&mut packet) => received,
            };

            match received {
                Ok((len, peer)) => {
                    failures = 0;
                    let session = session::udp::run(
                        Arc::clone(&self.ctx),
                        Arc::clone(&socket),
                        packet,
                        len,
                        peer,
                        self.cancel.child_token(),
                    );
                    self.sessions.spawn_on(
                        session.instrument(info_span!("udp_session", peer = %peer)),
                        self.dispatcher.handle(),
                    );
                }
                Err(e) => {
                    if let Err(e) = self.accept_failed(&mut failures, e).await {
                        break Err(e);
                    }
                }
            }
        };

        self.drain().await;
        drop(socket);
        self.closed();
        result
    }
}

/// HTTP proxy over TCP, one session per accepted connection.
pub struct TcpProxyManager {
    core: Arc<ManagerCore>,
}

impl TcpProxyManager {
    pub fn new(
        bind_addr: SocketAddr,
        ctx: Arc<SessionContext>,
        dispatcher: Arc<ServerDispatcher>,
    ) -> Self {
        Self {
            core: Arc::new(ManagerCore::new(ProxyKind::Tcp, bind_addr, ctx, dispatcher)),
        }
    }
}

/// Datagram relay, one session per received datagram.
pub struct UdpProxyManager {
    core: Arc<ManagerCore>,
}

impl UdpProxyManager {
    pub fn new(
        bind_addr: SocketAddr,
        ctx: Arc<SessionContext>,
        dispatcher: Arc<ServerDispatcher>,
    ) -> Self {
        Self {
            core: Arc::new(ManagerCore::new(ProxyKind::Udp, bind_addr, ctx, dispatcher)),
        }
    }
}

macro_rules! impl_proxy_manager {
    ($manager:ty, $serve:ident, $span:literal) => {
        #[async_trait]
        impl ProxyManager for $manager {
            fn kind(&self) -> ProxyKind {
                self.core.kind
            }

            fn bind_addr(&self) -> SocketAddr {
                self.core.bind_addr
            }

            fn local_addr(&self) -> Option<SocketAddr> {
                self.core.local_addr.get().copied()
            }

            fn state(&self) -> ManagerState {
                *self.core.state.borrow()
            }

            fn subscribe_state(&self) -> watch::Receiver<ManagerState> {
                self.core.state.subscribe()
            }

            async fn run(&self) -> Result<(), ProxyError> {
                self.core.begin()?;
                let core = Arc::clone(&self.core);
                let span = info_span!($span, bind_addr = %self.core.bind_addr);
                let task = self
                    .core
                    .dispatcher
                    .spawn(core.$serve().instrument(span));
                self.core.join(task).await
            }

            fn stop(&self) {
                debug!(kind = %self.core.kind, "Stopping proxy manager");
                self.core.cancel.cancel();
            }
        }
    };
}

impl_proxy_manager!(TcpProxyManager, serve_tcp, "tcp_proxy");
impl_proxy_manager!(UdpProxyManager, serve_udp, "udp_proxy");
