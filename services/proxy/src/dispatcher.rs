//! Worker pool shared by the proxy managers and their sessions.
//!
//! The pool is a dedicated multi-thread tokio runtime with `2 × cores`
//! workers. It is created lazily, replaced when it has been closed, and torn
//! down explicitly on [`ProxyDispatcher::shutdown`]. Callers re-fetch the
//! active pool with [`ProxyDispatcher::ensure_active_dispatcher`] instead of
//! holding on to one across proxy restarts.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, info};

static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

/// Default worker count: twice the logical core count.
pub fn default_parallelism() -> usize {
    num_cpus::get().saturating_mul(2).max(1)
}

/// One generation of the worker pool.
pub struct ServerDispatcher {
    id: u64,
    parallelism: usize,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
}

impl ServerDispatcher {
    fn new(parallelism: usize) -> io::Result<Self> {
        let id = NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed);
        let runtime = Builder::new_multi_thread()
            .worker_threads(parallelism)
            .thread_name_fn(move || {
                static THREAD: AtomicUsize = AtomicUsize::new(0);
                format!("proxy-{}-{}", id, THREAD.fetch_add(1, Ordering::Relaxed))
            })
            .enable_all()
            .build()?;

        Ok(Self {
            id,
            parallelism,
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
        })
    }

    fn runtime(&self) -> MutexGuard<'_, Option<Runtime>> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Unique id of this pool generation.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Whether the pool still accepts work.
    pub fn is_active(&self) -> bool {
        self.runtime().is_some()
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawn a task on the pool.
    ///
    /// On a closed pool the task is cancelled immediately and its handle
    /// resolves to a cancellation error.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Close the pool, cancelling every task on it.
    ///
    /// Does not wait for workers, so it is safe to call from async code,
    /// including from tasks running on this pool.
    pub fn close(&self) {
        if let Some(runtime) = self.runtime().take() {
            debug!(dispatcher_id = self.id, "Closing proxy dispatcher");
            runtime.shutdown_background();
        }
    }
}

impl Drop for ServerDispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// Owner of the active [`ServerDispatcher`].
pub struct ProxyDispatcher {
    parallelism: usize,
    active: Mutex<Option<Arc<ServerDispatcher>>>,
}

impl ProxyDispatcher {
    /// Create a dispatcher sized to the host.
    pub fn new() -> Self {
        Self::with_parallelism(default_parallelism())
    }

    /// Create a dispatcher with an explicit worker count.
    pub fn with_parallelism(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
            active: Mutex::new(None),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<Arc<ServerDispatcher>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the active pool, creating a fresh one if there is none or the
    /// current one has been closed.
    pub fn ensure_active_dispatcher(&self) -> io::Result<Arc<ServerDispatcher>> {
        let mut active = self.active();

        if let Some(current) = active.as_ref() {
            if current.is_active() {
                return Ok(Arc::clone(current));
            }
        }

        if let Some(stale) = active.take() {
            stale.close();
        }

        let dispatcher = Arc::new(ServerDispatcher::new(self.parallelism)?);
        info!(
            dispatcher_id = dispatcher.id(),
            parallelism = self.parallelism,
            "Created proxy dispatcher"
        );
        *active = Some(Arc::clone(&dispatcher));
        Ok(dispatcher)
    }

    /// Close the active pool and forget it.
    pub fn shutdown(&self) {
        if let Some(dispatcher) = self.active().take() {
            info!(dispatcher_id = dispatcher.id(), "Shutting down proxy dispatcher");
            dispatcher.close();
        }
    }
}

impl Default for ProxyDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_parallelism_is_twice_cores() {
        assert_eq!(default_parallelism(), num_cpus::get() * 2);
    }

    #[test]
    fn test_reuses_active_dispatcher() {
        let dispatcher = ProxyDispatcher::with_parallelism(2);
        let a = dispatcher.ensure_active_dispatcher().unwrap();
        let b = dispatcher.ensure_active_dispatcher().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.parallelism(), 2);
        dispatcher.shutdown();
    }

    #[test]
    fn test_shutdown_replaces_dispatcher() {
        let dispatcher = ProxyDispatcher::with_parallelism(1);
        let first = dispatcher.ensure_active_dispatcher().unwrap();
        dispatcher.shutdown();
        assert!(!first.is_active());

        let second = dispatcher.ensure_active_dispatcher().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(first.id(), second.id());
        assert!(second.is_active());
        dispatcher.shutdown();
    }

    #[test]
    fn test_closed_dispatcher_is_replaced_lazily() {
        let dispatcher = ProxyDispatcher::with_parallelism(1);
        let first = dispatcher.ensure_active_dispatcher().unwrap();
        first.close();

        let second = dispatcher.ensure_active_dispatcher().unwrap();
        assert_ne!(first.id(), second.id());
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn test_spawn_runs_on_pool() {
        let dispatcher = ProxyDispatcher::with_parallelism(1);
        let pool = dispatcher.ensure_active_dispatcher().unwrap();

        let name = pool
            .spawn(async { std::thread::current().name().map(str::to_string) })
            .await
            .unwrap();
        assert!(name.unwrap().starts_with(&format!("proxy-{}-", pool.id())));

        dispatcher.shutdown();
        assert!(!pool.is_active());
    }
}
