//! Observable running status of the proxy.
//!
//! A single cell holding the current [`RunningStatus`]. Setting the same
//! value twice is a no-op, so subscribers only ever see real transitions.
//! An optional refresh hook runs after every transition; the binary uses it
//! to log, a platform shell would use it to refresh a tile or notification.

use std::fmt;

use tetherfi_events::RunningStatus;
use tokio::sync::watch;
use tracing::debug;

type RefreshHook = Box<dyn Fn(&RunningStatus) + Send + Sync>;

/// Broadcasts the proxy's [`RunningStatus`] to any number of observers.
pub struct StatusBroadcaster {
    state: watch::Sender<RunningStatus>,
    refresh: Option<RefreshHook>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (state, _) = watch::channel(RunningStatus::NotRunning);
        Self {
            state,
            refresh: None,
        }
    }

    /// Create a broadcaster that calls `hook` after every transition.
    pub fn with_refresh_hook(hook: impl Fn(&RunningStatus) + Send + Sync + 'static) -> Self {
        Self {
            refresh: Some(Box::new(hook)),
            ..Self::new()
        }
    }

    /// Update the status. Returns whether it changed.
    pub fn set(&self, status: RunningStatus) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });

        if changed {
            let current = self.get();
            debug!(status = %current, "Running status changed");
            if let Some(refresh) = &self.refresh {
                refresh(&current);
            }
        }

        changed
    }

    /// The current status.
    pub fn get(&self) -> RunningStatus {
        self.state.borrow().clone()
    }

    /// A receiver that starts at the current status.
    pub fn subscribe(&self) -> watch::Receiver<RunningStatus> {
        self.state.subscribe()
    }

    /// Deliver the current status, then every change, until the returned
    /// future is dropped.
    pub async fn on_status<F>(&self, mut block: F)
    where
        F: FnMut(RunningStatus),
    {
        let mut rx = self.subscribe();
        loop {
            let status = rx.borrow_and_update().clone();
            block(status);
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StatusBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusBroadcaster")
            .field("status", &*self.state.borrow())
            .field("refresh", &self.refresh.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_starts_not_running() {
        assert_eq!(StatusBroadcaster::new().get(), RunningStatus::NotRunning);
    }

    #[test]
    fn test_set_dedups() {
        let refreshes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&refreshes);
        let status = StatusBroadcaster::with_refresh_hook(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut rx = status.subscribe();

        assert!(status.set(RunningStatus::Running));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        assert!(!status.set(RunningStatus::Running));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(status.get(), RunningStatus::Running);
    }

    #[test]
    fn test_error_messages_are_distinct_states() {
        let status = StatusBroadcaster::new();
        assert!(status.set(RunningStatus::error("a")));
        assert!(!status.set(RunningStatus::error("a")));
        assert!(status.set(RunningStatus::error("b")));
    }

    #[tokio::test]
    async fn test_on_status_delivers_current_then_changes() {
        let status = Arc::new(StatusBroadcaster::new());
        status.set(RunningStatus::Starting);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer = {
            let status = Arc::clone(&status);
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                status
                    .on_status(|s| seen.lock().unwrap().push(s))
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        status.set(RunningStatus::Running);
        status.set(RunningStatus::Running);
        tokio::time::sleep(Duration::from_millis(20)).await;
        observer.abort();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![RunningStatus::Starting, RunningStatus::Running]
        );
    }
}
