//! Replayable, id-deduplicated event logs.
//!
//! Each log keeps every event in insertion order and at most one event per
//! [`SessionId`]: the first submission wins and later ones with the same id
//! are dropped. Subscribers get a replay of everything stored followed by a
//! live tail of new events. The replay snapshot and the live registration
//! happen under the same lock as `submit`, so nothing is missed or repeated.
//!
//! The live tail holds [`LIVE_TAIL_CAPACITY`] events. A subscriber that falls
//! further behind resyncs from storage and receives every stored event it
//! has not yet seen, still in insertion order. Events dropped by a `clear`
//! while it lagged are not recovered.

use std::collections::{HashSet, VecDeque};

use tetherfi_events::{ConnectionEvent, ErrorEvent, LogEvent, SessionId};
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

/// Capacity of the live tail before slow subscribers start lagging.
pub const LIVE_TAIL_CAPACITY: usize = 1024;

/// Log of established connections.
pub type ConnectionLog = LogStorage<ConnectionEvent>;

/// Log of failed sessions.
pub type ErrorLog = LogStorage<ErrorEvent>;

struct Entries<T> {
    events: Vec<T>,
    ids: HashSet<SessionId>,
    latest: Option<T>,
}

/// In-memory event log with replay for late subscribers.
pub struct LogStorage<T: LogEvent> {
    entries: Mutex<Entries<T>>,
    live: broadcast::Sender<T>,
}

impl<T: LogEvent> LogStorage<T> {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_TAIL_CAPACITY);
        Self {
            entries: Mutex::new(Entries {
                events: Vec::new(),
                ids: HashSet::new(),
                latest: None,
            }),
            live,
        }
    }

    /// Store and publish `event` unless its id is already stored.
    ///
    /// Returns whether the event was stored.
    pub async fn submit(&self, event: T) -> bool {
        let mut entries = self.entries.lock().await;
        if !entries.ids.insert(event.id()) {
            return false;
        }

        entries.events.push(event.clone());
        entries.latest = Some(event.clone());
        // No live subscribers is fine; the event is still stored for replay.
        let _ = self.live.send(event);
        true
    }

    /// Replay stored events, then follow new ones.
    pub async fn subscribe(&self) -> LogSubscription<'_, T> {
        let entries = self.entries.lock().await;
        LogSubscription {
            storage: self,
            backlog: entries.events.iter().cloned().collect(),
            live: self.live.subscribe(),
            delivered: HashSet::new(),
        }
    }

    /// Call `block` for every stored event, then for every new one, until
    /// the returned future is dropped.
    pub async fn on_log_event<F>(&self, mut block: F)
    where
        F: FnMut(T),
    {
        let mut subscription = self.subscribe().await;
        while let Some(event) = subscription.next().await {
            block(event);
        }
    }

    /// Drop every stored event and the latest marker.
    ///
    /// Subscribers are not told; submit a `Clear` event first if they should be.
    pub async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        entries.events.clear();
        entries.ids.clear();
        entries.latest = None;
    }

    /// All stored events in insertion order.
    pub async fn snapshot(&self) -> Vec<T> {
        self.entries.lock().await.events.clone()
    }

    /// The most recently stored event.
    pub async fn latest(&self) -> Option<T> {
        self.entries.lock().await.latest.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.events.is_empty()
    }
}

impl<T: LogEvent> Default for LogStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A replay-then-follow view of a [`LogStorage`].
pub struct LogSubscription<'a, T: LogEvent> {
    storage: &'a LogStorage<T>,
    backlog: VecDeque<T>,
    live: broadcast::Receiver<T>,
    /// Ids already handed out, consulted only when resyncing.
    delivered: HashSet<SessionId>,
}

impl<T: LogEvent> LogSubscription<'_, T> {
    /// The next event, or `None` once the storage is gone.
    pub async fn next(&mut self) -> Option<T> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                return Some(self.deliver(event));
            }

            match self.live.recv().await {
                Ok(event) => return Some(self.deliver(event)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Log subscriber lagged behind, resyncing from storage");
                    self.resync().await;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn deliver(&mut self, event: T) -> T {
        self.delivered.insert(event.id());
        event
    }

    /// Replace the lagged receiver and queue every stored event not yet
    /// delivered.
    async fn resync(&mut self) {
        let entries = self.storage.entries.lock().await;
        self.backlog = entries
            .events
            .iter()
            .filter(|event| !self.delivered.contains(&event.id()))
            .cloned()
            .collect();
        self.live = self.storage.live.subscribe();
    }
}
