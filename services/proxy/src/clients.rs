//! Registry of devices that have talked to the proxy.
//!
//! Clients are keyed by IP address. Every session marks its peer as seen and
//! adds the bytes it moved; blocked addresses are refused before any request
//! is read. Observers get the whole client list through a watch channel
//! whenever it changes.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use tetherfi_events::{ByteTransferReport, TetherClient};
use tokio::sync::watch;
use tracing::{debug, info};

/// Seen clients older than this are dropped by [`ClientRegistry::purge_stale`].
pub const STALE_CLIENT_AGE: Duration = Duration::from_secs(2 * 60);

#[derive(Default)]
struct Registry {
    clients: HashMap<IpAddr, TetherClient>,
    blocked: HashSet<IpAddr>,
}

impl Registry {
    fn snapshot(&self) -> Vec<TetherClient> {
        let mut clients: Vec<TetherClient> = self
            .clients
            .values()
            .map(|client| TetherClient {
                blocked: self.blocked.contains(&client.ip),
                ..client.clone()
            })
            .collect();
        clients.sort_by_key(|client| (client.first_seen, client.ip));
        clients
    }
}

/// Per-address client tracking shared by every session.
pub struct ClientRegistry {
    registry: Mutex<Registry>,
    published: watch::Sender<Vec<TetherClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        let (published, _) = watch::channel(Vec::new());
        Self {
            registry: Mutex::new(Registry::default()),
            published,
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `change` and publish the new list if it reports a change.
    fn update(&self, change: impl FnOnce(&mut Registry) -> bool) -> bool {
        let mut registry = self.registry();
        let changed = change(&mut registry);
        if changed {
            self.published.send_replace(registry.snapshot());
        }
        changed
    }

    /// Record activity from `ip`. Returns whether it was unknown before.
    pub fn seen(&self, ip: IpAddr) -> bool {
        let now = SystemTime::now();
        let mut fresh = false;
        self.update(|registry| {
            registry
                .clients
                .entry(ip)
                .and_modify(|client| client.last_seen = now)
                .or_insert_with(|| {
                    fresh = true;
                    TetherClient {
                        ip,
                        first_seen: now,
                        last_seen: now,
                        transfer: ByteTransferReport::default(),
                        blocked: false,
                    }
                });
            true
        });
        if fresh {
            debug!(client = %ip, "New client");
        }
        fresh
    }

    /// Add the bytes one session moved for `ip`.
    pub fn record_transfer(&self, ip: IpAddr, report: ByteTransferReport) {
        if report.is_empty() {
            return;
        }
        self.update(|registry| match registry.clients.get_mut(&ip) {
            Some(client) => {
                client.transfer.add(report);
                true
            }
            None => false,
        });
    }

    /// Refuse further sessions from `ip`. Returns whether it was newly blocked.
    pub fn block(&self, ip: IpAddr) -> bool {
        let blocked = self.update(|registry| registry.blocked.insert(ip));
        if blocked {
            info!(client = %ip, "Client blocked");
        }
        blocked
    }

    /// Allow `ip` again. Returns whether it was blocked.
    pub fn unblock(&self, ip: IpAddr) -> bool {
        let unblocked = self.update(|registry| registry.blocked.remove(&ip));
        if unblocked {
            info!(client = %ip, "Client unblocked");
        }
        unblocked
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.registry().blocked.contains(&ip)
    }

    pub fn client(&self, ip: IpAddr) -> Option<TetherClient> {
        let registry = self.registry();
        registry.clients.get(&ip).map(|client| TetherClient {
            blocked: registry.blocked.contains(&ip),
            ..client.clone()
        })
    }

    /// Every seen client, oldest first.
    pub fn clients(&self) -> Vec<TetherClient> {
        self.registry().snapshot()
    }

    /// A receiver holding the current client list, updated on every change.
    pub fn subscribe(&self) -> watch::Receiver<Vec<TetherClient>> {
        self.published.subscribe()
    }

    /// Drop clients not seen for `max_age`. Blocks are kept. Returns how
    /// many were dropped.
    pub fn purge_stale(&self, max_age: Duration) -> usize {
        let now = SystemTime::now();
        let mut purged = 0;
        self.update(|registry| {
            let before = registry.clients.len();
            registry.clients.retain(|_, client| {
                // A clock that went backwards counts as fresh.
                now.duration_since(client.last_seen)
                    .map_or(true, |age| age < max_age)
            });
            purged = before - registry.clients.len();
            purged > 0
        });
        purged
    }

    /// Forget every client and every block.
    pub fn clear(&self) {
        self.update(|registry| {
            let changed = !registry.clients.is_empty() || !registry.blocked.is_empty();
            registry.clients.clear();
            registry.blocked.clear();
            changed
        });
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
