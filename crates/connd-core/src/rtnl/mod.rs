//! Kernel link/route event fan-out
//!
//! The [`RouteWatcher`] turns the single serialized stream of
//! [`RouteEvent`]s into callback delivery for two kinds of consumers:
//!
//! - **per-index watches**, registered with
//!   [`add_newlink_watch`](RouteWatcher::add_newlink_watch), which let a
//!   DHCP client, a VPN manager and the routing code each follow the same
//!   interface without knowing about each other;
//! - **observers** ([`RtnlObserver`]), which see every interface in a
//!   fixed priority order.
//!
//! ## Dispatch order
//!
//! ```text
//! RouteEvent ──► per-index watches (index == event or wildcard)
//!            └─► observers, ascending priority, then registration order
//! ```
//!
//! Watches are not filtered by flags: a new-link with the carrier going
//! down is delivered like any other. Filtering is the watcher's job.
//!
//! ## Re-entrancy
//!
//! Callbacks run without any registry lock held, so they may add or
//! remove watches and observers. Each pass iterates a snapshot taken
//! before the first callback. A watch removed during the pass is
//! skipped if it has not been reached yet; an observer removed during
//! the pass still completes the current pass and is gone from the next.

mod slab;

pub use slab::WatchToken;

use crate::error::{Error, Result};
use crate::registry::isolate_hook;
use crate::traits::{RouteEvent, RtnlObserver};
use parking_lot::{Mutex, RwLock};
use slab::WatchSlab;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Interface index that matches every interface
pub const ANY_INDEX: u32 = 0;

/// Interface flag bits carried by link events
pub mod link_flags {
    /// Administratively up
    pub const IFF_UP: u32 = 0x1;
    /// Point-to-point link
    pub const IFF_POINTOPOINT: u32 = 0x10;
    /// Operationally running
    pub const IFF_RUNNING: u32 = 0x40;
    /// Loopback device
    pub const IFF_LOOPBACK: u32 = 0x8;
    /// Carrier present
    pub const IFF_LOWER_UP: u32 = 0x1_0000;
}

type NewLinkCallback = Arc<dyn Fn(u32, u32) + Send + Sync>;

struct NewLinkWatch {
    index: u32,
    callback: NewLinkCallback,
}

struct ObserverEntry {
    name: String,
    priority: i32,
    observer: Arc<dyn RtnlObserver>,
}

/// How many consumers one dispatch pass reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Per-index watches invoked
    pub watches: usize,
    /// Observers invoked
    pub observers: usize,
}

/// Registry and dispatcher for route events
///
/// Owned by the daemon and shared by `Arc`. Registration is expected to
/// happen on one thread (the daemon's event loop); dispatch may run
/// concurrently with registration.
#[derive(Default)]
pub struct RouteWatcher {
    watches: Mutex<WatchSlab<NewLinkWatch>>,
    observers: RwLock<Vec<ObserverEntry>>,
    links: Mutex<HashMap<u32, u32>>,
}

impl RouteWatcher {
    /// Create an empty watcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch new-link events for `index` ([`ANY_INDEX`] for all)
    ///
    /// `callback` receives `(flags, change)` exactly as reported by the
    /// kernel. If the interface has already been seen with non-zero
    /// flags, the callback is invoked once right away with those flags
    /// and an empty change mask.
    pub fn add_newlink_watch<F>(&self, index: u32, callback: F) -> WatchToken
    where
        F: Fn(u32, u32) + Send + Sync + 'static,
    {
        let callback: NewLinkCallback = Arc::new(callback);
        let token = self.watches.lock().insert(NewLinkWatch {
            index,
            callback: Arc::clone(&callback),
        });
        debug!(index, %token, "added newlink watch");

        if index != ANY_INDEX {
            if let Some(flags) = self.link_flags(index).filter(|flags| *flags != 0) {
                isolate_hook("newlink watch", "replay", || callback(flags, 0));
            }
        }

        token
    }

    /// Remove a watch
    ///
    /// Unknown and already-removed tokens are ignored. Returns whether a
    /// watch was actually removed.
    pub fn remove_watch(&self, token: WatchToken) -> bool {
        let removed = self.watches.lock().remove(token).is_some();
        if removed {
            debug!(%token, "removed newlink watch");
        }
        removed
    }

    /// Number of live per-index watches
    pub fn watch_count(&self) -> usize {
        self.watches.lock().len()
    }

    /// Last flags seen for `index`, if the link is known
    pub fn link_flags(&self, index: u32) -> Option<u32> {
        self.links.lock().get(&index).copied()
    }

    /// Forget every cached link
    ///
    /// Called when the feed is lost: events may have been dropped, so
    /// the cache can no longer be trusted until the links are learned
    /// again. Returns the number of entries dropped.
    pub fn reset_links(&self) -> usize {
        let mut links = self.links.lock();
        let dropped = links.len();
        links.clear();
        if dropped > 0 {
            debug!(dropped, "link cache reset");
        }
        dropped
    }

    /// Register a whole-system observer
    ///
    /// Fails if an observer with the same name is already registered.
    pub fn register(&self, observer: Arc<dyn RtnlObserver>) -> Result<()> {
        let name = observer.name().to_string();
        let priority = observer.priority();

        let mut observers = self.observers.write();
        if observers.iter().any(|entry| entry.name == name) {
            return Err(Error::already_registered(name));
        }

        let pos = observers.partition_point(|entry| entry.priority <= priority);
        observers.insert(
            pos,
            ObserverEntry {
                name: name.clone(),
                priority,
                observer,
            },
        );
        info!(observer = %name, priority, "registered RTNL observer");
        Ok(())
    }

    /// Unregister an observer by name
    pub fn unregister(&self, name: &str) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|entry| entry.name != name);
        let removed = observers.len() != before;
        if removed {
            info!(observer = %name, "unregistered RTNL observer");
        }
        removed
    }

    /// Observer names in dispatch order
    pub fn observers(&self) -> Vec<String> {
        self.observers
            .read()
            .iter()
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// Deliver one event to all matching watches, then to all observers
    pub fn dispatch(&self, event: &RouteEvent) -> DispatchSummary {
        let mut summary = DispatchSummary::default();

        match *event {
            RouteEvent::NewLink {
                index,
                flags,
                change,
                ..
            } => {
                self.links.lock().insert(index, flags);
                summary.watches = self.dispatch_newlink(index, flags, change);
            }
            RouteEvent::DelLink { index, .. } => {
                self.links.lock().remove(&index);
            }
            RouteEvent::NewGateway { .. } | RouteEvent::DelGateway { .. } => {}
        }

        let observers: Vec<Arc<dyn RtnlObserver>> = self
            .observers
            .read()
            .iter()
            .map(|entry| Arc::clone(&entry.observer))
            .collect();

        for observer in observers {
            let name = observer.name();
            match event {
                RouteEvent::NewLink {
                    index,
                    link_type,
                    flags,
                    change,
                } => isolate_hook(name, "newlink", || {
                    observer.newlink(*link_type, *index, *flags, *change)
                }),
                RouteEvent::DelLink {
                    index,
                    link_type,
                    flags,
                    change,
                } => isolate_hook(name, "dellink", || {
                    observer.dellink(*link_type, *index, *flags, *change)
                }),
                RouteEvent::NewGateway { index, gateway } => {
                    isolate_hook(name, "newgateway", || observer.newgateway(*index, gateway))
                }
                RouteEvent::DelGateway { index, gateway } => {
                    isolate_hook(name, "delgateway", || observer.delgateway(*index, gateway))
                }
            }
            summary.observers += 1;
        }

        debug!(
            kind = ?event.kind(),
            index = event.index(),
            watches = summary.watches,
            observers = summary.observers,
            "dispatched route event"
        );
        summary
    }

    fn dispatch_newlink(&self, index: u32, flags: u32, change: u32) -> usize {
        let snapshot: Vec<(WatchToken, NewLinkCallback)> = self
            .watches
            .lock()
            .iter()
            .filter(|(_, watch)| watch.index == ANY_INDEX || watch.index == index)
            .map(|(token, watch)| (token, Arc::clone(&watch.callback)))
            .collect();

        let mut delivered = 0;
        for (token, callback) in snapshot {
            // removed by an earlier callback in this pass
            if !self.watches.lock().contains(token) {
                continue;
            }
            isolate_hook("newlink watch", "callback", || callback(flags, change));
            delivered += 1;
        }
        delivered
    }
}
