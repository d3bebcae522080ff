//! Ordered notifier registry
//!
//! Feature plugins (DNS updater, default-route selector, proxy handler,
//! session policy, ...) implement [`Notifier`] and register here. The
//! registry fans every service event out to them in a fixed order and
//! tracks global connectivity so it can derive [`NetworkState`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use connd_core::registry::NotifierRegistry;
//!
//! let registry = NotifierRegistry::new();
//! registry.register(Arc::new(DnsUpdater::new()))?;
//!
//! // the service layer reports events
//! registry.service_state_changed(&wifi, ServiceState::Ready);
//! registry.connect(ServiceType::Wifi);
//! ```
//!
//! ## Ordering
//!
//! Notifiers run in ascending priority, ties broken by registration
//! order. Each dispatch iterates a snapshot, so a notifier that
//! unregisters itself (or another notifier) from inside a hook finishes
//! the current pass and is skipped from the next one on.

use crate::error::{Error, Result};
use crate::traits::{IpConfig, Notifier, Service, ServiceState, ServiceType};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Run one plugin hook, containing any panic it raises
///
/// The panic is logged with the owner and hook names and swallowed, so
/// the caller can keep dispatching to the remaining consumers.
pub(crate) fn isolate_hook<F>(owner: &str, hook: &str, f: F)
where
    F: FnOnce(),
{
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!(owner, hook, panic = %message, "hook panicked, continuing dispatch");
    }
}

/// Global connectivity summary derived from the connection counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkState {
    /// Offline mode is enabled
    Offline,
    /// No service is connected
    Idle,
    /// At least one service is connected, none online
    Ready,
    /// At least one service has verified Internet access
    Online,
}

impl NetworkState {
    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Idle => "idle",
            Self::Ready => "ready",
            Self::Online => "online",
        }
    }
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct NotifierEntry {
    name: String,
    priority: i32,
    notifier: Arc<dyn Notifier>,
}

#[derive(Default)]
struct Connectivity {
    connected: [u32; ServiceType::ALL.len()],
    online: [u32; ServiceType::ALL.len()],
    offline_mode: bool,
    active_services: HashSet<String>,
}

impl Connectivity {
    fn any(counters: &[u32]) -> bool {
        ServiceType::ALL
            .into_iter()
            .filter(|t| t.counts_for_connectivity())
            .any(|t| counters[t.slot()] > 0)
    }

    fn state(&self) -> NetworkState {
        if self.offline_mode {
            NetworkState::Offline
        } else if Self::any(&self.online) {
            NetworkState::Online
        } else if Self::any(&self.connected) {
            NetworkState::Ready
        } else {
            NetworkState::Idle
        }
    }
}

/// Registry of notifier plugins
///
/// Shared by `Arc`; every method takes `&self`. Locks are released
/// before any hook runs, so hooks may call back into the registry.
pub struct NotifierRegistry {
    notifiers: RwLock<Vec<NotifierEntry>>,
    connectivity: Mutex<Connectivity>,
    state_tx: watch::Sender<NetworkState>,
}

impl Default for NotifierRegistry {
    fn default() -> Self {
        let (state_tx, _) = watch::channel(NetworkState::Idle);
        Self {
            notifiers: RwLock::new(Vec::new()),
            connectivity: Mutex::new(Connectivity::default()),
            state_tx,
        }
    }
}

impl NotifierRegistry {
    /// Create an empty registry in the [`NetworkState::Idle`] state
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a notifier
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRegistered`] if a notifier with the same
    /// name is present.
    pub fn register(&self, notifier: Arc<dyn Notifier>) -> Result<()> {
        let name = notifier.name().to_string();
        let priority = notifier.priority();

        let mut notifiers = self.notifiers.write();
        if notifiers.iter().any(|entry| entry.name == name) {
            return Err(Error::already_registered(name));
        }

        let pos = notifiers.partition_point(|entry| entry.priority <= priority);
        notifiers.insert(
            pos,
            NotifierEntry {
                name: name.clone(),
                priority,
                notifier,
            },
        );
        info!(notifier = %name, priority, "registered notifier");
        Ok(())
    }

    /// Unregister a notifier by name
    ///
    /// Returns `false` if no such notifier was registered.
    pub fn unregister(&self, name: &str) -> bool {
        let mut notifiers = self.notifiers.write();
        let before = notifiers.len();
        notifiers.retain(|entry| entry.name != name);
        let removed = notifiers.len() != before;
        if removed {
            info!(notifier = %name, "unregistered notifier");
        }
        removed
    }

    /// Notifier names in dispatch order
    pub fn names(&self) -> Vec<String> {
        self.notifiers
            .read()
            .iter()
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// Check if a notifier is registered
    pub fn is_registered(&self, name: &str) -> bool {
        self.notifiers.read().iter().any(|entry| entry.name == name)
    }

    fn each<F>(&self, hook: &'static str, f: F)
    where
        F: Fn(&dyn Notifier),
    {
        let snapshot: Vec<Arc<dyn Notifier>> = self
            .notifiers
            .read()
            .iter()
            .map(|entry| Arc::clone(&entry.notifier))
            .collect();

        for notifier in snapshot {
            isolate_hook(notifier.name(), hook, || f(notifier.as_ref()));
        }
    }

    /// Announce a new default service
    pub fn default_changed(&self, service: Option<&dyn Service>) {
        debug!(
            service = service.map(|s| s.identifier()).unwrap_or("none"),
            "default service changed"
        );
        self.each("default_changed", |n| n.default_changed(service));
    }

    /// Announce a new service
    pub fn service_add(&self, service: &dyn Service, name: Option<&str>) {
        debug!(service = service.identifier(), name, "service added");
        self.each("service_add", |n| n.service_add(service, name));
    }

    /// Announce a removed service
    ///
    /// A removed service no longer counts as active; if it was the last
    /// one the idle transition is announced after the removal.
    pub fn service_remove(&self, service: &dyn Service) {
        debug!(service = service.identifier(), "service removed");
        self.each("service_remove", |n| n.service_remove(service));

        let became_idle = {
            let mut conn = self.connectivity.lock();
            conn.active_services.remove(service.identifier()) && conn.active_services.is_empty()
        };
        if became_idle {
            self.idle_state(true);
        }
    }

    /// Announce a technology being enabled or disabled
    pub fn service_enabled(&self, service_type: ServiceType, enabled: bool) {
        debug!(%service_type, enabled, "technology toggled");
        self.each("service_enabled", |n| n.service_enabled(service_type, enabled));
    }

    /// Toggle offline mode
    pub fn offline_mode(&self, enabled: bool) {
        info!(enabled, "offline mode changed");
        {
            let mut conn = self.connectivity.lock();
            conn.offline_mode = enabled;
            self.publish_state(&conn);
        }
        self.each("offline_mode", |n| n.offline_mode(enabled));
    }

    /// Announce changed proxy settings
    pub fn proxy_changed(&self, service: &dyn Service) {
        debug!(service = service.identifier(), "proxy changed");
        self.each("proxy_changed", |n| n.proxy_changed(service));
    }

    /// Announce a service state transition
    ///
    /// After every notifier has seen the transition, the system idle
    /// state is re-evaluated: the first service to become active
    /// announces `idle_state(false)`, the last one to leave announces
    /// `idle_state(true)`. Repeated states do not re-announce.
    pub fn service_state_changed(&self, service: &dyn Service, state: ServiceState) {
        debug!(service = service.identifier(), %state, "service state changed");
        self.each("service_state_changed", |n| {
            n.service_state_changed(service, state)
        });

        let transition = {
            let mut conn = self.connectivity.lock();
            let was_idle = conn.active_services.is_empty();
            if state.is_active() {
                conn.active_services.insert(service.identifier().to_string());
            } else {
                conn.active_services.remove(service.identifier());
            }
            let is_idle = conn.active_services.is_empty();
            (was_idle != is_idle).then_some(is_idle)
        };

        if let Some(idle) = transition {
            self.idle_state(idle);
        }
    }

    /// Announce a changed IP configuration
    pub fn ipconfig_changed(&self, service: &dyn Service, ipconfig: &dyn IpConfig) {
        debug!(
            service = service.identifier(),
            index = ipconfig.index(),
            "ipconfig changed"
        );
        self.each("ipconfig_changed", |n| n.ipconfig_changed(service, ipconfig));
    }

    /// Announce the system idle state directly
    pub fn idle_state(&self, idle: bool) {
        info!(idle, "idle state changed");
        self.each("idle_state", |n| n.idle_state(idle));
    }

    /// Count a connected service of `service_type`
    pub fn connect(&self, service_type: ServiceType) {
        let mut conn = self.connectivity.lock();
        conn.connected[service_type.slot()] += 1;
        debug!(%service_type, count = conn.connected[service_type.slot()], "connected");
        self.publish_state(&conn);
    }

    /// Count a disconnected service of `service_type`
    ///
    /// Unbalanced calls are logged and ignored.
    pub fn disconnect(&self, service_type: ServiceType) {
        let mut conn = self.connectivity.lock();
        let slot = service_type.slot();
        if conn.connected[slot] == 0 {
            warn!(%service_type, "disconnect without matching connect");
            return;
        }
        conn.connected[slot] -= 1;
        debug!(%service_type, count = conn.connected[slot], "disconnected");
        self.publish_state(&conn);
    }

    /// Count a service of `service_type` reaching online
    pub fn enter_online(&self, service_type: ServiceType) {
        let mut conn = self.connectivity.lock();
        conn.online[service_type.slot()] += 1;
        self.publish_state(&conn);
    }

    /// Count a service of `service_type` leaving online
    ///
    /// Unbalanced calls are logged and ignored.
    pub fn leave_online(&self, service_type: ServiceType) {
        let mut conn = self.connectivity.lock();
        let slot = service_type.slot();
        if conn.online[slot] == 0 {
            warn!(%service_type, "leave_online without matching enter_online");
            return;
        }
        conn.online[slot] -= 1;
        self.publish_state(&conn);
    }

    /// True if any counted service is connected
    pub fn is_connected(&self) -> bool {
        Connectivity::any(&self.connectivity.lock().connected)
    }

    /// True if any counted service is online
    pub fn is_online(&self) -> bool {
        Connectivity::any(&self.connectivity.lock().online)
    }

    /// Current global state
    pub fn state(&self) -> NetworkState {
        *self.state_tx.borrow()
    }

    /// Subscribe to global state changes
    pub fn subscribe_state(&self) -> watch::Receiver<NetworkState> {
        self.state_tx.subscribe()
    }

    fn publish_state(&self, conn: &Connectivity) {
        let next = conn.state();
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(state = %next, "network state changed");
        }
    }
}
