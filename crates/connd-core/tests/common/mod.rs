//! Test doubles and common utilities for contract tests
//!
//! This module provides minimal test doubles that record what the core
//! calls on them, without implementing real functionality.

#![allow(dead_code)]

use connd_core::error::{Error, Result};
use connd_core::traits::{
    IpConfig, Notifier, RouteEvent, RouteFeed, RtnlObserver, Service, ServiceState, ServiceType,
};
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::Stream;

/// Shared, ordered log of calls made on test doubles
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    /// Entries whose text starts with `prefix`
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }
}

/// A RouteFeed whose events are pushed by the test
///
/// Every call to `watch()` opens a fresh channel, so a test can lose the
/// feed and observe the engine resubscribing.
pub struct ControlledRouteFeed {
    current: Arc<Mutex<Option<mpsc::UnboundedSender<Result<RouteEvent>>>>>,
    watch_calls: Arc<AtomicUsize>,
}

/// Test-side handle of a [`ControlledRouteFeed`]
#[derive(Clone)]
pub struct FeedHandle {
    current: Arc<Mutex<Option<mpsc::UnboundedSender<Result<RouteEvent>>>>>,
    watch_calls: Arc<AtomicUsize>,
}

impl ControlledRouteFeed {
    pub fn new() -> (Self, FeedHandle) {
        let current = Arc::new(Mutex::new(None));
        let watch_calls = Arc::new(AtomicUsize::new(0));
        let handle = FeedHandle {
            current: Arc::clone(&current),
            watch_calls: Arc::clone(&watch_calls),
        };
        (
            Self {
                current,
                watch_calls,
            },
            handle,
        )
    }
}

impl RouteFeed for ControlledRouteFeed {
    fn name(&self) -> &str {
        "controlled"
    }

    fn watch(&self) -> Pin<Box<dyn Stream<Item = Result<RouteEvent>> + Send + 'static>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.current.lock().unwrap() = Some(tx);
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx))
    }
}

impl FeedHandle {
    /// Number of subscriptions opened so far
    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    /// Push an event on the current subscription
    pub fn emit(&self, event: RouteEvent) {
        if let Some(tx) = self.current.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(event));
        }
    }

    /// Report the current subscription as failed
    pub fn fail(&self, reason: &str) {
        if let Some(tx) = self.current.lock().unwrap().take() {
            let _ = tx.send(Err(Error::feed_lost(reason)));
        }
    }

    /// End the current subscription without an error
    pub fn close(&self) {
        self.current.lock().unwrap().take();
    }

    /// Wait until at least `n` subscriptions have been opened
    pub async fn wait_for_watch(&self, n: usize) {
        for _ in 0..200 {
            if self.watch_calls() >= n {
                return;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;
        }
        panic!("feed was never subscribed {} times", n);
    }
}

/// Observer that records every hook as `"{name}:{hook}:{index}"`
pub struct RecordingObserver {
    pub name: String,
    pub priority: i32,
    pub log: CallLog,
}

impl RecordingObserver {
    pub fn new(name: &str, priority: i32, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            priority,
            log: log.clone(),
        })
    }
}

impl RtnlObserver for RecordingObserver {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn newlink(&self, _link_type: u16, index: u32, _flags: u32, _change: u32) {
        self.log.push(format!("{}:newlink:{}", self.name, index));
    }

    fn dellink(&self, _link_type: u16, index: u32, _flags: u32, _change: u32) {
        self.log.push(format!("{}:dellink:{}", self.name, index));
    }

    fn newgateway(&self, index: u32, gateway: &IpAddr) {
        self.log
            .push(format!("{}:newgateway:{}:{}", self.name, index, gateway));
    }

    fn delgateway(&self, index: u32, gateway: &IpAddr) {
        self.log
            .push(format!("{}:delgateway:{}:{}", self.name, index, gateway));
    }
}

/// Notifier that records every hook as `"{name}:{hook}"`
pub struct RecordingNotifier {
    pub name: String,
    pub priority: i32,
    pub log: CallLog,
}

impl RecordingNotifier {
    pub fn new(name: &str, priority: i32, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            priority,
            log: log.clone(),
        })
    }
}

impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn default_changed(&self, service: Option<&dyn Service>) {
        let id = service.map(|s| s.identifier()).unwrap_or("none");
        self.log
            .push(format!("{}:default_changed:{}", self.name, id));
    }

    fn service_add(&self, service: &dyn Service, _name: Option<&str>) {
        self.log
            .push(format!("{}:service_add:{}", self.name, service.identifier()));
    }

    fn service_remove(&self, service: &dyn Service) {
        self.log
            .push(format!("{}:service_remove:{}", self.name, service.identifier()));
    }

    fn service_enabled(&self, service_type: ServiceType, enabled: bool) {
        self.log.push(format!(
            "{}:service_enabled:{}:{}",
            self.name, service_type, enabled
        ));
    }

    fn offline_mode(&self, enabled: bool) {
        self.log
            .push(format!("{}:offline_mode:{}", self.name, enabled));
    }

    fn proxy_changed(&self, service: &dyn Service) {
        self.log
            .push(format!("{}:proxy_changed:{}", self.name, service.identifier()));
    }

    fn service_state_changed(&self, service: &dyn Service, state: ServiceState) {
        self.log.push(format!(
            "{}:service_state_changed:{}:{}",
            self.name,
            service.identifier(),
            state
        ));
    }

    fn ipconfig_changed(&self, service: &dyn Service, ipconfig: &dyn IpConfig) {
        self.log.push(format!(
            "{}:ipconfig_changed:{}:{}",
            self.name,
            service.identifier(),
            ipconfig.index()
        ));
    }

    fn idle_state(&self, idle: bool) {
        self.log.push(format!("{}:idle_state:{}", self.name, idle));
    }
}

/// Minimal service handle
pub struct FakeService {
    pub identifier: String,
    pub service_type: ServiceType,
}

impl FakeService {
    pub fn new(identifier: &str, service_type: ServiceType) -> Self {
        Self {
            identifier: identifier.to_string(),
            service_type,
        }
    }
}

impl Service for FakeService {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn service_type(&self) -> ServiceType {
        self.service_type
    }
}

/// Minimal IP configuration handle
pub struct FakeIpConfig(pub u32);

impl IpConfig for FakeIpConfig {
    fn index(&self) -> u32 {
        self.0
    }
}

pub fn newlink(index: u32, flags: u32, change: u32) -> RouteEvent {
    RouteEvent::NewLink {
        index,
        link_type: 1,
        flags,
        change,
    }
}

pub fn dellink(index: u32) -> RouteEvent {
    RouteEvent::DelLink {
        index,
        link_type: 1,
        flags: 0,
        change: 0,
    }
}
