// # connd-core
//
// Core library for the connd connection manager.
//
// ## Architecture Overview
//
// This library provides the primitives every network technology plugin
// builds on:
// - **AddressConfig**: IPv4/IPv6 address records with netmask, peer and gateway
// - **RouteWatcher**: Per-interface newlink watches and ordered RTNL observers
// - **RtnlEngine**: Drives a RouteFeed (kernel notifications) into the watcher
// - **NotifierRegistry**: Ordered fan-out of service events to plugins
// - **TaskManager**: Supervised helper processes with a small IPC surface
//
// ## Design Principles
//
// 1. **Separation of Concerns**: The kernel socket, the IPC transport and
//    the service layer live outside the core, behind traits
// 2. **Serialized Dispatch**: One event is fully delivered before the next
// 3. **Snapshot Iteration**: Callbacks may register and unregister freely
// 4. **Isolation**: A panicking plugin hook never stops dispatch

pub mod traits;
pub mod engine;
pub mod registry;
pub mod rtnl;
pub mod task;
pub mod ipaddress;
pub mod config;
pub mod error;

// Re-export core types for convenience
pub use traits::{
    IpConfig, Notifier, RouteEvent, RouteEventKind, RouteFeed, RouteFeedFactory, RtnlObserver,
    Service, ServiceState, ServiceType, TaskHandler,
};
pub use engine::{EngineEvent, RtnlEngine};
pub use registry::{NetworkState, NotifierRegistry};
pub use rtnl::{DispatchSummary, RouteWatcher, WatchToken};
pub use task::{ExitReport, StdioRequest, Task, TaskManager, TaskState, TaskStdio};
pub use ipaddress::{AddressConfig, AddressFamily, calc_netmask_len};
pub use config::{ConndConfig, EngineConfig, RtnlConfig, TaskConfig};
pub use error::{Error, Result};
