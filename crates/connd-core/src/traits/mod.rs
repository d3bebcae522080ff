//! Core traits for connd
//!
//! This module defines the abstract interfaces at the seams between the
//! core and its collaborators.
//!
//! - [`RouteFeed`]: Source of kernel link/route notifications
//! - [`RtnlObserver`]: Ordered whole-system observer of route events
//! - [`Notifier`]: Plugin receiving service state changes
//! - [`TaskHandler`]: Request/response handler for helper-process IPC

pub mod route_feed;
pub mod rtnl_observer;
pub mod notifier;
pub mod task_handler;

pub use route_feed::{RouteFeed, RouteEvent, RouteEventKind, RouteFeedFactory};
pub use rtnl_observer::RtnlObserver;
pub use notifier::{Notifier, Service, IpConfig, ServiceType, ServiceState};
pub use task_handler::TaskHandler;

/// Priority for entries that must observe changes before the default group
pub const PRIORITY_EARLY: i32 = -100;

/// Priority used when an entry does not care about ordering
pub const PRIORITY_DEFAULT: i32 = 0;

/// Priority for entries that must run after the default group
pub const PRIORITY_LATE: i32 = 100;
