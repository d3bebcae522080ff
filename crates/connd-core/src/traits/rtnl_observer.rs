// # RTNL Observer Trait
//
// Whole-system observers of link and gateway changes. Unlike per-index
// newlink watches, observers see every interface and are called in a
// fixed priority order.

use std::net::IpAddr;

/// Ordered observer of route events across all interfaces
///
/// Every hook has an empty default; implement only the ones you need.
/// Observers are called after the per-index watches of the same event,
/// in ascending [`priority`](RtnlObserver::priority) order, ties broken
/// by registration order.
pub trait RtnlObserver: Send + Sync {
    /// Unique name within a [`RouteWatcher`](crate::rtnl::RouteWatcher)
    fn name(&self) -> &str;

    /// Lower values run first
    fn priority(&self) -> i32 {
        crate::traits::PRIORITY_DEFAULT
    }

    /// A link appeared or changed
    fn newlink(&self, _link_type: u16, _index: u32, _flags: u32, _change: u32) {}

    /// A link was removed
    fn dellink(&self, _link_type: u16, _index: u32, _flags: u32, _change: u32) {}

    /// A default gateway was added
    fn newgateway(&self, _index: u32, _gateway: &IpAddr) {}

    /// A default gateway was removed
    fn delgateway(&self, _index: u32, _gateway: &IpAddr) {}
}
