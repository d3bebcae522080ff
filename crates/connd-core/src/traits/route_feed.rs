// # Route Feed Trait
//
// Defines the interface for sources of kernel link and route change
// notifications.
//
// ## Implementations
//
// - Netlink-based (Linux): `connd-rtnl-netlink` crate
// - Tests: in-memory controlled feeds
//
// ## Usage
//
// ```rust,ignore
// use connd_core::RouteFeed;
// use tokio_stream::StreamExt;
//
// #[tokio::main]
// async fn main() -> anyhow::Result<()> {
//     let feed = /* RouteFeed implementation */;
//
//     let mut stream = feed.watch();
//     while let Some(event) = stream.next().await {
//         println!("route event: {:?}", event?);
//     }
//
//     Ok(())
// }
// ```

use std::net::IpAddr;
use std::pin::Pin;
use tokio_stream::Stream;

/// One kernel notification, translated from the wire format
///
/// Produced only by a [`RouteFeed`]; never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteEvent {
    /// A link appeared or changed
    NewLink {
        /// Interface index
        index: u32,
        /// ARPHRD link type
        link_type: u16,
        /// Current `IFF_*` flags
        flags: u32,
        /// Mask of flags that changed
        change: u32,
    },
    /// A link was removed
    DelLink {
        /// Interface index
        index: u32,
        /// ARPHRD link type
        link_type: u16,
        /// Last `IFF_*` flags
        flags: u32,
        /// Mask of flags that changed
        change: u32,
    },
    /// A default route via `gateway` was added on `index`
    NewGateway {
        /// Output interface index
        index: u32,
        /// Gateway address
        gateway: IpAddr,
    },
    /// A default route via `gateway` was removed from `index`
    DelGateway {
        /// Output interface index
        index: u32,
        /// Gateway address
        gateway: IpAddr,
    },
}

/// Discriminant of a [`RouteEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteEventKind {
    NewLink,
    DelLink,
    NewGateway,
    DelGateway,
}

impl RouteEvent {
    /// Interface index the event refers to
    pub fn index(&self) -> u32 {
        match self {
            Self::NewLink { index, .. }
            | Self::DelLink { index, .. }
            | Self::NewGateway { index, .. }
            | Self::DelGateway { index, .. } => *index,
        }
    }

    /// Event kind
    pub fn kind(&self) -> RouteEventKind {
        match self {
            Self::NewLink { .. } => RouteEventKind::NewLink,
            Self::DelLink { .. } => RouteEventKind::DelLink,
            Self::NewGateway { .. } => RouteEventKind::NewGateway,
            Self::DelGateway { .. } => RouteEventKind::DelGateway,
        }
    }
}

/// Trait for kernel route feed implementations
///
/// A feed is a serialized, single-reader source: the engine reads one
/// event, dispatches it completely, then reads the next.
///
/// # Failure semantics
///
/// - A pending stream means "no new events yet" and is never an error.
/// - An `Err` item, or the stream ending, means the feed is lost: no
///   further events will arrive on this stream. Implementations should
///   yield [`Error::FeedLost`](crate::Error::FeedLost) so the daemon can
///   tell the two apart and decide whether to resubscribe.
///
/// # Task Spawning Rules
///
/// If you spawn tasks in your implementation they MUST wait on the
/// socket, not poll it, and MUST stop when the stream is dropped.
pub trait RouteFeed: Send + Sync {
    /// Short name for logs (e.g. "netlink")
    fn name(&self) -> &str;

    /// Subscribe to the feed
    ///
    /// Each call opens a new subscription. Calling it again after the
    /// previous stream reported loss is how a caller resubscribes.
    fn watch(
        &self,
    ) -> Pin<Box<dyn Stream<Item = Result<RouteEvent, crate::Error>> + Send + 'static>>;
}

/// Helper trait for constructing route feeds from configuration
pub trait RouteFeedFactory: Send + Sync {
    /// Create a RouteFeed instance from configuration
    fn create(
        &self,
        config: &crate::config::RtnlConfig,
    ) -> Result<Box<dyn RouteFeed>, crate::Error>;
}
