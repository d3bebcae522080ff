// # Netlink Route Feed
//
// This crate provides the kernel route feed for Linux systems: a
// `NETLINK_ROUTE` socket subscribed to link and route multicast groups,
// translated into `RouteEvent`s for the core's RouteWatcher.
//
// ## What is translated
//
// - `RTM_NEWLINK` / `RTM_DELLINK` become link events, flags untouched
// - `RTM_NEWROUTE` / `RTM_DELROUTE` for default routes (prefix length 0)
//   in the main table become gateway events; an on-link default route
//   without a gateway reports the unspecified address
// - everything else is ignored
//
// ## Initial state
//
// Every subscription starts by dumping the existing links, then the
// existing routes, so links and default routes present before the
// subscription are reported as new-link and new-gateway events. Only one
// dump can run per socket, so the route request is sent once the link
// dump reports `NLMSG_DONE`.
//
// ## Failure
//
// A receive or send error on the socket ends the stream with
// `Error::FeedLost`. The kernel reports `ENOBUFS` when we fall behind,
// which means events were dropped; that is treated as loss too. The
// engine then forgets its cached links and the daemon resubscribes,
// which dumps the current state again.
//
// ## Platform Support
//
// Netlink is Linux-only. On other targets the factory reports the feed
// as unsupported.

use connd_core::config::RtnlConfig;
use connd_core::traits::{RouteFeed, RouteFeedFactory};
use connd_core::{Error, Result};

#[cfg(target_os = "linux")]
use connd_core::traits::RouteEvent;

#[cfg(target_os = "linux")]
use std::pin::Pin;

#[cfg(target_os = "linux")]
use tokio_stream::Stream;

#[cfg(target_os = "linux")]
use std::collections::VecDeque;

#[cfg(target_os = "linux")]
mod linux {
    use connd_core::traits::RouteEvent;
    use netlink_packet_core::{
        NLM_F_DUMP, NLM_F_REQUEST, NLMSG_DONE, NLMSG_ERROR, NetlinkMessage, NetlinkPayload,
    };
    use netlink_packet_route::route::nlas::Nla as RouteNla;
    use netlink_packet_route::{LinkMessage, RouteMessage, RtnlMessage};
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use tracing::{trace, warn};

    /// RTMGRP_LINK multicast group bitmask
    pub const RTMGRP_LINK: u32 = 0x0000_0001;
    /// RTMGRP_IPV4_ROUTE multicast group bitmask
    pub const RTMGRP_IPV4_ROUTE: u32 = 0x0000_0040;
    /// RTMGRP_IPV6_ROUTE multicast group bitmask
    pub const RTMGRP_IPV6_ROUTE: u32 = 0x0000_0400;

    const RT_TABLE_MAIN: u32 = 254;

    /// Events decoded from one receive buffer
    #[derive(Debug, Default)]
    pub(crate) struct Batch {
        pub(crate) events: Vec<RouteEvent>,
        /// A dump reply finished (`NLMSG_DONE` or `NLMSG_ERROR`)
        pub(crate) dump_done: bool,
    }

    /// Translate a buffer of netlink messages into route events
    ///
    /// Parsing stops at the first malformed message; events decoded
    /// before it are still returned.
    pub fn parse_messages(buffer: &[u8]) -> Vec<RouteEvent> {
        parse_batch(buffer).events
    }

    pub(crate) fn parse_batch(buffer: &[u8]) -> Batch {
        let mut batch = Batch::default();
        let mut offset = 0;

        while offset < buffer.len() {
            let message = match NetlinkMessage::<RtnlMessage>::deserialize(&buffer[offset..]) {
                Ok(message) => message,
                Err(e) => {
                    warn!(offset, remaining = buffer.len() - offset, "failed to parse netlink message: {}", e);
                    break;
                }
            };

            let length = message.header.length as usize;
            if length == 0 {
                break;
            }
            // NLMSG_ALIGN
            offset += (length + 3) & !3;

            match message.header.message_type {
                NLMSG_DONE => batch.dump_done = true,
                NLMSG_ERROR => {
                    warn!(seq = message.header.sequence_number, "netlink request failed");
                    batch.dump_done = true;
                }
                _ => {}
            }

            if let NetlinkPayload::InnerMessage(inner) = message.payload {
                if let Some(event) = translate(inner) {
                    trace!(?event, "decoded route event");
                    batch.events.push(event);
                }
            }
        }

        batch
    }

    /// Dump requests for the state covered by `groups`, in send order
    pub(crate) fn dump_requests(groups: u32) -> Vec<Vec<u8>> {
        let mut requests = Vec::new();
        if groups & RTMGRP_LINK != 0 {
            requests.push(RtnlMessage::GetLink(LinkMessage::default()));
        }

        let family = match (groups & RTMGRP_IPV4_ROUTE != 0, groups & RTMGRP_IPV6_ROUTE != 0) {
            (true, true) => Some(libc::AF_UNSPEC),
            (true, false) => Some(libc::AF_INET),
            (false, true) => Some(libc::AF_INET6),
            (false, false) => None,
        };
        if let Some(family) = family {
            let mut route = RouteMessage::default();
            route.header.address_family = family as u8;
            requests.push(RtnlMessage::GetRoute(route));
        }

        requests
            .into_iter()
            .zip(1u32..)
            .map(|(message, seq)| {
                let mut packet = NetlinkMessage::from(message);
                packet.header.flags = NLM_F_REQUEST | NLM_F_DUMP;
                packet.header.sequence_number = seq;
                packet.finalize();
                let mut buffer = vec![0; packet.buffer_len()];
                packet.serialize(&mut buffer);
                buffer
            })
            .collect()
    }

    fn translate(message: RtnlMessage) -> Option<RouteEvent> {
        match message {
            RtnlMessage::NewLink(link) => {
                let (index, link_type, flags, change) = link_fields(&link);
                Some(RouteEvent::NewLink {
                    index,
                    link_type,
                    flags,
                    change,
                })
            }
            RtnlMessage::DelLink(link) => {
                let (index, link_type, flags, change) = link_fields(&link);
                Some(RouteEvent::DelLink {
                    index,
                    link_type,
                    flags,
                    change,
                })
            }
            RtnlMessage::NewRoute(route) => {
                default_gateway(&route).map(|(index, gateway)| RouteEvent::NewGateway { index, gateway })
            }
            RtnlMessage::DelRoute(route) => {
                default_gateway(&route).map(|(index, gateway)| RouteEvent::DelGateway { index, gateway })
            }
            _ => None,
        }
    }

    fn link_fields(link: &LinkMessage) -> (u32, u16, u32, u32) {
        (
            link.header.index,
            link.header.link_layer_type,
            link.header.flags,
            link.header.change_mask,
        )
    }

    /// Output interface and gateway of a main-table default route
    fn default_gateway(route: &RouteMessage) -> Option<(u32, IpAddr)> {
        let header = &route.header;
        if header.destination_prefix_length != 0 {
            return None;
        }

        let family = i32::from(header.address_family);
        let mut table = u32::from(header.table);
        let mut gateway = None;
        let mut oif = None;

        for nla in &route.nlas {
            match nla {
                RouteNla::Gateway(bytes) => gateway = ip_from_bytes(family, bytes),
                RouteNla::Oif(index) => oif = Some(*index),
                RouteNla::Table(id) => table = *id,
                _ => {}
            }
        }

        if table != RT_TABLE_MAIN {
            return None;
        }

        let gateway = match (gateway, family) {
            (Some(gateway), _) => gateway,
            (None, libc::AF_INET) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            (None, libc::AF_INET6) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            (None, _) => return None,
        };

        Some((oif?, gateway))
    }

    fn ip_from_bytes(family: i32, bytes: &[u8]) -> Option<IpAddr> {
        match family {
            libc::AF_INET => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
            libc::AF_INET6 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
            _ => None,
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::{RTMGRP_IPV4_ROUTE, RTMGRP_IPV6_ROUTE, RTMGRP_LINK, parse_messages};

/// Netlink-based route feed for Linux
#[cfg(target_os = "linux")]
pub struct NetlinkRouteFeed {
    groups: u32,
    receive_buffer_size: usize,
}

#[cfg(target_os = "linux")]
impl NetlinkRouteFeed {
    /// Create a feed for the groups enabled in `config`
    pub fn new(config: &RtnlConfig) -> Result<Self> {
        config.validate()?;

        let mut groups = 0;
        if config.link_events {
            groups |= RTMGRP_LINK;
        }
        if config.ipv4_routes {
            groups |= RTMGRP_IPV4_ROUTE;
        }
        if config.ipv6_routes {
            groups |= RTMGRP_IPV6_ROUTE;
        }

        Ok(Self {
            groups,
            receive_buffer_size: config.receive_buffer_size,
        })
    }

    /// Multicast group bitmask the socket is bound to
    pub fn groups(&self) -> u32 {
        self.groups
    }
}

#[cfg(target_os = "linux")]
impl RouteFeed for NetlinkRouteFeed {
    fn name(&self) -> &str {
        "netlink"
    }

    fn watch(&self) -> Pin<Box<dyn Stream<Item = Result<RouteEvent>> + Send + 'static>> {
        use netlink_sys::{AsyncSocket, AsyncSocketExt, SocketAddr, TokioSocket, protocols::NETLINK_ROUTE};
        use tracing::{debug, error, info};

        let (tx, rx) = tokio::sync::mpsc::channel(256);
        let mut pending: VecDeque<Vec<u8>> = linux::dump_requests(self.groups).into();
        let groups = self.groups;
        let receive_buffer_size = self.receive_buffer_size;

        tokio::spawn(async move {
            let opened = TokioSocket::new(NETLINK_ROUTE).and_then(|mut socket| {
                if let Ok(size) = libc::c_int::try_from(receive_buffer_size) {
                    socket.socket_ref().set_rx_buf_sz(size)?;
                }
                socket.socket_mut().bind(&SocketAddr::new(0, groups))?;
                Ok(socket)
            });

            let mut socket = match opened {
                Ok(socket) => socket,
                Err(e) => {
                    error!("Failed to open netlink socket: {}", e);
                    let _ = tx
                        .send(Err(Error::feed_lost(format!("netlink socket: {}", e))))
                        .await;
                    return;
                }
            };
            info!("Subscribed to RTNL groups 0x{:08x}", groups);

            let kernel = SocketAddr::new(0, 0);
            if let Some(request) = pending.front() {
                if let Err(e) = socket.send_to(request, &kernel).await {
                    error!("Failed to request initial state: {}", e);
                    let _ = tx
                        .send(Err(Error::feed_lost(format!("netlink dump request: {}", e))))
                        .await;
                    return;
                }
            }

            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!("Route feed dropped, closing netlink socket");
                        return;
                    }

                    received = socket.recv_from_full() => match received {
                        Ok((buffer, _addr)) => {
                            let batch = linux::parse_batch(&buffer);
                            for event in batch.events {
                                if tx.send(Ok(event)).await.is_err() {
                                    return;
                                }
                            }

                            if batch.dump_done && pending.pop_front().is_some() {
                                let Some(request) = pending.front() else {
                                    debug!("Initial state dump complete");
                                    continue;
                                };
                                if let Err(e) = socket.send_to(request, &kernel).await {
                                    error!("Failed to request initial state: {}", e);
                                    let _ = tx
                                        .send(Err(Error::feed_lost(format!("netlink dump request: {}", e))))
                                        .await;
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            error!("Netlink receive failed: {}", e);
                            let _ = tx
                                .send(Err(Error::feed_lost(format!("netlink receive: {}", e))))
                                .await;
                            return;
                        }
                    }
                }
            }
        });

        Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx))
    }
}

/// Factory for creating Netlink route feeds
pub struct NetlinkFeedFactory;

#[cfg(target_os = "linux")]
impl RouteFeedFactory for NetlinkFeedFactory {
    fn create(&self, config: &RtnlConfig) -> Result<Box<dyn RouteFeed>> {
        Ok(Box::new(NetlinkRouteFeed::new(config)?))
    }
}

#[cfg(not(target_os = "linux"))]
impl RouteFeedFactory for NetlinkFeedFactory {
    fn create(&self, _config: &RtnlConfig) -> Result<Box<dyn RouteFeed>> {
        Err(Error::config("Netlink route feed is only supported on Linux"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn test_factory_creation() {
        let factory = NetlinkFeedFactory;
        let feed = factory.create(&RtnlConfig::default());
        assert!(feed.is_ok());
        assert_eq!(feed.unwrap().name(), "netlink");
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_groups_follow_config() {
        let config = RtnlConfig {
            ipv6_routes: false,
            ..Default::default()
        };
        let feed = NetlinkRouteFeed::new(&config).unwrap();
        assert_eq!(feed.groups(), RTMGRP_LINK | RTMGRP_IPV4_ROUTE);
    }

    #[test]
    #[cfg(not(target_os = "linux"))]
    fn test_factory_unsupported() {
        let factory = NetlinkFeedFactory;
        assert!(factory.create(&RtnlConfig::default()).is_err());
    }

    #[cfg(target_os = "linux")]
    mod parse {
        use super::super::*;
        use netlink_packet_core::{
            NLM_F_DUMP, NLM_F_REQUEST, NLMSG_DONE, NetlinkMessage, NetlinkPayload,
        };
        use netlink_packet_route::route::nlas::Nla as RouteNla;
        use netlink_packet_route::{LinkMessage, RouteMessage, RtnlMessage};
        use std::net::IpAddr;

        fn encode(message: RtnlMessage) -> Vec<u8> {
            let mut packet = NetlinkMessage::from(message);
            packet.finalize();
            let mut buffer = vec![0; packet.buffer_len()];
            packet.serialize(&mut buffer);
            buffer
        }

        fn link(index: u32, flags: u32, change: u32) -> LinkMessage {
            let mut link = LinkMessage::default();
            link.header.index = index;
            link.header.link_layer_type = 1;
            link.header.flags = flags;
            link.header.change_mask = change;
            link
        }

        fn default_route(family: i32, gateway: Option<Vec<u8>>, oif: u32) -> RouteMessage {
            let mut route = RouteMessage::default();
            route.header.address_family = family as u8;
            route.header.destination_prefix_length = 0;
            route.header.table = 254;
            if let Some(gateway) = gateway {
                route.nlas.push(RouteNla::Gateway(gateway));
            }
            route.nlas.push(RouteNla::Oif(oif));
            route
        }

        #[test]
        fn test_link_messages_keep_flags() {
            let buffer = encode(RtnlMessage::NewLink(link(3, 0x10043, 0x1)));
            assert_eq!(
                parse_messages(&buffer),
                vec![RouteEvent::NewLink {
                    index: 3,
                    link_type: 1,
                    flags: 0x10043,
                    change: 0x1,
                }]
            );
        }

        #[test]
        fn test_multiple_messages_in_one_buffer() {
            let mut buffer = encode(RtnlMessage::NewLink(link(2, 0x1, 0x1)));
            buffer.extend(encode(RtnlMessage::DelLink(link(2, 0, 0))));

            let events = parse_messages(&buffer);
            assert_eq!(events.len(), 2);
            assert!(matches!(events[0], RouteEvent::NewLink { index: 2, .. }));
            assert!(matches!(events[1], RouteEvent::DelLink { index: 2, .. }));
        }

        #[test]
        fn test_default_routes_become_gateway_events() {
            let v4 = encode(RtnlMessage::NewRoute(default_route(
                libc::AF_INET,
                Some(vec![192, 168, 1, 1]),
                2,
            )));
            assert_eq!(
                parse_messages(&v4),
                vec![RouteEvent::NewGateway {
                    index: 2,
                    gateway: IpAddr::from([192, 168, 1, 1]),
                }]
            );

            let mut v6_gateway = vec![0u8; 16];
            v6_gateway[0] = 0xfe;
            v6_gateway[1] = 0x80;
            v6_gateway[15] = 1;
            let v6 = encode(RtnlMessage::DelRoute(default_route(
                libc::AF_INET6,
                Some(v6_gateway),
                4,
            )));
            assert_eq!(
                parse_messages(&v6),
                vec![RouteEvent::DelGateway {
                    index: 4,
                    gateway: "fe80::1".parse().unwrap(),
                }]
            );
        }

        #[test]
        fn test_onlink_default_route_reports_unspecified_gateway() {
            let buffer = encode(RtnlMessage::NewRoute(default_route(libc::AF_INET, None, 5)));
            assert_eq!(
                parse_messages(&buffer),
                vec![RouteEvent::NewGateway {
                    index: 5,
                    gateway: IpAddr::from([0, 0, 0, 0]),
                }]
            );
        }

        #[test]
        fn test_non_default_and_foreign_table_routes_are_ignored() {
            let mut subnet = default_route(libc::AF_INET, Some(vec![10, 0, 0, 1]), 2);
            subnet.header.destination_prefix_length = 24;
            assert!(parse_messages(&encode(RtnlMessage::NewRoute(subnet))).is_empty());

            let mut local = default_route(libc::AF_INET, Some(vec![10, 0, 0, 1]), 2);
            local.header.table = 255;
            assert!(parse_messages(&encode(RtnlMessage::NewRoute(local))).is_empty());
        }

        #[test]
        fn test_dump_requests_follow_groups() {
            let requests = linux::dump_requests(RTMGRP_LINK | RTMGRP_IPV4_ROUTE | RTMGRP_IPV6_ROUTE);
            assert_eq!(requests.len(), 2);

            let link = NetlinkMessage::<RtnlMessage>::deserialize(&requests[0]).unwrap();
            assert_eq!(link.header.flags, NLM_F_REQUEST | NLM_F_DUMP);
            assert_eq!(link.header.sequence_number, 1);
            assert!(matches!(
                link.payload,
                NetlinkPayload::InnerMessage(RtnlMessage::GetLink(_))
            ));

            let route = NetlinkMessage::<RtnlMessage>::deserialize(&requests[1]).unwrap();
            assert_eq!(route.header.sequence_number, 2);
            match route.payload {
                NetlinkPayload::InnerMessage(RtnlMessage::GetRoute(route)) => {
                    assert_eq!(i32::from(route.header.address_family), libc::AF_UNSPEC);
                }
                other => panic!("expected a route dump request, got {:?}", other),
            }

            let v6_only = linux::dump_requests(RTMGRP_IPV6_ROUTE);
            assert_eq!(v6_only.len(), 1);
            let route = NetlinkMessage::<RtnlMessage>::deserialize(&v6_only[0]).unwrap();
            assert!(matches!(
                route.payload,
                NetlinkPayload::InnerMessage(RtnlMessage::GetRoute(ref r))
                    if i32::from(r.header.address_family) == libc::AF_INET6
            ));
        }

        #[test]
        fn test_done_marks_end_of_dump() {
            let mut buffer = encode(RtnlMessage::NewLink(link(1, 0x49, 0)));
            assert!(!linux::parse_batch(&buffer).dump_done);

            // struct nlmsghdr { len: 20, type: NLMSG_DONE, flags: NLM_F_MULTI, seq: 1, pid: 0 } + int 0
            let mut done = Vec::new();
            done.extend_from_slice(&20u32.to_ne_bytes());
            done.extend_from_slice(&NLMSG_DONE.to_ne_bytes());
            done.extend_from_slice(&0x2u16.to_ne_bytes());
            done.extend_from_slice(&1u32.to_ne_bytes());
            done.extend_from_slice(&0u32.to_ne_bytes());
            done.extend_from_slice(&0i32.to_ne_bytes());
            buffer.extend(done);

            let batch = linux::parse_batch(&buffer);
            assert!(batch.dump_done);
            assert!(matches!(batch.events[..], [RouteEvent::NewLink { index: 1, .. }]));
        }

        #[test]
        fn test_truncated_buffer_yields_nothing() {
            let buffer = encode(RtnlMessage::NewLink(link(3, 0x1, 0x1)));
            assert!(parse_messages(&buffer[..buffer.len() / 2]).is_empty());
        }
    }
}
