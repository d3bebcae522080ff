//! Per-interface address configuration
//!
//! [`AddressConfig`] holds the addressing of one interface or connection
//! attempt: local address, prefix length, gateway and an optional
//! point-to-point peer. At most one family is active at a time; which
//! families may become active is fixed when the value is allocated.
//!
//! Every setter parses and validates all of its inputs before touching
//! the stored state, so a failed call leaves the previous configuration
//! exactly as it was.
//!
//! The type has no interior mutability. Mutation requires `&mut self`,
//! which gives the single-writer discipline: the owning service mutates,
//! everyone else reads through shared references or a [`copy`].
//!
//! [`copy`]: AddressConfig::copy

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Families an [`AddressConfig`] is allowed to carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// IPv4 only
    Ipv4,
    /// IPv6 only
    Ipv6,
    /// Either family (one active at a time)
    Dual,
}

impl AddressFamily {
    fn allows_ipv4(self) -> bool {
        matches!(self, Self::Ipv4 | Self::Dual)
    }

    fn allows_ipv6(self) -> bool {
        matches!(self, Self::Ipv6 | Self::Dual)
    }

    fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }

    /// Lowercase name (`ipv4`, `ipv6`, `dual`)
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ipv4 => "ipv4",
            Self::Ipv6 => "ipv6",
            Self::Dual => "dual",
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddressFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ipv4" | "inet" => Ok(Self::Ipv4),
            "ipv6" | "inet6" => Ok(Self::Ipv6),
            "dual" | "both" => Ok(Self::Dual),
            other => Err(Error::invalid_input(format!("Unknown address family: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Active {
    Empty,
    V4 {
        address: Ipv4Addr,
        prefix_len: u8,
        gateway: Option<Ipv4Addr>,
    },
    V6 {
        address: Ipv6Addr,
        prefix_len: u8,
        gateway: Option<Ipv6Addr>,
    },
}

impl Active {
    fn family(&self) -> Option<AddressFamily> {
        match self {
            Self::Empty => None,
            Self::V4 { .. } => Some(AddressFamily::Ipv4),
            Self::V6 { .. } => Some(AddressFamily::Ipv6),
        }
    }
}

/// Addressing state of one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressConfig {
    family: AddressFamily,
    active: Active,
    peer: Option<IpAddr>,
}

/// Prefix length of a dotted-quad IPv4 netmask
///
/// Returns `None` for anything that is not a syntactically valid,
/// contiguous netmask (`255.0.255.0`, `255.255.255`, `/24`, ...).
/// The result depends only on the input.
///
/// ```
/// use connd_core::ipaddress::calc_netmask_len;
///
/// assert_eq!(calc_netmask_len("255.255.255.0"), Some(24));
/// assert_eq!(calc_netmask_len("0.0.0.0"), Some(0));
/// assert_eq!(calc_netmask_len("255.0.255.0"), None);
/// ```
pub fn calc_netmask_len(netmask: &str) -> Option<u8> {
    let mask = u32::from(netmask.parse::<Ipv4Addr>().ok()?);
    let host = !mask;

    // a valid netmask leaves 2^n - 1 host bits
    if host & host.wrapping_add(1) != 0 {
        return None;
    }

    Some(mask.count_ones() as u8)
}

fn prefix_to_netmask(prefix_len: u8) -> Ipv4Addr {
    match prefix_len {
        0 => Ipv4Addr::UNSPECIFIED,
        n => Ipv4Addr::from(u32::MAX << (32 - u32::from(n.min(32)))),
    }
}

fn parse_ipv4(field: &str, value: &str) -> Result<Ipv4Addr> {
    value
        .parse()
        .map_err(|_| Error::invalid_address(format!("{} '{}' is not an IPv4 address", field, value)))
}

fn parse_ipv6(field: &str, value: &str) -> Result<Ipv6Addr> {
    value
        .parse()
        .map_err(|_| Error::invalid_address(format!("{} '{}' is not an IPv6 address", field, value)))
}

impl AddressConfig {
    /// Allocate an empty configuration for the given families
    pub fn alloc(family: AddressFamily) -> Self {
        Self {
            family,
            active: Active::Empty,
            peer: None,
        }
    }

    /// Families this configuration accepts
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Family of the currently active address, if any
    pub fn active_family(&self) -> Option<AddressFamily> {
        self.active.family()
    }

    /// True when no family has been set
    pub fn is_empty(&self) -> bool {
        self.active == Active::Empty
    }

    /// Set the IPv4 address, netmask and gateway in one step
    ///
    /// A missing netmask means a host route (/32). Nothing is stored
    /// unless every field validates.
    pub fn set_ipv4(
        &mut self,
        address: &str,
        netmask: Option<&str>,
        gateway: Option<&str>,
    ) -> Result<()> {
        if !self.family.allows_ipv4() {
            return Err(Error::family_mismatch(self.family.as_str(), "ipv4"));
        }

        let address = parse_ipv4("address", address)?;
        let prefix_len = match netmask {
            Some(mask) => calc_netmask_len(mask).ok_or_else(|| Error::invalid_netmask(mask))?,
            None => 32,
        };
        let gateway = gateway.map(|gw| parse_ipv4("gateway", gw)).transpose()?;

        self.commit(Active::V4 {
            address,
            prefix_len,
            gateway,
        });
        Ok(())
    }

    /// Set the IPv6 address, prefix length and gateway in one step
    pub fn set_ipv6(
        &mut self,
        address: &str,
        prefix_len: u8,
        gateway: Option<&str>,
    ) -> Result<()> {
        if !self.family.allows_ipv6() {
            return Err(Error::family_mismatch(self.family.as_str(), "ipv6"));
        }

        let address = parse_ipv6("address", address)?;
        if prefix_len > 128 {
            return Err(Error::InvalidPrefixLength(prefix_len));
        }
        let gateway = gateway.map(|gw| parse_ipv6("gateway", gw)).transpose()?;

        self.commit(Active::V6 {
            address,
            prefix_len,
            gateway,
        });
        Ok(())
    }

    // Switching family drops a peer of the old family.
    fn commit(&mut self, active: Active) {
        if self.active.family() != active.family() {
            self.peer = None;
        }
        self.active = active;
    }

    /// Set the point-to-point peer of the active family
    pub fn set_peer(&mut self, address: &str) -> Result<()> {
        let active = self.active.family().ok_or(Error::NoAddressFamily)?;
        let peer: IpAddr = address
            .parse()
            .map_err(|_| Error::invalid_address(format!("peer '{}'", address)))?;

        let peer_family = AddressFamily::of(&peer);
        if peer_family != active {
            return Err(Error::family_mismatch(active.as_str(), peer_family.as_str()));
        }

        self.peer = Some(peer);
        Ok(())
    }

    /// Replace the gateway of the active family
    pub fn set_gateway(&mut self, gateway: &str) -> Result<()> {
        match &mut self.active {
            Active::Empty => Err(Error::NoAddressFamily),
            Active::V4 { gateway: gw, .. } => {
                *gw = Some(parse_ipv4("gateway", gateway)?);
                Ok(())
            }
            Active::V6 { gateway: gw, .. } => {
                *gw = Some(parse_ipv6("gateway", gateway)?);
                Ok(())
            }
        }
    }

    /// Active address and prefix length, or `None` when empty
    pub fn get_ip(&self) -> Option<(IpAddr, u8)> {
        match self.active {
            Active::Empty => None,
            Active::V4 {
                address,
                prefix_len,
                ..
            } => Some((IpAddr::V4(address), prefix_len)),
            Active::V6 {
                address,
                prefix_len,
                ..
            } => Some((IpAddr::V6(address), prefix_len)),
        }
    }

    /// Gateway of the active family
    pub fn gateway(&self) -> Option<IpAddr> {
        match self.active {
            Active::Empty => None,
            Active::V4 { gateway, .. } => gateway.map(IpAddr::V4),
            Active::V6 { gateway, .. } => gateway.map(IpAddr::V6),
        }
    }

    /// Point-to-point peer
    pub fn peer(&self) -> Option<IpAddr> {
        self.peer
    }

    /// IPv4 netmask derived from the prefix length
    pub fn netmask(&self) -> Option<Ipv4Addr> {
        match self.active {
            Active::V4 { prefix_len, .. } => Some(prefix_to_netmask(prefix_len)),
            _ => None,
        }
    }

    /// IPv4 broadcast address; none for /31, /32 and IPv6
    pub fn broadcast(&self) -> Option<Ipv4Addr> {
        match self.active {
            Active::V4 {
                address,
                prefix_len,
                ..
            } if prefix_len < 31 => {
                let mask = u32::from(prefix_to_netmask(prefix_len));
                Some(Ipv4Addr::from(u32::from(address) | !mask))
            }
            _ => None,
        }
    }

    /// Reset to the empty state
    pub fn clear(&mut self) {
        self.active = Active::Empty;
        self.peer = None;
    }

    /// Copy the address fields of `source` into `self`
    ///
    /// Only addressing is copied; the allowed family of `self` stays.
    /// Fails without changes when `source` holds a family `self` does
    /// not accept.
    pub fn copy_address(&mut self, source: &AddressConfig) -> Result<()> {
        match source.active.family() {
            Some(AddressFamily::Ipv4) if !self.family.allows_ipv4() => {
                return Err(Error::family_mismatch(self.family.as_str(), "ipv4"));
            }
            Some(AddressFamily::Ipv6) if !self.family.allows_ipv6() => {
                return Err(Error::family_mismatch(self.family.as_str(), "ipv6"));
            }
            _ => {}
        }

        self.active = source.active.clone();
        self.peer = source.peer;
        Ok(())
    }

    /// Independent copy
    pub fn copy(&self) -> Self {
        self.clone()
    }
}

impl fmt::Display for AddressConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get_ip() {
            None => write!(f, "empty"),
            Some((addr, prefix_len)) => {
                write!(f, "{}/{}", addr, prefix_len)?;
                if let Some(peer) = self.peer {
                    write!(f, " peer {}", peer)?;
                }
                if let Some(gw) = self.gateway() {
                    write!(f, " via {}", gw)?;
                }
                Ok(())
            }
        }
    }
}
