// # Notifier Trait
//
// Defines the interface for feature plugins that react to service state
// changes (DNS updater, default-route selector, idle detector, proxy
// handler, ...).
//
// ## Usage
//
// ```rust,ignore
// use connd_core::{Notifier, NotifierRegistry, Service};
//
// struct DnsUpdater;
//
// impl Notifier for DnsUpdater {
//     fn name(&self) -> &str { "dns" }
//
//     fn default_changed(&self, service: Option<&dyn Service>) {
//         // rewrite resolv.conf for the new default service
//     }
// }
//
// registry.register(std::sync::Arc::new(DnsUpdater))?;
// ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque handle to a service owned by the service layer
///
/// The core never inspects a service beyond these accessors, which it
/// uses for bookkeeping and log fields.
pub trait Service: Send + Sync {
    /// Stable identifier (e.g. `wifi_0011223344_managed_psk`)
    fn identifier(&self) -> &str;

    /// Technology of the service
    fn service_type(&self) -> ServiceType;
}

/// Opaque handle to an IP configuration owned by the service layer
pub trait IpConfig: Send + Sync {
    /// Interface index the configuration applies to
    fn index(&self) -> u32;
}

/// Technology type of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Unknown,
    System,
    Ethernet,
    Wifi,
    Bluetooth,
    Cellular,
    Gps,
    Vpn,
    Gadget,
    P2p,
}

impl ServiceType {
    /// All variants, in declaration order
    pub const ALL: [ServiceType; 10] = [
        Self::Unknown,
        Self::System,
        Self::Ethernet,
        Self::Wifi,
        Self::Bluetooth,
        Self::Cellular,
        Self::Gps,
        Self::Vpn,
        Self::Gadget,
        Self::P2p,
    ];

    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::System => "system",
            Self::Ethernet => "ethernet",
            Self::Wifi => "wifi",
            Self::Bluetooth => "bluetooth",
            Self::Cellular => "cellular",
            Self::Gps => "gps",
            Self::Vpn => "vpn",
            Self::Gadget => "gadget",
            Self::P2p => "p2p",
        }
    }

    /// Whether connections of this type count towards global connectivity
    ///
    /// VPNs ride on top of another connection and are not counted.
    pub fn counts_for_connectivity(self) -> bool {
        !matches!(self, Self::Unknown | Self::System | Self::Gps | Self::Vpn)
    }

    pub(crate) fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = crate::Error;

    /// Unrecognised names map to [`ServiceType::Unknown`]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .unwrap_or(Self::Unknown))
    }
}

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Unknown,
    Idle,
    Association,
    Configuration,
    Ready,
    Online,
    Disconnect,
    Failure,
}

impl ServiceState {
    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Idle => "idle",
            Self::Association => "association",
            Self::Configuration => "configuration",
            Self::Ready => "ready",
            Self::Online => "online",
            Self::Disconnect => "disconnect",
            Self::Failure => "failure",
        }
    }

    /// True while a service is connecting or connected
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Association | Self::Configuration | Self::Ready | Self::Online
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "idle" => Ok(Self::Idle),
            "association" => Ok(Self::Association),
            "configuration" => Ok(Self::Configuration),
            "ready" => Ok(Self::Ready),
            "online" => Ok(Self::Online),
            "disconnect" => Ok(Self::Disconnect),
            "failure" => Ok(Self::Failure),
            other => Err(crate::Error::invalid_input(format!(
                "Unknown service state: {}",
                other
            ))),
        }
    }
}

/// Trait for notifier plugins
///
/// Every hook has an empty default, so an implementation only overrides
/// the events it cares about. Hooks are called synchronously on the
/// thread that triggered the event, in ascending
/// [`priority`](Notifier::priority) order with ties broken by
/// registration order. The same order is used for every event kind,
/// setup and teardown alike.
///
/// A hook that panics is isolated: the panic is logged and the
/// remaining notifiers still receive the event.
pub trait Notifier: Send + Sync {
    /// Unique name within a [`NotifierRegistry`](crate::NotifierRegistry)
    fn name(&self) -> &str;

    /// Lower values run first
    fn priority(&self) -> i32 {
        crate::traits::PRIORITY_DEFAULT
    }

    /// The default service changed (`None` when there is none)
    fn default_changed(&self, _service: Option<&dyn Service>) {}

    /// A service was added
    fn service_add(&self, _service: &dyn Service, _name: Option<&str>) {}

    /// A service was removed
    fn service_remove(&self, _service: &dyn Service) {}

    /// A technology was enabled or disabled
    fn service_enabled(&self, _service_type: ServiceType, _enabled: bool) {}

    /// Offline mode was toggled
    fn offline_mode(&self, _enabled: bool) {}

    /// Proxy settings of a service changed
    fn proxy_changed(&self, _service: &dyn Service) {}

    /// A service moved to a new state
    fn service_state_changed(&self, _service: &dyn Service, _state: ServiceState) {}

    /// An IP configuration of a service changed
    fn ipconfig_changed(&self, _service: &dyn Service, _ipconfig: &dyn IpConfig) {}

    /// The system became idle (`true`) or active (`false`)
    fn idle_state(&self, _idle: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_round_trip_names() {
        for t in ServiceType::ALL {
            assert_eq!(t.as_str().parse::<ServiceType>().unwrap(), t);
        }
        assert_eq!("token-ring".parse::<ServiceType>().unwrap(), ServiceType::Unknown);
    }

    #[test]
    fn test_connectivity_types() {
        assert!(ServiceType::Wifi.counts_for_connectivity());
        assert!(ServiceType::Ethernet.counts_for_connectivity());
        assert!(!ServiceType::Vpn.counts_for_connectivity());
        assert!(!ServiceType::System.counts_for_connectivity());
    }

    #[test]
    fn test_service_state_parse() {
        assert_eq!("ready".parse::<ServiceState>().unwrap(), ServiceState::Ready);
        assert!("bogus".parse::<ServiceState>().is_err());
        assert!(ServiceState::Configuration.is_active());
        assert!(!ServiceState::Failure.is_active());
    }
}
