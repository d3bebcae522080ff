//! Contract Test: Address Records
//!
//! Constraints verified:
//! - Netmask length is a pure function of its input
//! - A record only ever holds one family, and only one it allows
//! - A rejected update leaves the record unchanged
//! - Copies are independent of their source

use connd_core::{AddressConfig, AddressFamily, Error, calc_netmask_len};
use std::net::{IpAddr, Ipv4Addr};
use tokio_test::{assert_err, assert_ok};

#[test]
fn netmask_lengths() {
    let cases = [
        ("255.255.255.255", Some(32)),
        ("255.255.255.0", Some(24)),
        ("255.255.128.0", Some(17)),
        ("255.0.0.0", Some(8)),
        ("0.0.0.0", Some(0)),
        ("255.255.0.255", None),
        ("0.255.255.255", None),
        ("255.255.255", None),
        ("not-a-mask", None),
        ("", None),
    ];

    for (mask, expected) in cases {
        assert_eq!(calc_netmask_len(mask), expected, "mask {:?}", mask);
        // same input, same answer
        assert_eq!(calc_netmask_len(mask), expected);
    }
}

#[test]
fn ipv4_record_derives_netmask_and_broadcast() {
    let mut config = AddressConfig::alloc(AddressFamily::Ipv4);
    assert!(config.is_empty());
    assert_eq!(config.get_ip(), None);

    config
        .set_ipv4("192.168.1.20", Some("255.255.255.0"), Some("192.168.1.1"))
        .unwrap();

    assert_eq!(
        config.get_ip(),
        Some((IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)), 24))
    );
    assert_eq!(config.netmask(), Some(Ipv4Addr::new(255, 255, 255, 0)));
    assert_eq!(config.broadcast(), Some(Ipv4Addr::new(192, 168, 1, 255)));
    assert_eq!(config.gateway(), Some(IpAddr::from([192, 168, 1, 1])));
    assert_eq!(config.to_string(), "192.168.1.20/24 via 192.168.1.1");
}

#[test]
fn missing_netmask_is_a_host_route() {
    let mut config = AddressConfig::alloc(AddressFamily::Ipv4);
    assert_ok!(config.set_ipv4("10.0.0.5", None, None));
    assert_eq!(config.get_ip().map(|(_, len)| len), Some(32));
    assert_eq!(config.broadcast(), None);
}

#[test]
fn rejected_update_leaves_record_unchanged() {
    let mut config = AddressConfig::alloc(AddressFamily::Ipv4);
    config
        .set_ipv4("192.168.1.20", Some("255.255.255.0"), None)
        .unwrap();
    let before = config.copy();

    let err = config
        .set_ipv4("192.168.1.30", Some("255.0.255.0"), None)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidNetmask(_)));
    assert_eq!(config, before);

    let err = config.set_ipv4("192.168.1.300", None, None).unwrap_err();
    assert!(matches!(err, Error::InvalidAddress(_)));
    assert_eq!(config, before);

    let err = config
        .set_ipv4("192.168.1.30", None, Some("fe80::1"))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidAddress(_)));
    assert_eq!(config, before);
}

#[test]
fn family_restrictions_are_enforced() {
    let mut v4_only = AddressConfig::alloc(AddressFamily::Ipv4);
    let err = v4_only.set_ipv6("2001:db8::1", 64, None).unwrap_err();
    assert!(matches!(err, Error::FamilyMismatch { .. }));
    assert!(v4_only.is_empty());

    let mut v6_only = AddressConfig::alloc(AddressFamily::Ipv6);
    assert_err!(v6_only.set_ipv4("10.0.0.1", None, None));
    assert!(matches!(
        v6_only.set_ipv6("2001:db8::1", 129, None),
        Err(Error::InvalidPrefixLength(129))
    ));
    v6_only.set_ipv6("2001:db8::1", 64, Some("fe80::1")).unwrap();
    assert_eq!(v6_only.active_family(), Some(AddressFamily::Ipv6));
    assert_eq!(v6_only.netmask(), None);
}

#[test]
fn dual_record_holds_one_family_at_a_time() {
    let mut config = AddressConfig::alloc(AddressFamily::Dual);
    config.set_ipv4("10.0.0.2", Some("255.255.255.252"), None).unwrap();
    config.set_peer("10.0.0.1").unwrap();
    assert_eq!(config.peer(), Some(IpAddr::from([10, 0, 0, 1])));

    // switching family drops the IPv4 peer
    config.set_ipv6("2001:db8::2", 64, None).unwrap();
    assert_eq!(config.active_family(), Some(AddressFamily::Ipv6));
    assert_eq!(config.peer(), None);
    assert_eq!(config.netmask(), None);
}

#[test]
fn peer_and_gateway_need_an_active_family() {
    let mut config = AddressConfig::alloc(AddressFamily::Dual);
    assert!(matches!(config.set_peer("10.0.0.1"), Err(Error::NoAddressFamily)));
    assert!(matches!(
        config.set_gateway("10.0.0.1"),
        Err(Error::NoAddressFamily)
    ));

    config.set_ipv4("10.0.0.2", None, None).unwrap();
    assert!(matches!(
        config.set_peer("fe80::1"),
        Err(Error::FamilyMismatch { .. })
    ));
    assert_ok!(config.set_gateway("10.0.0.254"));
    assert_eq!(config.gateway(), Some(IpAddr::from([10, 0, 0, 254])));
}

#[test]
fn copies_are_independent() {
    let mut source = AddressConfig::alloc(AddressFamily::Ipv4);
    source
        .set_ipv4("172.16.0.10", Some("255.255.0.0"), Some("172.16.0.1"))
        .unwrap();

    let copy = source.copy();
    source.clear();
    assert!(source.is_empty());
    assert_eq!(
        copy.get_ip(),
        Some((IpAddr::from([172, 16, 0, 10]), 16))
    );

    let mut target = AddressConfig::alloc(AddressFamily::Dual);
    target.copy_address(&copy).unwrap();
    assert_eq!(target.get_ip(), copy.get_ip());
    assert_eq!(target.gateway(), copy.gateway());
    assert_eq!(target.family(), AddressFamily::Dual);

    let mut v6_only = AddressConfig::alloc(AddressFamily::Ipv6);
    assert_err!(v6_only.copy_address(&copy));
    assert!(v6_only.is_empty());
}
