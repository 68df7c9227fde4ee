//! Filtering of resolved addresses that must never enter a pbr set.
//!
//! AdGuard Home answers blocked queries with `0.0.0.0`/`::`, and rewrites or
//! split-horizon records can point at loopback or LAN hosts. Routing any of
//! those through a policy tunnel breaks local traffic.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// True if `ip` is a routable public address worth adding to a set.
pub fn is_valid_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_valid_v4(v4),
        IpAddr::V6(v6) => is_valid_v6(v6),
    }
}

fn is_valid_v4(ip: &Ipv4Addr) -> bool {
    !(ip.octets()[0] == 0
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_private())
}

fn is_valid_v6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_valid_v4(&v4);
    }

    let first = ip.segments()[0];
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_multicast()
        || (first & 0xffc0) == 0xfe80 // link-local fe80::/10
        || (first & 0xfe00) == 0xfc00) // unique-local fc00::/7
}
