//! Producer line parsing

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Pull an endpoint out of one producer line.
///
/// Accepted shapes, tried in order: bare address, `a.b.c.d:port`, and
/// `[v6]:port`. A bare address gets `default_port`. Anything else, or an
/// address that is not a routable host, yields `None`.
pub fn extract_endpoint(line: &str, default_port: u16) -> Option<(IpAddr, u16)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let (ip, port) = if let Ok(ip) = line.parse::<IpAddr>() {
        (ip, default_port)
    } else if let Some(rest) = line.strip_prefix('[') {
        let (host, port) = rest.split_once("]:")?;
        (IpAddr::V6(host.parse::<Ipv6Addr>().ok()?), parse_port(port)?)
    } else {
        // Unbracketed v6 with a port is ambiguous, so only v4 hosts qualify here
        let (host, port) = line.rsplit_once(':')?;
        (IpAddr::V4(host.parse::<Ipv4Addr>().ok()?), parse_port(port)?)
    };

    if port == 0 || !is_host_address(&ip) {
        return None;
    }
    Some((ip, port))
}

fn parse_port(s: &str) -> Option<u16> {
    // u16::from_str accepts a leading '+'
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn is_host_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !(v4.is_unspecified() || v4.is_broadcast() || v4.is_multicast()),
        IpAddr::V6(v6) => !(v6.is_unspecified() || v6.is_multicast()),
    }
}
