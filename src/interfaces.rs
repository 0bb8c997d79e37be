//! Local interface addresses, used to seed a client's candidate endpoints.

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use std::io::Result;
use std::net::IpAddr;

/// Addresses of all interfaces that are up.
///
/// IPv6 link-local addresses (fe80::/10) are skipped, they are useless without a scope id.
pub fn local_addresses() -> Result<Vec<IpAddr>> {
    let mut addrs = Vec::new();

    for ifaddr in getifaddrs()? {
        if !ifaddr.flags.contains(InterfaceFlags::IFF_UP) {
            continue;
        }

        let Some(address) = ifaddr.address else {
            continue;
        };

        let ip = if let Some(v4) = address.as_sockaddr_in() {
            IpAddr::V4(v4.ip())
        } else if let Some(v6) = address.as_sockaddr_in6() {
            IpAddr::V6(v6.ip())
        } else {
            continue;
        };

        if is_link_local(&ip) {
            log::trace!("skipping link-local {} on {}", ip, ifaddr.interface_name);
            continue;
        }

        if !addrs.contains(&ip) {
            addrs.push(ip);
        }
    }

    Ok(addrs)
}

fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V6(v6) => v6.segments()[0] & 0xffc0 == 0xfe80,
        IpAddr::V4(_) => false,
    }
}
