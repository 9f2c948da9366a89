//! Local address enumeration used to pick the iSCSI portal.

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;

use super::error::Result;

/// IPv4 addresses of interfaces that are up and not loopback, in interface order.
pub fn get_local_ips() -> Result<Vec<String>> {
    let mut ips = Vec::new();
    for ifaddr in getifaddrs()? {
        if !ifaddr.flags.contains(InterfaceFlags::IFF_UP)
            || ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK)
        {
            continue;
        }
        if let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            let ip = sin.ip().to_string();
            if !ips.contains(&ip) {
                ips.push(ip);
            }
        }
    }
    Ok(ips)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_local_ips_exclude_loopback() {
        let ips = get_local_ips().unwrap();
        for ip in ips {
            let addr: Ipv4Addr = ip.parse().unwrap();
            assert!(!addr.is_loopback(), "{} should have been filtered", ip);
        }
    }
}
