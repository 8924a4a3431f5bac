//! Enumeration of the host's directly attached networks.

use std::net::{IpAddr, Ipv4Addr};

use crate::error::Result;

/// An IPv4 network attached to a local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNetwork {
    pub name: String,
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl LocalNetwork {
    /// Whether `ip` lies in this network. IPv6 addresses never match.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => {
                let mask = u32::from(self.netmask);
                u32::from(*v4) & mask == u32::from(self.addr) & mask
            }
            IpAddr::V6(_) => false,
        }
    }
}

/// IPv4 networks of every interface that has a netmask.
#[cfg(unix)]
pub fn local_networks() -> Result<Vec<LocalNetwork>> {
    use std::net::SocketAddrV4;

    let addrs = nix::ifaddrs::getifaddrs().map_err(std::io::Error::from)?;
    let networks = addrs
        .filter_map(|ifa| {
            let addr = ifa.address.as_ref()?.as_sockaddr_in().copied()?;
            let netmask = ifa.netmask.as_ref()?.as_sockaddr_in().copied()?;
            Some(LocalNetwork {
                name: ifa.interface_name.clone(),
                addr: *SocketAddrV4::from(addr).ip(),
                netmask: *SocketAddrV4::from(netmask).ip(),
            })
        })
        .collect();
    Ok(networks)
}

#[cfg(not(unix))]
pub fn local_networks() -> Result<Vec<LocalNetwork>> {
    Ok(Vec::new())
}
