//! Interface address lookup used for bootstrap diagnostics.
use std::net::Ipv4Addr;
use std::net::SocketAddrV4;

use anyhow::Context as _;
use nix::ifaddrs::getifaddrs;

use crate::error::Result;

/// Returns the first IPv4 address assigned to `interface`, if any.
pub fn interface_ipv4_address(interface: &str) -> Result<Option<Ipv4Addr>> {
    let addresses = getifaddrs().context("failed to list interface addresses")?;
    for entry in addresses {
        if entry.interface_name != interface {
            continue;
        }
        let Some(sin) = entry.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
            continue;
        };
        return Ok(Some(*SocketAddrV4::from(*sin).ip()));
    }
    Ok(None)
}

/// The address as a host-order integer, e.g. `10.0.0.1` -> `0x0a000001`.
pub fn ipv4_to_u32(address: Ipv4Addr) -> u32 {
    u32::from(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_interface() {
        // Every Linux host has `lo`; containers may still lack an IPv4 on it.
        if let Some(address) = interface_ipv4_address("lo").unwrap() {
            assert!(address.is_loopback());
        }
    }

    #[test]
    fn test_missing_interface() {
        assert_eq!(
            interface_ipv4_address("no_such_interface0").unwrap(),
            None
        );
    }

    #[test]
    fn test_ipv4_to_u32() {
        assert_eq!(ipv4_to_u32(Ipv4Addr::new(10, 0, 0, 1)), 0x0a000001);
    }
}
