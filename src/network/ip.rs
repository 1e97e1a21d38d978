//! Address pool for concurrently running one-shot jails
//!
//! Hands out distinct IPv4 host addresses from a subnet. The gateway is
//! never handed out.

use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// IPv4 address pool for a network
#[derive(Debug, Clone)]
pub struct IpPool {
    /// Network subnet
    subnet: Ipv4Net,
    /// Gateway address
    gateway: Ipv4Addr,
    /// Set of allocated addresses
    allocated: HashSet<Ipv4Addr>,
}

impl IpPool {
    /// Create a new pool with a specific gateway
    pub fn with_gateway(subnet: Ipv4Net, gateway: Ipv4Addr) -> Result<Self> {
        if !subnet.contains(&gateway) {
            return Err(Error::Network(format!(
                "Gateway {} is not in subnet {}",
                gateway, subnet
            )));
        }

        let mut allocated = HashSet::new();
        allocated.insert(gateway);

        Ok(Self {
            subnet,
            gateway,
            allocated,
        })
    }

    /// Subnet prefix length, for building CIDR strings
    pub fn prefix_len(&self) -> u8 {
        self.subnet.prefix_len()
    }

    /// Allocate the next available address
    pub fn allocate(&mut self) -> Result<Ipv4Addr> {
        // hosts() skips the network and broadcast addresses
        for addr in self.subnet.hosts() {
            if self.allocated.insert(addr) {
                return Ok(addr);
            }
        }

        Err(Error::Network(format!(
            "No available addresses in {}",
            self.subnet
        )))
    }

    /// Release an allocated address
    pub fn release(&mut self, addr: &Ipv4Addr) {
        // Don't release the gateway
        if *addr != self.gateway {
            self.allocated.remove(addr);
        }
    }

    #[cfg(test)]
    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(subnet: &str, gateway: &str) -> IpPool {
        IpPool::with_gateway(subnet.parse().unwrap(), gateway.parse().unwrap()).unwrap()
    }

    #[test]
    fn test_allocation_skips_gateway() {
        let mut pool = pool("10.0.1.0/24", "10.0.1.1");

        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 0, 1, 2));
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 0, 1, 3));
        assert_eq!(pool.prefix_len(), 24);
    }

    #[test]
    fn test_release_makes_address_reusable() {
        let mut pool = pool("10.0.1.0/24", "10.0.1.1");

        let ip = pool.allocate().unwrap();
        assert_eq!(pool.allocated_count(), 2);

        pool.release(&ip);
        assert_eq!(pool.allocated_count(), 1);
        assert_eq!(pool.allocate().unwrap(), ip);
    }

    #[test]
    fn test_gateway_never_released() {
        let mut pool = pool("10.0.1.0/24", "10.0.1.1");
        pool.release(&Ipv4Addr::new(10, 0, 1, 1));
        assert_eq!(pool.allocated_count(), 1);
    }

    #[test]
    fn test_exhaustion() {
        // /30 has two hosts, one is the gateway
        let mut pool = pool("10.0.1.0/30", "10.0.1.1");
        assert!(pool.allocate().is_ok());
        assert!(matches!(pool.allocate(), Err(Error::Network(_))));
    }

    #[test]
    fn test_gateway_outside_subnet() {
        let result = IpPool::with_gateway(
            "10.0.1.0/24".parse().unwrap(),
            "10.0.2.1".parse().unwrap(),
        );
        assert!(result.is_err());
    }
}
