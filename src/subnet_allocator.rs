//! Deterministic-cursor pod-subnet allocator (component B).
//!
//! Grounded on `original_source/ksdn/subnets.go`'s use of `snalloc.SubnetAllocator`
//! (`NewSubnetAllocator(clusterNetwork, hostSubnetLength, subrange)`,
//! `GetNetwork()`/`ReleaseNetwork()`); the allocator's own source wasn't
//! retrieved, so the enumeration strategy here is authored directly from
//! §4.B's description using `ipnetwork` for CIDR math.

use std::collections::HashSet;

use ipnetwork::{IpNetwork, Ipv4Network};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubnetAllocatorError {
    #[error("cluster network must be IPv4")]
    NotIpv4,
    #[error("host subnet length {0} does not fit cluster network prefix {1}")]
    BadHostSubnetLength(u8, u8),
    #[error("no subnets left in {0}")]
    NoSubnetsLeft(IpNetwork),
}

/// Enumerates fixed-stride subnets of `cluster_network` with prefix
/// `cluster_network.prefix() + host_subnet_bits`, handing them out starting
/// from a deterministic internal cursor and wrapping modulo the space.
pub struct SubnetAllocator {
    base: Ipv4Network,
    subnet_prefix: u8,
    total: u64,
    cursor: u64,
    allocated: HashSet<Ipv4Network>,
}

impl SubnetAllocator {
    /// `preallocated` seeds the allocated set directly (crash-recovery
    /// contract: subnets already handed out before a restart must not be
    /// re-issued).
    pub fn new(
        cluster_network: IpNetwork,
        host_subnet_bits: u8,
        preallocated: impl IntoIterator<Item = Ipv4Network>,
    ) -> Result<Self, SubnetAllocatorError> {
        let IpNetwork::V4(base) = cluster_network else {
            return Err(SubnetAllocatorError::NotIpv4);
        };
        let subnet_prefix = base.prefix() + host_subnet_bits;
        if subnet_prefix > 32 {
            return Err(SubnetAllocatorError::BadHostSubnetLength(
                host_subnet_bits,
                base.prefix(),
            ));
        }
        let total = 1u64 << (subnet_prefix - base.prefix());

        Ok(Self {
            base,
            subnet_prefix,
            total,
            cursor: 0,
            allocated: preallocated.into_iter().collect(),
        })
    }

    fn nth(&self, n: u64) -> Ipv4Network {
        let host_bits = 32 - self.subnet_prefix;
        let stride: u32 = if host_bits >= 32 { 0 } else { 1u32 << host_bits };
        let base_addr = u32::from(self.base.network());
        let addr = base_addr.wrapping_add((n as u32).wrapping_mul(stride));
        Ipv4Network::new(addr.into(), self.subnet_prefix).expect("computed subnet is valid")
    }

    /// Returns the next subnet not already in the allocated set, advancing
    /// the cursor modulo the space; fails with `NoSubnetsLeft` once every
    /// slot has been tried.
    pub fn get_network(&mut self) -> Result<Ipv4Network, SubnetAllocatorError> {
        for _ in 0..self.total {
            let candidate = self.nth(self.cursor);
            self.cursor = (self.cursor + 1) % self.total;
            if self.allocated.insert(candidate) {
                return Ok(candidate);
            }
        }
        Err(SubnetAllocatorError::NoSubnetsLeft(IpNetwork::V4(self.base)))
    }

    /// Removes `subnet` from the allocated set. Unknown subnets are no-ops.
    pub fn release_network(&mut self, subnet: Ipv4Network) {
        self.allocated.remove(&subnet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> IpNetwork {
        "10.1.0.0/16".parse().unwrap()
    }

    #[test]
    fn allocates_distinct_subnets() {
        let mut alloc = SubnetAllocator::new(cluster(), 8, []).unwrap();
        let a = alloc.get_network().unwrap();
        let b = alloc.get_network().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.prefix(), 24);
    }

    #[test]
    fn preallocated_subnets_are_excluded() {
        let pre: Ipv4Network = "10.1.0.0/24".parse().unwrap();
        let mut alloc = SubnetAllocator::new(cluster(), 8, [pre]).unwrap();
        for _ in 0..5 {
            assert_ne!(alloc.get_network().unwrap(), pre);
        }
    }

    #[test]
    fn release_allows_reallocation() {
        let mut alloc = SubnetAllocator::new(cluster(), 8, []).unwrap();
        let a = alloc.get_network().unwrap();
        alloc.release_network(a);
        // Exhaust the rest of the tiny space to force the cursor back to `a`.
        let total = 1u64 << 8;
        let mut seen = vec![a];
        for _ in 0..total - 1 {
            seen.push(alloc.get_network().unwrap());
        }
        assert!(seen.contains(&a));
    }

    #[test]
    fn releasing_unknown_subnet_is_a_noop() {
        let mut alloc = SubnetAllocator::new(cluster(), 8, []).unwrap();
        let unrelated: Ipv4Network = "192.168.1.0/24".parse().unwrap();
        alloc.release_network(unrelated);
    }

    #[test]
    fn exhausts_when_every_slot_allocated() {
        // A /24 cluster split into /24 host subnets has exactly one slot.
        let tiny: IpNetwork = "10.9.0.0/24".parse().unwrap();
        let mut alloc = SubnetAllocator::new(tiny, 0, []).unwrap();
        alloc.get_network().unwrap();
        assert_eq!(
            alloc.get_network(),
            Err(SubnetAllocatorError::NoSubnetsLeft(tiny))
        );
    }
}
