//! Cluster/service CIDR parsing and node IP validation.
//!
//! Ported from the original `ksdn.NetworkInfo` / `validateNodeIP`: the node's
//! own IP must never fall inside either CIDR, or traffic destined for a pod
//! or service could be routed back to the node itself (rhbz#1295486).

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use thiserror::Error;

use crate::registry::ClusterNetwork;

#[derive(Debug, Error)]
pub enum NetworkInfoError {
    #[error("failed to parse cluster network CIDR {0:?}: {1}")]
    BadClusterCidr(String, ipnetwork::IpNetworkError),
    #[error("failed to parse service network CIDR {0:?}: {1}")]
    BadServiceCidr(String, ipnetwork::IpNetworkError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidNodeIp {
    #[error("invalid node IP {0:?}")]
    Empty(String),
    #[error("failed to parse node IP {0:?}")]
    Unparseable(String),
    #[error("node IP {0} conflicts with cluster network {1}")]
    InClusterNetwork(IpAddr, IpNetwork),
    #[error("node IP {0} conflicts with service network {1}")]
    InServiceNetwork(IpAddr, IpNetwork),
}

/// Parsed, validated cluster/service CIDRs for one logical SDN.
#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub cluster_network: IpNetwork,
    pub service_network: IpNetwork,
    pub name: String,
}

impl NetworkInfo {
    pub fn parse(config: &ClusterNetwork) -> Result<Self, NetworkInfoError> {
        let cluster_network: IpNetwork = config
            .network
            .parse()
            .map_err(|e| NetworkInfoError::BadClusterCidr(config.network.clone(), e))?;
        let service_network: IpNetwork = config
            .service_network
            .parse()
            .map_err(|e| NetworkInfoError::BadServiceCidr(config.service_network.clone(), e))?;

        Ok(Self {
            cluster_network,
            service_network,
            name: config.name.clone(),
        })
    }

    /// Fails when `node_ip` is empty, loopback, unparseable, or contained in
    /// either the cluster or service network.
    pub fn validate_node_ip(&self, node_ip: &str) -> Result<IpAddr, InvalidNodeIp> {
        if node_ip.is_empty() || node_ip == "127.0.0.1" {
            return Err(InvalidNodeIp::Empty(node_ip.to_string()));
        }

        let addr: IpAddr = node_ip
            .parse()
            .map_err(|_| InvalidNodeIp::Unparseable(node_ip.to_string()))?;

        if self.cluster_network.contains(addr) {
            return Err(InvalidNodeIp::InClusterNetwork(addr, self.cluster_network));
        }
        if self.service_network.contains(addr) {
            return Err(InvalidNodeIp::InServiceNetwork(addr, self.service_network));
        }

        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClusterNetwork {
        ClusterNetwork {
            name: "default".to_string(),
            network: "10.1.0.0/16".to_string(),
            host_subnet_length: 8,
            service_network: "172.30.0.0/16".to_string(),
            plugin_name: "k8s-ovs-subnet".to_string(),
        }
    }

    #[test]
    fn parses_valid_cidrs() {
        let info = NetworkInfo::parse(&config()).unwrap();
        assert_eq!(info.cluster_network.prefix(), 16);
        assert_eq!(info.service_network.prefix(), 16);
    }

    #[test]
    fn rejects_bad_cluster_cidr() {
        let mut c = config();
        c.network = "not-a-cidr".to_string();
        assert!(matches!(
            NetworkInfo::parse(&c),
            Err(NetworkInfoError::BadClusterCidr(_, _))
        ));
    }

    #[test]
    fn rejects_empty_node_ip() {
        let info = NetworkInfo::parse(&config()).unwrap();
        assert_eq!(
            info.validate_node_ip(""),
            Err(InvalidNodeIp::Empty(String::new()))
        );
    }

    #[test]
    fn rejects_loopback_node_ip() {
        let info = NetworkInfo::parse(&config()).unwrap();
        assert_eq!(
            info.validate_node_ip("127.0.0.1"),
            Err(InvalidNodeIp::Empty("127.0.0.1".to_string()))
        );
    }

    #[test]
    fn rejects_unparseable_node_ip() {
        let info = NetworkInfo::parse(&config()).unwrap();
        assert!(matches!(
            info.validate_node_ip("not-an-ip"),
            Err(InvalidNodeIp::Unparseable(_))
        ));
    }

    #[test]
    fn rejects_node_ip_in_cluster_network() {
        let info = NetworkInfo::parse(&config()).unwrap();
        assert!(matches!(
            info.validate_node_ip("10.1.5.5"),
            Err(InvalidNodeIp::InClusterNetwork(_, _))
        ));
    }

    #[test]
    fn rejects_node_ip_in_service_network() {
        let info = NetworkInfo::parse(&config()).unwrap();
        assert!(matches!(
            info.validate_node_ip("172.30.1.1"),
            Err(InvalidNodeIp::InServiceNetwork(_, _))
        ));
    }

    #[test]
    fn accepts_valid_node_ip() {
        let info = NetworkInfo::parse(&config()).unwrap();
        assert!(info.validate_node_ip("10.0.0.11").is_ok());
    }
}
