//! The KV registry abstraction (component D) and its etcd-backed implementation.
//!
//! Ported from `original_source/pkg/etcdmanager/config.go` (the domain types)
//! and `.../etcdv2/registry.go` (the interface shape), re-targeted at etcd v3
//! the way `examples/other_examples/.../network-registry.rs` targets it for a
//! flannel-style subnet store.

pub mod etcd;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One logical SDN's immutable configuration. Never written by this daemon;
/// an operator seeds it before any node or master starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNetwork {
    pub name: String,
    pub network: String,
    pub host_subnet_length: u8,
    pub service_network: String,
    pub plugin_name: String,
}

impl std::fmt::Display for ClusterNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "network: {:?}, hostSubnetBits: {}, serviceNetwork: {:?}, pluginName: {:?}",
            self.network, self.host_subnet_length, self.service_network, self.plugin_name
        )
    }
}

/// The pod CIDR assigned to one node, keyed by `node_ip`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSubnet {
    pub host: String,
    pub node_ip: String,
    pub subnet: String,
    pub assign: bool,
}

impl HostSubnet {
    pub fn key(&self) -> &str {
        &self.node_ip
    }
}

impl std::fmt::Display for HostSubnet {
    // The original `hostSubnetToString` passed three arguments to a
    // two-verb format string, silently dropping `Subnet`. All three fields
    // are emitted here, correctly labeled.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "host: {:?}, nodeIP: {:?}, subnet: {:?}",
            self.host, self.node_ip, self.subnet
        )
    }
}

/// A pending or completed mutation on a `NetNamespace`'s VNID, per the
/// write-then-clear protocol (§4.G): a non-empty `Action` requests a
/// transition, the master performs it and writes the entry back with
/// `Action` cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub enum NetNamespaceAction {
    #[default]
    None,
    Global,
    Join,
    Isolate,
}

/// The registry entry mapping a cluster namespace to its VNID plus a
/// pending action, keyed by `net_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetNamespace {
    pub net_name: String,
    pub net_id: u32,
    #[serde(default)]
    pub action: NetNamespaceAction,
    /// Peer namespace name, meaningful only when `action == Join`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

impl NetNamespace {
    pub fn key(&self) -> &str {
        &self.net_name
    }
}

/// Implemented by every registry value so the generic Watcher diff
/// algorithm (component E) can key snapshots without a kind-specific match.
pub trait Keyed {
    fn registry_key(&self) -> String;
}

impl Keyed for HostSubnet {
    fn registry_key(&self) -> String {
        self.key().to_string()
    }
}

impl Keyed for NetNamespace {
    fn registry_key(&self) -> String {
        self.key().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Added,
    Removed,
}

/// A single registry change, upsert-or-delete semantics per §9 ("Idempotent
/// upsert events"): `Added` must be treated by every handler as "this is
/// the current value", never as "first time seen".
#[derive(Debug, Clone)]
pub struct Event<T> {
    pub event_type: EventType,
    pub key: String,
    pub value: Option<T>,
    /// The registry index as of this event, used by the Watcher to advance
    /// its cursor.
    pub index: i64,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("key already exists")]
    AlreadyExists,
    #[error("stale write: registry entry changed since it was read")]
    StaleWrite,
    #[error("key not found")]
    NotFound,
    #[error("network config not found; an operator must seed it before the daemon starts")]
    ConfigNotFound,
    /// Surfaced by a watch stream when the requested index has fallen out of
    /// the store's retained history. The Watcher (component E) recovers by
    /// calling `list()` and diffing against its last snapshot.
    #[error("requested watch index is older than the store's retained history")]
    IndexTooOld,
    #[error("operation canceled")]
    Canceled,
    #[error(transparent)]
    Etcd(#[from] etcd_client::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type RegistryWatchStream<T> =
    std::pin::Pin<Box<dyn Stream<Item = Result<Event<T>, RegistryError>> + Send>>;

/// A polymorphic interface over an ordered, index-versioned KV store (§4.D).
/// Backed by etcd in production (see [`etcd::EtcdRegistry`]); a plain
/// in-memory `MockRegistry` implementing the same trait is used by
/// Watcher/MasterSubnet/MasterVnid unit tests.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn get_network_config(&self, network: &str) -> Result<ClusterNetwork, RegistryError>;

    /// Single-key read with its mod-revision, used by callers (MasterSubnet,
    /// MasterVnid) that need a correct `expected_index` for a later
    /// `update_*` call rather than the snapshot-wide index `list()` returns.
    async fn get_host_subnet(&self, network: &str, node_ip: &str) -> Result<(HostSubnet, i64), RegistryError>;
    async fn list_host_subnets(&self, network: &str) -> Result<(Vec<HostSubnet>, i64), RegistryError>;
    async fn create_host_subnet(
        &self,
        network: &str,
        subnet: &HostSubnet,
    ) -> Result<i64, RegistryError>;
    async fn update_host_subnet(
        &self,
        network: &str,
        subnet: &HostSubnet,
        expected_index: i64,
    ) -> Result<i64, RegistryError>;
    async fn delete_host_subnet(&self, network: &str, node_ip: &str) -> Result<(), RegistryError>;
    async fn watch_host_subnets(
        &self,
        network: &str,
        after_index: i64,
    ) -> Result<RegistryWatchStream<HostSubnet>, RegistryError>;

    async fn get_net_namespace(&self, network: &str, net_name: &str) -> Result<(NetNamespace, i64), RegistryError>;
    async fn list_net_namespaces(
        &self,
        network: &str,
    ) -> Result<(Vec<NetNamespace>, i64), RegistryError>;
    async fn create_net_namespace(
        &self,
        network: &str,
        ns: &NetNamespace,
    ) -> Result<i64, RegistryError>;
    async fn update_net_namespace(
        &self,
        network: &str,
        ns: &NetNamespace,
        expected_index: i64,
    ) -> Result<i64, RegistryError>;
    async fn delete_net_namespace(&self, network: &str, net_name: &str) -> Result<(), RegistryError>;
    async fn watch_net_namespaces(
        &self,
        network: &str,
        after_index: i64,
    ) -> Result<RegistryWatchStream<NetNamespace>, RegistryError>;
}

#[cfg(test)]
pub mod mock;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_subnet_display_includes_all_three_fields() {
        let hs = HostSubnet {
            host: "n1".to_string(),
            node_ip: "10.0.0.11".to_string(),
            subnet: "10.1.0.0/24".to_string(),
            assign: false,
        };
        let s = hs.to_string();
        assert!(s.contains("n1"));
        assert!(s.contains("10.0.0.11"));
        assert!(s.contains("10.1.0.0/24"));
    }
}
