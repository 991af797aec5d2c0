//! Cluster-orchestrator Node watcher; allocates/revokes HostSubnets
//! (component F).
//!
//! Direct port of `original_source/ksdn/subnets.go`'s `SubnetStartMaster`,
//! `addNode`, `deleteNode`, `watchNodes`, `masterHandleSubnetEvent`, adapted
//! to this crate's `Orchestrator`/`Registry`/`Watcher` abstractions. Per
//! DESIGN.md's open-question decision, `deleteNode` takes `node_ip`
//! throughout — the HostSubnet key — never a node name.
//!
//! Simplification versus the literal "rewrite with new Host/Assign" wording
//! in §4.F: this reimplementation performs a rewrite as delete-then-create
//! rather than a CAS `update`, because our `Registry::update_*` requires a
//! correct per-key `expected_index` and a rewrite only happens for entries
//! this master did not necessarily just write itself (e.g. after a restart).
//! Delete-then-create needs no expected_index and is exactly the strategy
//! already specified for the `Assign=true` reclaim case, so both branches
//! now share one code path.

use std::collections::HashMap;
use std::sync::Arc;

use ipnetwork::Ipv4Network;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::network_info::NetworkInfo;
use crate::orchestrator::{NodeInfo, ObjectEvent, Orchestrator};
use crate::registry::{HostSubnet, Registry, RegistryError};
use crate::subnet_allocator::SubnetAllocator;
use crate::watcher::{watch_stream, HostSubnetSource};

pub struct MasterSubnet {
    registry: Arc<dyn Registry>,
    network: String,
    network_info: NetworkInfo,
    allocator: Mutex<SubnetAllocator>,
    known: Mutex<HashMap<String, HostSubnet>>,
}

impl MasterSubnet {
    /// Lists existing HostSubnets, seeds the allocator's reserved set, and
    /// validates each entry's NodeIP (log-and-continue: an invalid IP means
    /// the Node is likely unhealthy, not that the entry should be deleted).
    pub async fn new(
        registry: Arc<dyn Registry>,
        network: String,
        network_info: NetworkInfo,
        host_subnet_bits: u8,
    ) -> Result<Self, RegistryError> {
        let (existing, _index) = registry.list_host_subnets(&network).await?;

        let mut preallocated = Vec::new();
        let mut known = HashMap::new();
        for hs in existing {
            if let Err(e) = network_info.validate_node_ip(&hs.node_ip) {
                warn!("existing HostSubnet {} has invalid NodeIP: {e}", hs.host);
            }
            if let Ok(subnet) = hs.subnet.parse::<Ipv4Network>() {
                preallocated.push(subnet);
            }
            known.insert(hs.node_ip.clone(), hs);
        }

        let allocator = SubnetAllocator::new(
            network_info.cluster_network,
            host_subnet_bits,
            preallocated,
        )
        .map_err(|e| RegistryError::Other(anyhow::anyhow!(e)))?;

        Ok(Self {
            registry,
            network,
            network_info,
            allocator: Mutex::new(allocator),
            known: Mutex::new(known),
        })
    }

    /// Spawns the two concurrent loops described in §4.F and runs until
    /// `cancel` fires.
    pub fn run(self: Arc<Self>, orchestrator: Arc<Orchestrator>, cancel: CancellationToken) {
        let this = Arc::clone(&self);
        let node_cancel = cancel.clone();
        tokio::spawn(async move {
            this.run_node_watcher(orchestrator, node_cancel).await;
        });

        let this = Arc::clone(&self);
        tokio::spawn(async move {
            this.run_subnet_registry_watcher(cancel).await;
        });
    }

    async fn run_node_watcher(&self, orchestrator: Arc<Orchestrator>, cancel: CancellationToken) {
        use futures::StreamExt;

        let mut stream = orchestrator.watch_nodes(cancel.clone());
        let mut seen_ips: HashMap<String, std::net::IpAddr> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                next = stream.next() => {
                    let Some(event) = next else { return };
                    match event {
                        ObjectEvent::Upsert(node) => self.handle_node_upsert(node, &mut seen_ips).await,
                        ObjectEvent::Deleted(node) => self.handle_node_deleted(node, &mut seen_ips).await,
                    }
                }
            }
        }
    }

    async fn handle_node_upsert(&self, node: NodeInfo, seen_ips: &mut HashMap<String, std::net::IpAddr>) {
        let Some(ip) = node.ip else {
            debug!("node {} has no resolvable IP yet, skipping", node.name);
            return;
        };
        if seen_ips.get(&node.uid) == Some(&ip) {
            return;
        }
        if let Err(e) = self.network_info.validate_node_ip(&ip.to_string()) {
            warn!("node {} IP {ip} is invalid: {e}", node.name);
            return;
        }

        match self.add_node(&node.name, &ip.to_string(), false).await {
            Ok(()) => {
                seen_ips.insert(node.uid, ip);
            }
            Err(e) => warn!("failed to allocate HostSubnet for node {}: {e}", node.name),
        }
    }

    async fn handle_node_deleted(&self, node: NodeInfo, seen_ips: &mut HashMap<String, std::net::IpAddr>) {
        seen_ips.remove(&node.uid);
        let Some(ip) = node.ip else { return };
        if let Err(e) = self.delete_node(&ip.to_string()).await {
            warn!("failed to delete HostSubnet for node {}: {e}", node.name);
        }
    }

    async fn run_subnet_registry_watcher(&self, cancel: CancellationToken) {
        use futures::StreamExt;
        use crate::registry::EventType;

        let source = HostSubnetSource {
            registry: Arc::clone(&self.registry),
            network: self.network.clone(),
        };
        let mut stream = watch_stream(source);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                next = stream.next() => {
                    let Some(batch) = next else { return };
                    for change in batch {
                        match change.event_type {
                            EventType::Added => {
                                let Some(hs) = change.value else { continue };
                                self.known.lock().await.insert(hs.node_ip.clone(), hs.clone());
                                if hs.assign {
                                    if let Err(e) = self.reclaim_external_subnet(&hs).await {
                                        warn!("failed to reclaim externally-assigned subnet for {}: {e}", hs.host);
                                    }
                                }
                            }
                            EventType::Removed => {
                                let old = self.known.lock().await.remove(&change.key);
                                if let Some(hs) = old {
                                    if !hs.assign {
                                        if let Ok(subnet) = hs.subnet.parse::<Ipv4Network>() {
                                            self.allocator.lock().await.release_network(subnet);
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn reclaim_external_subnet(&self, hs: &HostSubnet) -> Result<(), RegistryError> {
        self.registry.delete_host_subnet(&self.network, &hs.node_ip).await?;
        self.known.lock().await.remove(&hs.node_ip);
        self.add_node(&hs.host, &hs.node_ip, false).await
    }

    async fn add_node(&self, name: &str, ip: &str, assign: bool) -> Result<(), RegistryError> {
        let existing = self.known.lock().await.get(ip).cloned();
        match existing {
            Some(hs) if hs.host == name && hs.assign == assign => Ok(()),
            Some(hs) => {
                self.registry.delete_host_subnet(&self.network, ip).await?;
                let new_hs = HostSubnet {
                    host: name.to_string(),
                    node_ip: ip.to_string(),
                    subnet: hs.subnet.clone(),
                    assign,
                };
                self.registry.create_host_subnet(&self.network, &new_hs).await?;
                self.known.lock().await.insert(ip.to_string(), new_hs);
                Ok(())
            }
            None => {
                let subnet = self
                    .allocator
                    .lock()
                    .await
                    .get_network()
                    .map_err(|e| RegistryError::Other(anyhow::anyhow!(e)))?;
                let new_hs = HostSubnet {
                    host: name.to_string(),
                    node_ip: ip.to_string(),
                    subnet: subnet.to_string(),
                    assign,
                };
                match self.registry.create_host_subnet(&self.network, &new_hs).await {
                    Ok(_) => {
                        self.known.lock().await.insert(ip.to_string(), new_hs);
                        info!("allocated HostSubnet {subnet} to {name} ({ip})");
                        Ok(())
                    }
                    Err(e) => {
                        self.allocator.lock().await.release_network(subnet);
                        Err(e)
                    }
                }
            }
        }
    }

    async fn delete_node(&self, ip: &str) -> Result<(), RegistryError> {
        self.registry.delete_host_subnet(&self.network, ip).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{mock::MockRegistry, ClusterNetwork};

    fn config() -> ClusterNetwork {
        ClusterNetwork {
            name: "default".to_string(),
            network: "10.1.0.0/16".to_string(),
            host_subnet_length: 8,
            service_network: "172.30.0.0/16".to_string(),
            plugin_name: "k8s-ovs-subnet".to_string(),
        }
    }

    async fn master() -> (Arc<MockRegistry>, MasterSubnet) {
        let registry = Arc::new(MockRegistry::new());
        registry.seed_config("default", config());
        let info = NetworkInfo::parse(&config()).unwrap();
        let master = MasterSubnet::new(Arc::new(registry.clone()) as Arc<dyn Registry>, "default".to_string(), info, 8)
            .await
            .unwrap();
        (registry, master)
    }

    #[tokio::test]
    async fn allocates_distinct_subnets_for_two_nodes() {
        let (registry, master) = master().await;
        master.add_node("n1", "10.0.0.11", false).await.unwrap();
        master.add_node("n2", "10.0.0.12", false).await.unwrap();

        let (subnets, _) = registry.list_host_subnets("default").await.unwrap();
        let mut cidrs: Vec<_> = subnets.iter().map(|s| s.subnet.clone()).collect();
        cidrs.sort();
        assert_eq!(cidrs, vec!["10.1.0.0/24".to_string(), "10.1.1.0/24".to_string()]);
    }

    #[tokio::test]
    async fn add_node_is_idempotent() {
        let (registry, master) = master().await;
        master.add_node("n1", "10.0.0.11", false).await.unwrap();
        master.add_node("n1", "10.0.0.11", false).await.unwrap();
        let (subnets, _) = registry.list_host_subnets("default").await.unwrap();
        assert_eq!(subnets.len(), 1);
    }

    #[tokio::test]
    async fn delete_releases_subnet_for_reuse() {
        let (_registry, master) = master().await;
        master.add_node("n1", "10.0.0.11", false).await.unwrap();
        let first = master.known.lock().await.get("10.0.0.11").unwrap().subnet.clone();
        master.delete_node("10.0.0.11").await.unwrap();
        master.known.lock().await.remove("10.0.0.11");
        let subnet: Ipv4Network = first.parse().unwrap();
        master.allocator.lock().await.release_network(subnet);
        master.add_node("n2", "10.0.0.12", false).await.unwrap();
        let second = master.known.lock().await.get("10.0.0.12").unwrap().subnet.clone();
        assert_eq!(first, second);
    }
}
