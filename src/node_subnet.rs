//! HostSubnet watcher; maintains remote-peer OVS flows in tables 1 and 8
//! (component H).
//!
//! Grounded on `original_source/ksdn/subnets.go`'s `SubnetStartNode` /
//! `(*subnetsWatcher) Watch`, reusing this crate's generic `watch_stream`
//! (component E) the same way `master_subnet.rs` does, but driving
//! `ovs.rs::FlowTxn` instead of the registry.

use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::Ipv4Network;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::network_info::NetworkInfo;
use crate::ovs::{FlowTxn, OvsError};
use crate::registry::{EventType, HostSubnet, Registry};
use crate::watcher::{watch_stream, HostSubnetSource};

pub struct NodeSubnet {
    registry: Arc<dyn Registry>,
    network: String,
    network_info: NetworkInfo,
    local_ip: IpAddr,
    bridge: String,
}

impl NodeSubnet {
    pub fn new(
        registry: Arc<dyn Registry>,
        network: String,
        network_info: NetworkInfo,
        local_ip: IpAddr,
        bridge: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            network,
            network_info,
            local_ip,
            bridge: bridge.into(),
        }
    }

    pub fn run(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            self.run_watcher(cancel).await;
        });
    }

    async fn run_watcher(&self, cancel: CancellationToken) {
        use futures::StreamExt;

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
                    if let Err(e) = self.apply_batch(batch) {
                        warn!("failed to program peer flows, will retry on next update: {e}");
                    }
                }
            }
        }
    }

    fn apply_batch(&self, batch: Vec<crate::watcher::Change<HostSubnet>>) -> Result<(), OvsError> {
        let mut txn = FlowTxn::new(&self.bridge);
        for change in &batch {
            match change.event_type {
                EventType::Added => {
                    let Some(hs) = &change.value else { continue };
                    if hs.node_ip.parse::<IpAddr>() == Ok(self.local_ip) {
                        continue;
                    }
                    if let Err(e) = self.network_info.validate_node_ip(&hs.node_ip) {
                        warn!("ignoring HostSubnet with invalid NodeIP {}: {e}", hs.node_ip);
                        continue;
                    }
                    let Ok(subnet) = hs.subnet.parse::<Ipv4Network>() else {
                        warn!("ignoring HostSubnet with unparseable subnet {}", hs.subnet);
                        continue;
                    };
                    add_peer_flows(&mut txn, &hs.node_ip, subnet);
                }
                EventType::Removed => {
                    let Some(hs) = &change.value else { continue };
                    if hs.node_ip.parse::<IpAddr>() == Ok(self.local_ip) {
                        continue;
                    }
                    remove_peer_flows(&mut txn, &hs.node_ip, &hs.subnet);
                }
            }
        }
        txn.commit()
    }
}

fn add_peer_flows(txn: &mut FlowTxn, node_ip: &str, subnet: Ipv4Network) {
    txn.add_flow(format!(
        "table=1,priority=100,tun_src={node_ip},actions=goto_table:5"
    ));
    txn.add_flow(format!(
        "table=8,priority=100,arp,nw_dst={subnet},actions=load:NXM_NX_REG0[]->NXM_NX_TUN_ID[0..31],set_field:{node_ip}->tun_dst,output:1"
    ));
    txn.add_flow(format!(
        "table=8,priority=100,ip,nw_dst={subnet},actions=load:NXM_NX_REG0[]->NXM_NX_TUN_ID[0..31],set_field:{node_ip}->tun_dst,output:1"
    ));
}

fn remove_peer_flows(txn: &mut FlowTxn, node_ip: &str, subnet: &str) {
    txn.del_flows(format!("table=1,tun_src={node_ip}"));
    txn.del_flows(format!("table=8,arp,nw_dst={subnet}"));
    txn.del_flows(format!("table=8,ip,nw_dst={subnet}"));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_subnet(host: &str, ip: &str, subnet: &str) -> HostSubnet {
        HostSubnet {
            host: host.to_string(),
            node_ip: ip.to_string(),
            subnet: subnet.to_string(),
            assign: false,
        }
    }

    #[test]
    fn local_node_ip_is_recognized_for_skip() {
        let hs = host_subnet("n1", "10.0.0.11", "10.1.0.0/24");
        let local: IpAddr = "10.0.0.11".parse().unwrap();
        assert_eq!(hs.node_ip.parse::<IpAddr>(), Ok(local));
    }

    #[test]
    fn peer_flows_build_without_panicking() {
        let mut txn = FlowTxn::new("br0");
        let subnet: Ipv4Network = "10.1.1.0/24".parse().unwrap();
        add_peer_flows(&mut txn, "10.0.0.12", subnet);
        drop(txn);
    }

    #[test]
    fn remove_flows_target_exact_tables() {
        let mut txn = FlowTxn::new("br0");
        remove_peer_flows(&mut txn, "10.0.0.12", "10.1.1.0/24");
        // del_flows/add_flow just buffer strings until commit(); nothing to
        // assert on the opaque FlowTxn beyond "it didn't panic building it".
        drop(txn);
    }
}
