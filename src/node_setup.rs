//! One-time idempotent OVS bridge/port/flow bootstrap for the local node
//! (component J).
//!
//! Grounded on `original_source/ksdn/controller.go`'s `SetupOVS`/
//! `alreadySetUp`, reusing `ovs.rs`'s `VsctlTxn`/`FlowTxn` for the
//! transactional parts and shelling out to `ip`(8) for interface/route/sysctl
//! work, the same process-invocation idiom `ovs.rs` uses for
//! `ovs-vsctl`/`ovs-ofctl`.

use std::net::IpAddr;
use std::process::Command;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use thiserror::Error;
use tracing::{info, warn};

use crate::network_info::{InvalidNodeIp, NetworkInfo};
use crate::ovs::{parse_sentinel_note, sentinel_note, FlowTxn, OvsError, VsctlTxn};
use crate::registry::{HostSubnet, Registry, RegistryError};

/// Pipeline semantics version; bump whenever table contents below change so
/// existing switches fail the sentinel check and get fully reprogrammed.
pub const VERSION: u8 = 1;

const POLL_INTERVAL: Duration = Duration::from_secs(3);
const POLL_TIMEOUT: Duration = Duration::from_secs(60);
const ROUTE_CLEANUP_BASE: Duration = Duration::from_millis(100);
const ROUTE_CLEANUP_FACTOR: f64 = 1.25;
const ROUTE_CLEANUP_STEPS: u32 = 6;

#[derive(Debug, Error)]
pub enum NodeSetupError {
    #[error("timed out after {0:?} waiting for this node's HostSubnet to appear")]
    LocalSubnetTimeout(Duration),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    InvalidNodeIp(#[from] InvalidNodeIp),
    #[error(transparent)]
    Ovs(#[from] OvsError),
    #[error("failed to run {0}: {1}")]
    Exec(String, std::io::Error),
    #[error("{cmd} exited with {status}: {stderr}")]
    ExecFailed {
        cmd: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("local HostSubnet has an unparseable subnet {0:?}")]
    BadLocalSubnet(String),
}

pub struct NodeSetup {
    network_info: NetworkInfo,
    bridge: String,
    multi_tenant: bool,
}

impl NodeSetup {
    pub fn new(network_info: NetworkInfo, bridge: impl Into<String>, multi_tenant: bool) -> Self {
        Self {
            network_info,
            bridge: bridge.into(),
            multi_tenant,
        }
    }

    /// Polls the registry for this node's HostSubnet, validating NodeIP,
    /// then programs OVS and tun0 if the version sentinel is missing or
    /// stale. No-ops (returns `Ok` immediately) if setup already matches.
    pub async fn run(
        &self,
        registry: &dyn Registry,
        network: &str,
        local_ip: IpAddr,
    ) -> Result<(), NodeSetupError> {
        let local_subnet = self.poll_local_subnet(registry, network, local_ip).await?;
        self.network_info.validate_node_ip(&local_ip.to_string())?;

        let subnet: Ipv4Network = local_subnet
            .subnet
            .parse()
            .map_err(|_| NodeSetupError::BadLocalSubnet(local_subnet.subnet.clone()))?;
        let gateway = first_host(subnet);
        let gateway_cidr = format!("{gateway}/{}", subnet.prefix());

        if self.already_set_up(&gateway_cidr)? {
            info!("node setup already at version {VERSION}, skipping reprogramming");
            return Ok(());
        }

        let previous_gateway = self.current_tun0_gateway();

        self.program_bridge_and_ports()?;
        self.program_pipeline()?;
        self.configure_tun0(&gateway_cidr)?;
        self.enable_forwarding()?;
        self.write_sentinel()?;

        if let Some(prev) = previous_gateway {
            if prev != gateway {
                self.delete_local_subnet_route(&prev.to_string()).await;
            }
        }

        info!("node setup complete: subnet={}, gateway={gateway_cidr}", local_subnet.subnet);
        Ok(())
    }

    async fn poll_local_subnet(
        &self,
        registry: &dyn Registry,
        network: &str,
        local_ip: IpAddr,
    ) -> Result<HostSubnet, NodeSetupError> {
        let deadline = tokio::time::Instant::now() + POLL_TIMEOUT;
        loop {
            match registry.get_host_subnet(network, &local_ip.to_string()).await {
                Ok((hs, _index)) => return Ok(hs),
                Err(RegistryError::NotFound) => {}
                Err(e) => warn!("transient error polling for local HostSubnet: {e}"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(NodeSetupError::LocalSubnetTimeout(POLL_TIMEOUT));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn already_set_up(&self, gateway_cidr: &str) -> Result<bool, NodeSetupError> {
        let output = run("ovs-ofctl", &[
            "-O".into(),
            "OpenFlow13".into(),
            "dump-flows".into(),
            self.bridge.clone(),
            "table=253".into(),
        ])?;

        let sentinel_ok = output.lines().any(|line| {
            line.split("note:")
                .nth(1)
                .and_then(|rest| rest.split(|c: char| c.is_whitespace() || c == ',').next())
                .and_then(parse_sentinel_note)
                == Some((self.multi_tenant, VERSION))
        });
        if !sentinel_ok {
            return Ok(false);
        }

        let addr_ok = run("ip", &["-4".into(), "addr".into(), "show".into(), "dev".into(), "tun0".into()])
            .map(|out| out.contains(gateway_cidr))
            .unwrap_or(false);
        if !addr_ok {
            return Ok(false);
        }

        let route_ok = run("ip", &["route".into(), "show".into(), "dev".into(), "tun0".into()])
            .map(|out| out.contains(&self.network_info.cluster_network.to_string()))
            .unwrap_or(false);

        Ok(route_ok)
    }

    fn current_tun0_gateway(&self) -> Option<IpAddr> {
        let out = run("ip", &["-4".into(), "addr".into(), "show".into(), "dev".into(), "tun0".into()]).ok()?;
        out.lines()
            .find_map(|line| line.trim().strip_prefix("inet "))
            .and_then(|rest| rest.split('/').next())
            .and_then(|ip| ip.parse().ok())
    }

    fn program_bridge_and_ports(&self) -> Result<(), NodeSetupError> {
        let mut vsctl = VsctlTxn::new(&self.bridge);
        vsctl.ensure_bridge("secure", "OpenFlow13");
        vsctl.del_port("vxlan0");
        vsctl.add_port("vxlan0", "vxlan", &[("remote_ip", "flow"), ("key", "flow")]);
        vsctl.del_port("tun0");
        vsctl.add_port("tun0", "internal", &[]);
        vsctl.commit()?;
        Ok(())
    }

    /// §4.J's fixed pipeline, minus the dynamically-populated entries owned
    /// by NodeSubnet/PodManager (tables 1, 2, 6, 7, 8) and by
    /// AddServiceRules (table 4) — this only lays down the static skeleton
    /// and defaults.
    fn program_pipeline(&self) -> Result<(), NodeSetupError> {
        let mut flows = FlowTxn::new(&self.bridge);

        flows.add_flow("table=0,priority=200,in_port=1,actions=move:NXM_NX_TUN_ID[0..31]->NXM_NX_REG0[0..31],goto_table:1");
        flows.add_flow("table=0,priority=200,in_port=2,arp,actions=goto_table:5");
        flows.add_flow("table=0,priority=200,in_port=2,ip,actions=goto_table:5");
        flows.add_flow("table=0,priority=150,in_port=2,actions=goto_table:5");
        flows.add_flow("table=0,priority=100,actions=goto_table:2");
        flows.add_flow("table=0,priority=0,actions=drop");

        flows.add_flow("table=1,priority=0,actions=drop");

        flows.add_flow("table=2,priority=0,actions=drop");

        let service_network = self.network_info.service_network.to_string();
        flows.add_flow(format!(
            "table=3,priority=100,ip,nw_dst={service_network},actions=goto_table:4"
        ));
        flows.add_flow("table=3,priority=0,actions=goto_table:5");

        flows.add_flow("table=4,priority=200,reg0=0,actions=output:2");
        flows.add_flow("table=4,priority=0,actions=drop");

        flows.add_flow("table=5,priority=0,actions=goto_table:9");

        flows.add_flow("table=6,priority=0,actions=drop");
        flows.add_flow("table=7,priority=0,actions=drop");
        flows.add_flow("table=8,priority=0,actions=drop");

        flows.add_flow("table=9,priority=0,actions=output:2");

        // table=253's sentinel is written separately by `write_sentinel`,
        // after every other table has landed, so a process killed mid-setup
        // never leaves a switch that looks fully configured.
        flows.commit()?;
        Ok(())
    }

    fn configure_tun0(&self, gateway_cidr: &str) -> Result<(), NodeSetupError> {
        run("ip", &["link".into(), "set".into(), "tun0".into(), "up".into(), "mtu".into(), "1450".into()])?;
        let _ = run("ip", &["addr".into(), "flush".into(), "dev".into(), "tun0".into()]);
        run("ip", &["addr".into(), "add".into(), gateway_cidr.to_string(), "dev".into(), "tun0".into()])?;
        run("ip", &[
            "route".into(),
            "replace".into(),
            self.network_info.cluster_network.to_string(),
            "dev".into(),
            "tun0".into(),
        ])?;
        run("ip", &[
            "route".into(),
            "replace".into(),
            "default".into(),
            "via".into(),
            gateway_cidr.split('/').next().unwrap_or(gateway_cidr).to_string(),
            "dev".into(),
            "tun0".into(),
        ])?;
        Ok(())
    }

    fn enable_forwarding(&self) -> Result<(), NodeSetupError> {
        std::fs::write("/proc/sys/net/ipv4/ip_forward", b"1\n")
            .map_err(|e| NodeSetupError::Exec("write ip_forward".to_string(), e))?;
        std::fs::write("/proc/sys/net/ipv4/conf/tun0/forwarding", b"1\n")
            .map_err(|e| NodeSetupError::Exec("write tun0 forwarding".to_string(), e))?;
        Ok(())
    }

    fn write_sentinel(&self) -> Result<(), NodeSetupError> {
        let mut flows = FlowTxn::new(&self.bridge);
        flows.del_flows("table=253");
        flows.add_flow(format!(
            "table=253,priority=0,actions=note:{}",
            sentinel_note(self.multi_tenant, VERSION)
        ));
        flows.commit()?;
        Ok(())
    }

    /// Exponential-backoff cleanup of the default route through a gateway
    /// this node no longer owns, per §5. Best-effort: a failure here is
    /// logged, not fatal, since a stale route only matters if traffic
    /// happens to hit it before the next reprogramming.
    async fn delete_local_subnet_route(&self, gateway: &str) {
        let mut delay = ROUTE_CLEANUP_BASE;
        for attempt in 0..ROUTE_CLEANUP_STEPS {
            match run("ip", &["route".into(), "del".into(), "default".into(), "via".into(), gateway.to_string()]) {
                Ok(_) => return,
                Err(e) => {
                    warn!("attempt {attempt} to remove stale route via {gateway} failed: {e}");
                    tokio::time::sleep(delay).await;
                    delay = delay.mul_f64(ROUTE_CLEANUP_FACTOR);
                }
            }
        }
        warn!("giving up removing stale route via {gateway} after {ROUTE_CLEANUP_STEPS} attempts");
    }
}

fn first_host(subnet: Ipv4Network) -> std::net::Ipv4Addr {
    let base = u32::from(subnet.network());
    std::net::Ipv4Addr::from(base + 1)
}

fn run(cmd: &str, args: &[String]) -> Result<String, NodeSetupError> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .map_err(|e| NodeSetupError::Exec(cmd.to_string(), e))?;
    if !output.status.success() {
        return Err(NodeSetupError::ExecFailed {
            cmd: format!("{cmd} {}", args.join(" ")),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_host_is_network_address_plus_one() {
        let subnet: Ipv4Network = "10.1.0.0/24".parse().unwrap();
        assert_eq!(first_host(subnet), "10.1.0.1".parse::<std::net::Ipv4Addr>().unwrap());
    }

    #[test]
    fn sentinel_round_trips_through_dump_flows_format() {
        let note = sentinel_note(true, VERSION);
        let line = format!("table=253 actions=note:{note}");
        let parsed = line
            .split("note:")
            .nth(1)
            .and_then(|rest| rest.split(|c: char| c.is_whitespace()).next())
            .and_then(parse_sentinel_note);
        assert_eq!(parsed, Some((true, VERSION)));
    }
}
