//! Single-threaded CNI request serialiser: ADD/UPDATE/DEL attach/detach
//! (component K).
//!
//! Grounded on `original_source/ksdn/pod_linux.go`'s `podManager.setup`/
//! `update`/`teardown`, replacing its netlink-direct veth/netns calls with
//! `ip`(8)/`nsenter`(1) invocations (no netlink crate is in the teacher's
//! dependency stack) and its request channel + dedicated goroutine with a
//! `tokio::sync::mpsc` channel drained by one worker task, each request
//! carrying its own `oneshot` reply per §9's "serial CNI worker" design note.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::container_inspector::ContainerInspector;
use crate::ipam::{self, IpamError, IpamRequest, IpamResult};
use crate::node_vnid::NodeVnid;
use crate::orchestrator::Orchestrator;

const SDN_SCRIPT: &str = "k8s-sdn-ovs";
const POD_IFNAME: &str = "eth0";
const TUN_MTU: u32 = 1450;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodCommand {
    Add,
    Update,
    Del,
}

#[derive(Debug, Clone)]
pub struct PodRequest {
    pub command: PodCommand,
    pub pod_namespace: String,
    pub pod_name: String,
    pub container_id: String,
    pub netns: Option<String>,
}

#[derive(Debug, Error)]
pub enum PodManagerError {
    #[error("namespace {0} has no resolvable VNID")]
    NoVnid(String),
    #[error("netns required for CNI ADD")]
    NetnsRequired,
    #[error(transparent)]
    Ipam(#[from] IpamError),
    #[error(transparent)]
    Inspector(#[from] crate::container_inspector::ContainerInspectorError),
    #[error("failed to run {0}: {1}")]
    Exec(String, std::io::Error),
    #[error("{cmd} exited with {status}: {stderr}")]
    ExecFailed {
        cmd: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("no network information recorded for this pod")]
    UnknownVeth,
    #[error("request queue closed")]
    Canceled,
}

#[derive(Debug, Clone)]
struct PortInfo {
    host_veth: String,
    mac: String,
    pod_ip: String,
}

struct Job {
    req: PodRequest,
    reply: oneshot::Sender<Result<Option<IpamResult>, PodManagerError>>,
}

/// Front-end handle cloned into `CniServer` connection tasks. The actual
/// attach/detach work happens on a single worker task owning `ports`.
#[derive(Clone)]
pub struct PodManager {
    tx: mpsc::UnboundedSender<Job>,
}

impl PodManager {
    pub fn spawn(
        orchestrator: Arc<Orchestrator>,
        node_vnid: Arc<NodeVnid>,
        multi_tenant: bool,
        local_subnet: String,
        gateway: String,
        cluster_network: String,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            orchestrator,
            node_vnid,
            inspector: ContainerInspector::new(),
            multi_tenant,
            local_subnet,
            gateway,
            cluster_network,
            ports: Mutex::new(std::collections::HashMap::new()),
        };
        tokio::spawn(worker.run(rx, cancel));
        Self { tx }
    }

    /// Enqueues `req` and awaits its reply. Errors with `Canceled` if the
    /// worker has shut down (root cancellation fired).
    pub async fn submit(&self, req: PodRequest) -> Result<Option<IpamResult>, PodManagerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job { req, reply })
            .map_err(|_| PodManagerError::Canceled)?;
        rx.await.map_err(|_| PodManagerError::Canceled)?
    }
}

struct Worker {
    orchestrator: Arc<Orchestrator>,
    node_vnid: Arc<NodeVnid>,
    inspector: ContainerInspector,
    multi_tenant: bool,
    local_subnet: String,
    gateway: String,
    cluster_network: String,
    ports: Mutex<std::collections::HashMap<(String, String), PortInfo>>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Job>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    while let Ok(job) = rx.try_recv() {
                        let _ = job.reply.send(Err(PodManagerError::Canceled));
                    }
                    return;
                }
                job = rx.recv() => {
                    let Some(job) = job else { return };
                    let result = self.handle(&job.req).await;
                    let _ = job.reply.send(result);
                }
            }
        }
    }

    async fn handle(&self, req: &PodRequest) -> Result<Option<IpamResult>, PodManagerError> {
        match req.command {
            PodCommand::Add => self.setup(req).await.map(Some),
            PodCommand::Update => self.update(req).await.map(|_| None),
            PodCommand::Del => self.teardown(req).await.map(|_| None),
        }
    }

    async fn resolve_vnid(&self, namespace: &str) -> Result<u32, PodManagerError> {
        if !self.multi_tenant {
            return Ok(0);
        }
        self.node_vnid
            .get_vnid(namespace)
            .await
            .ok_or_else(|| PodManagerError::NoVnid(namespace.to_string()))
    }

    async fn bandwidth(&self, namespace: &str, name: &str) -> (String, String) {
        let Some(pod) = self.orchestrator.get_pod(namespace, name).await else {
            return (String::new(), String::new());
        };
        let ingress = pod
            .annotations
            .get("kubernetes.io/ingress-bandwidth")
            .cloned()
            .unwrap_or_default();
        let egress = pod
            .annotations
            .get("kubernetes.io/egress-bandwidth")
            .cloned()
            .unwrap_or_default();
        (ingress, egress)
    }

    async fn setup(&self, req: &PodRequest) -> Result<IpamResult, PodManagerError> {
        let netns = req.netns.as_deref().ok_or(PodManagerError::NetnsRequired)?;
        let vnid = self.resolve_vnid(&req.pod_namespace).await?;
        let (ingress, egress) = self.bandwidth(&req.pod_namespace, &req.pod_name).await;

        let ipam_result = ipam::invoke(&IpamRequest {
            command: "ADD",
            container_id: &req.container_id,
            netns,
            if_name: POD_IFNAME,
            local_subnet: &self.local_subnet,
            gateway: &self.gateway,
            cluster_network: &self.cluster_network,
        })?
        .ok_or(PodManagerError::UnknownVeth)?;

        let outcome = self.setup_veth_and_script(req, netns, &ipam_result, vnid, &ingress, &egress);
        match outcome {
            Ok(port) => {
                let key = (req.pod_namespace.clone(), req.pod_name.clone());
                self.ports.lock().await.insert(key, port);
                Ok(ipam_result)
            }
            Err(e) => {
                let _ = ipam::invoke(&IpamRequest {
                    command: "DEL",
                    container_id: &req.container_id,
                    netns,
                    if_name: POD_IFNAME,
                    local_subnet: &self.local_subnet,
                    gateway: &self.gateway,
                    cluster_network: &self.cluster_network,
                });
                Err(e)
            }
        }
    }

    fn setup_veth_and_script(
        &self,
        req: &PodRequest,
        netns: &str,
        ipam_result: &IpamResult,
        vnid: u32,
        ingress: &str,
        egress: &str,
    ) -> Result<PortInfo, PodManagerError> {
        let host_veth = host_veth_name(&req.container_id);

        run("ip", &[
            "link".into(), "add".into(), host_veth.clone(), "type".into(), "veth".into(),
            "peer".into(), "name".into(), POD_IFNAME.into(),
        ])?;
        run("ip", &["link".into(), "set".into(), host_veth.clone(), "up".into(), "mtu".into(), TUN_MTU.to_string()])?;
        run("ip", &["link".into(), "set".into(), POD_IFNAME.into(), "netns".into(), netns.into()])?;

        run_in_netns(netns, &["link".into(), "set".into(), POD_IFNAME.into(), "up".into(), "mtu".into(), TUN_MTU.to_string()])?;
        // Gateway is intentionally not configured inside the container: the
        // tun0 default route on the host side handles east-west/egress, and
        // adding it here would pull in the cluster subnet route twice.
        run_in_netns(netns, &["addr".into(), "add".into(), ipam_result.ip4.ip.clone(), "dev".into(), POD_IFNAME.into()])?;
        run_in_netns(netns, &["link".into(), "set".into(), "lo".into(), "up".into()])?;

        let mac = read_container_mac(netns, POD_IFNAME)?;
        let pod_ip = ipam_result.ip4.ip.split('/').next().unwrap_or(&ipam_result.ip4.ip).to_string();

        run_script("setup", &host_veth, &mac, &pod_ip, vnid as i64, ingress, egress)?;

        Ok(PortInfo { host_veth, mac, pod_ip })
    }

    async fn update(&self, req: &PodRequest) -> Result<(), PodManagerError> {
        let netns = match &req.netns {
            Some(ns) => ns.clone(),
            None => self
                .inspector
                .netns_path(&req.container_id)?
                .to_string_lossy()
                .into_owned(),
        };

        let vnid = self.resolve_vnid(&req.pod_namespace).await?;
        let (ingress, egress) = self.bandwidth(&req.pod_namespace, &req.pod_name).await;

        let key = (req.pod_namespace.clone(), req.pod_name.clone());
        let port = {
            let ports = self.ports.lock().await;
            ports.get(&key).cloned()
        };
        let (host_veth, mac, pod_ip) = match port {
            Some(p) => (p.host_veth, p.mac, p.pod_ip),
            None => {
                let mac = read_container_mac(&netns, POD_IFNAME)?;
                let ip = read_container_ip(&netns, POD_IFNAME)?;
                (host_veth_name(&req.container_id), mac, ip)
            }
        };

        run_script("update", &host_veth, &mac, &pod_ip, vnid as i64, &ingress, &egress)?;

        self.ports.lock().await.insert(
            key,
            PortInfo { host_veth, mac, pod_ip },
        );
        Ok(())
    }

    async fn teardown(&self, req: &PodRequest) -> Result<(), PodManagerError> {
        let key = (req.pod_namespace.clone(), req.pod_name.clone());
        let script_result = self.teardown_script(req, &key).await;

        let ipam_result = ipam::invoke(&IpamRequest {
            command: "DEL",
            container_id: &req.container_id,
            netns: req.netns.as_deref().unwrap_or(""),
            if_name: POD_IFNAME,
            local_subnet: &self.local_subnet,
            gateway: &self.gateway,
            cluster_network: &self.cluster_network,
        });

        self.ports.lock().await.remove(&key);

        script_result?;
        ipam_result?;
        Ok(())
    }

    async fn teardown_script(&self, req: &PodRequest, key: &(String, String)) -> Result<(), PodManagerError> {
        let netns_valid = req.netns.as_deref().map(|p| Path::new(p).exists()).unwrap_or(false);
        if !netns_valid {
            debug!("teardown called on already-destroyed pod {}/{}; only cleaning up IPAM", req.pod_namespace, req.pod_name);
            return Ok(());
        }
        let netns = req.netns.as_deref().unwrap();

        let port = self.ports.lock().await.get(key).cloned();
        let (host_veth, mac, pod_ip) = match port {
            Some(p) => (p.host_veth, p.mac, p.pod_ip),
            None => {
                let mac = read_container_mac(netns, POD_IFNAME)?;
                let ip = read_container_ip(netns, POD_IFNAME)?;
                (host_veth_name(&req.container_id), mac, ip)
            }
        };

        // The teardown verb doesn't need a real VNID; -1 signals "any".
        run_script("teardown", &host_veth, &mac, &pod_ip, -1, "", "")
    }
}

fn host_veth_name(container_id: &str) -> String {
    format!("veth{}", &container_id[..container_id.len().min(11)])
}

fn run_script(
    verb: &str,
    host_veth: &str,
    mac: &str,
    pod_ip: &str,
    vnid: i64,
    ingress: &str,
    egress: &str,
) -> Result<(), PodManagerError> {
    let output = Command::new(SDN_SCRIPT)
        .args([verb, host_veth, mac, pod_ip, &vnid.to_string(), ingress, egress])
        .output()
        .map_err(|e| PodManagerError::Exec(SDN_SCRIPT.to_string(), e))?;
    if !output.status.success() {
        warn!("{SDN_SCRIPT} {verb} output: {}", String::from_utf8_lossy(&output.stdout));
        return Err(PodManagerError::ExecFailed {
            cmd: format!("{SDN_SCRIPT} {verb}"),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

fn run(cmd: &str, args: &[String]) -> Result<String, PodManagerError> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .map_err(|e| PodManagerError::Exec(cmd.to_string(), e))?;
    if !output.status.success() {
        return Err(PodManagerError::ExecFailed {
            cmd: format!("{cmd} {}", args.join(" ")),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn run_in_netns(netns: &str, args: &[String]) -> Result<String, PodManagerError> {
    let mut full = vec![format!("--net={netns}"), "ip".to_string()];
    full.extend(args.iter().cloned());
    run("nsenter", &full)
}

fn read_container_mac(netns: &str, if_name: &str) -> Result<String, PodManagerError> {
    let out = run_in_netns(netns, &["-j".into(), "addr".into(), "show".into(), "dev".into(), if_name.into()])?;
    parse_json_field(&out, "address").ok_or(PodManagerError::UnknownVeth)
}

fn read_container_ip(netns: &str, if_name: &str) -> Result<String, PodManagerError> {
    let out = run_in_netns(netns, &["-j".into(), "addr".into(), "show".into(), "dev".into(), if_name.into()])?;
    let value: serde_json::Value = serde_json::from_str(&out).map_err(|_| PodManagerError::UnknownVeth)?;
    value
        .as_array()
        .and_then(|links| links.first())
        .and_then(|link| link.get("addr_info"))
        .and_then(|infos| infos.as_array())
        .and_then(|infos| infos.first())
        .and_then(|info| info.get("local"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or(PodManagerError::UnknownVeth)
}

fn parse_json_field(out: &str, field: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(out).ok()?;
    value
        .as_array()?
        .first()?
        .get(field)?
        .as_str()
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_veth_name_is_bounded() {
        let name = host_veth_name("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(name, "vethabcdefghi");
    }

    #[test]
    fn host_veth_name_handles_short_ids() {
        assert_eq!(host_veth_name("abc"), "vethabc");
    }

    #[test]
    fn parses_mac_from_ip_json_output() {
        let sample = r#"[{"ifname":"eth0","address":"02:42:ac:11:00:02","addr_info":[{"family":"inet","local":"10.1.0.5"}]}]"#;
        assert_eq!(parse_json_field(sample, "address"), Some("02:42:ac:11:00:02".to_string()));
    }

    #[test]
    fn parses_ip_from_ip_json_output() {
        let sample = r#"[{"ifname":"eth0","address":"02:42:ac:11:00:02","addr_info":[{"family":"inet","local":"10.1.0.5"}]}]"#;
        assert_eq!(read_container_ip_from_str(sample), Some("10.1.0.5".to_string()));
    }

    fn read_container_ip_from_str(out: &str) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(out).ok()?;
        value
            .as_array()?
            .first()?
            .get("addr_info")?
            .as_array()?
            .first()?
            .get("local")?
            .as_str()
            .map(|s| s.to_string())
    }
}
