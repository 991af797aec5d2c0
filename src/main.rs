//! Overlay SDN control-plane daemon: bootstrap (component R).
//!
//! Grounded on the teacher's `main.rs` (tracing init, config load, signal
//! handling, spawn-then-wait shape), restructured per §4.R/§9 into an
//! always-on node-side task set plus a master-side task set gated on
//! `ElectionCoord::i_am_leader()`, all observing one root
//! [`CancellationToken`].

mod cni_server;
mod config;
mod container_inspector;
mod election;
mod ipam;
mod master_subnet;
mod master_vnid;
mod netid_allocator;
mod network_info;
mod node_setup;
mod node_subnet;
mod node_vnid;
mod orchestrator;
mod ovs;
mod pod_manager;
mod registry;
mod subnet_allocator;
mod watcher;

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Context;
use etcd_client::ConnectOptions;
use ipnetwork::Ipv4Network;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cni_server::CniServer;
use crate::config::DaemonConfig;
use crate::election::ElectionCoord;
use crate::master_subnet::MasterSubnet;
use crate::master_vnid::MasterVnid;
use crate::network_info::NetworkInfo;
use crate::node_setup::NodeSetup;
use crate::node_subnet::NodeSubnet;
use crate::node_vnid::NodeVnid;
use crate::orchestrator::Orchestrator;
use crate::pod_manager::PodManager;
use crate::registry::etcd::EtcdRegistry;
use crate::registry::Registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = DaemonConfig::load().context("failed to parse daemon configuration")?;
    info!("k8s-ovsd starting as node {}", config.hostname());

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let registry = connect_registry(&config)
        .await
        .context("failed to connect to the etcd registry")?;
    let registry: Arc<dyn Registry> = Arc::new(registry);

    let cluster_config = registry
        .get_network_config(&config.network)
        .await
        .context("ClusterNetwork config not found; an operator must seed it before the daemon starts")?;
    let host_subnet_bits = cluster_config.host_subnet_length;
    let network_info = NetworkInfo::parse(&cluster_config).context("invalid ClusterNetwork config")?;

    let local_ip = resolve_local_ip(&config)
        .await
        .context("failed to resolve this node's IP")?;

    let orchestrator = Arc::new(
        Orchestrator::connect()
            .await
            .context("failed to connect to the Kubernetes API")?,
    );
    orchestrator.spawn_pod_cache(cancel.clone());

    let election = ElectionCoord::spawn(
        etcd_client_handle(&config).await?,
        format!("{}/election/{}", config.etcd_prefix, config.network),
        config.hostname().to_string(),
        cancel.clone(),
    );

    spawn_node_side(
        &config,
        Arc::clone(&registry),
        Arc::clone(&orchestrator),
        network_info.clone(),
        local_ip,
        cancel.clone(),
    )
    .await
    .context("failed to start node-side task set")?;

    spawn_master_supervisor(
        config.clone(),
        registry,
        orchestrator,
        network_info,
        host_subnet_bits,
        election,
        cancel.clone(),
    );

    notify_ready();
    info!("bootstrap complete");

    cancel.cancelled().await;
    info!("shutting down");
    Ok(())
}

/// Starts the node-side task set that every node runs regardless of
/// leadership: OVS bootstrap, the subnet/VNID watchers that drive OVS, the
/// PodManager worker, and the CNI socket listener.
async fn spawn_node_side(
    config: &DaemonConfig,
    registry: Arc<dyn Registry>,
    orchestrator: Arc<Orchestrator>,
    network_info: NetworkInfo,
    local_ip: IpAddr,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let node_setup = NodeSetup::new(network_info.clone(), config.ovs_bridge.clone(), config.multi_tenant);
    node_setup
        .run(registry.as_ref(), &config.network, local_ip)
        .await
        .context("node OVS bootstrap failed")?;

    let node_subnet = Arc::new(NodeSubnet::new(
        Arc::clone(&registry),
        config.network.clone(),
        network_info.clone(),
        local_ip,
        config.ovs_bridge.clone(),
    ));
    node_subnet.run(cancel.clone());

    let node_vnid = Arc::new(NodeVnid::new());
    Arc::clone(&node_vnid).run(Arc::clone(&registry), config.network.clone(), cancel.clone());

    let (local_subnet, gateway) = local_subnet_and_gateway(registry.as_ref(), &config.network, local_ip).await?;
    let cluster_network = network_info.cluster_network.to_string();
    let pod_manager = PodManager::spawn(
        orchestrator,
        Arc::clone(&node_vnid),
        config.multi_tenant,
        local_subnet,
        gateway,
        cluster_network,
        cancel.clone(),
    );

    if let Some(parent) = config.cni_socket.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let cni_server = CniServer::bind(&config.cni_socket, pod_manager).context("failed to bind CNI socket")?;
    cni_server.run(cancel);

    Ok(())
}

async fn local_subnet_and_gateway(
    registry: &dyn Registry,
    network: &str,
    local_ip: IpAddr,
) -> anyhow::Result<(String, String)> {
    let (hs, _index) = registry
        .get_host_subnet(network, &local_ip.to_string())
        .await
        .context("this node's HostSubnet disappeared after NodeSetup bootstrap")?;
    let subnet: Ipv4Network = hs.subnet.parse().context("local HostSubnet has an unparseable subnet")?;
    let gateway = std::net::Ipv4Addr::from(u32::from(subnet.network()) + 1);
    Ok((hs.subnet, gateway.to_string()))
}

/// Runs the master-side task set (MasterSubnet, MasterVnid) only while this
/// process holds the election lease, tearing the task set down cleanly on
/// leadership loss by cancelling a per-term child token.
fn spawn_master_supervisor(
    config: DaemonConfig,
    registry: Arc<dyn Registry>,
    orchestrator: Arc<Orchestrator>,
    network_info: NetworkInfo,
    host_subnet_bits: u8,
    mut election: ElectionCoord,
    root_cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = root_cancel.cancelled() => return,
                _ = election.wait_for_leadership() => {}
            }
            if root_cancel.is_cancelled() {
                return;
            }
            info!("acquired leadership; starting master task set");
            let master_cancel = root_cancel.child_token();

            if let Err(e) = run_master_tasks(
                &config,
                Arc::clone(&registry),
                Arc::clone(&orchestrator),
                network_info.clone(),
                host_subnet_bits,
                master_cancel.clone(),
            )
            .await
            {
                warn!("failed to start master task set: {e}");
                master_cancel.cancel();
                continue;
            }

            tokio::select! {
                _ = root_cancel.cancelled() => { master_cancel.cancel(); return; }
                _ = election.wait_for_leadership_loss() => {
                    info!("lost leadership; stopping master task set");
                    master_cancel.cancel();
                }
            }
        }
    });
}

async fn run_master_tasks(
    config: &DaemonConfig,
    registry: Arc<dyn Registry>,
    orchestrator: Arc<Orchestrator>,
    network_info: NetworkInfo,
    host_subnet_bits: u8,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let master_subnet = Arc::new(
        MasterSubnet::new(Arc::clone(&registry), config.network.clone(), network_info, host_subnet_bits)
            .await
            .context("failed to initialize MasterSubnet")?,
    );
    master_subnet.run(Arc::clone(&orchestrator), cancel.clone());

    let admin_namespaces: HashSet<String> = config.admin_namespaces.iter().cloned().collect();
    let master_vnid = Arc::new(
        MasterVnid::new(Arc::clone(&registry), config.network.clone(), admin_namespaces)
            .await
            .context("failed to initialize MasterVnid")?,
    );
    master_vnid.run(orchestrator, cancel);

    Ok(())
}

async fn connect_registry(config: &DaemonConfig) -> Result<EtcdRegistry, registry::RegistryError> {
    let options = build_connect_options(config).map_err(|e| registry::RegistryError::Other(e))?;
    EtcdRegistry::connect(config.etcd_endpoints.clone(), config.etcd_prefix.clone(), Some(options)).await
}

async fn etcd_client_handle(config: &DaemonConfig) -> anyhow::Result<Arc<tokio::sync::Mutex<etcd_client::Client>>> {
    let options = build_connect_options(config)?;
    let client = etcd_client::Client::connect(config.etcd_endpoints.clone(), Some(options))
        .await
        .context("failed to connect a second etcd client for leader election")?;
    Ok(Arc::new(tokio::sync::Mutex::new(client)))
}

fn build_connect_options(config: &DaemonConfig) -> anyhow::Result<ConnectOptions> {
    let mut options = ConnectOptions::new();
    if let (Some(user), Some(password)) = (&config.etcd_username, &config.etcd_password) {
        options = options.with_user(user.clone(), password.clone());
    }
    if let Some(tls) = build_tls_options(config)? {
        options = options.with_tls(tls);
    }
    Ok(options)
}

/// Builds `etcd-client`'s TLS config from `--etcd-{keyfile,certfile,cafile}`
/// when any is set. A client cert requires both `keyfile` and `certfile`.
fn build_tls_options(config: &DaemonConfig) -> anyhow::Result<Option<etcd_client::TlsOptions>> {
    if config.etcd_cafile.is_none() && config.etcd_keyfile.is_none() && config.etcd_certfile.is_none() {
        return Ok(None);
    }
    let mut tls = etcd_client::TlsOptions::new();
    if let Some(ca) = &config.etcd_cafile {
        let ca_cert = std::fs::read_to_string(ca)
            .with_context(|| format!("failed to read etcd CA file {}", ca.display()))?;
        tls = tls.ca_certificate(etcd_client::Certificate::from_pem(ca_cert));
    }
    match (&config.etcd_keyfile, &config.etcd_certfile) {
        (Some(key), Some(cert)) => {
            let key_pem = std::fs::read_to_string(key)
                .with_context(|| format!("failed to read etcd key file {}", key.display()))?;
            let cert_pem = std::fs::read_to_string(cert)
                .with_context(|| format!("failed to read etcd cert file {}", cert.display()))?;
            tls = tls.identity(etcd_client::Identity::from_pem(cert_pem, key_pem));
        }
        (None, None) => {}
        _ => {
            anyhow::bail!("--etcd-keyfile and --etcd-certfile must be set together");
        }
    }
    Ok(Some(tls))
}

/// Resolves the IP the node registers in its HostSubnet. Uses the system
/// resolver against `--hostname` (or the kernel hostname); an operator
/// running on a host with multiple addresses should set `--hostname` to a
/// name that resolves to the intended one.
async fn resolve_local_ip(config: &DaemonConfig) -> anyhow::Result<IpAddr> {
    let hostname = config.hostname().to_string();
    tokio::task::spawn_blocking(move || {
        use std::net::ToSocketAddrs;
        (hostname.as_str(), 0u16)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(|addr| addr.ip())
            .ok_or_else(|| anyhow::anyhow!("could not resolve an IP address for hostname {hostname:?}"))
    })
    .await
    .context("hostname resolution task panicked")?
}

/// Writes `READY=1` to the `NOTIFY_SOCKET` datagram socket if systemd set
/// one, matching the original daemon's `go-systemd/daemon.SdNotify` call.
fn notify_ready() {
    let Ok(socket_path) = std::env::var("NOTIFY_SOCKET") else { return };
    let Ok(socket) = std::os::unix::net::UnixDatagram::unbound() else { return };
    if let Err(e) = socket.send_to(b"READY=1", &socket_path) {
        warn!("failed to notify systemd readiness: {e}");
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("shutdown signal received");
        cancel.cancel();
    });
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
