//! Cluster-orchestrator Node/Namespace/Pod watch (component M).
//!
//! Grounded on the teacher's `k8s.rs` `sync_loop` (the `kube::runtime::watcher`
//! + `Event::{Applied,Deleted,Restarted}` pattern, reflector-cache-in-an-
//! `RwLock` idiom), repointed at `Node`/`Namespace`/`Pod` instead of
//! `Pod`/`NetworkPolicy`. `Event::Restarted` is expanded into one `Updated`
//! per object, matching the original daemon's list-then-watch "Sync" batch
//! (kube's watcher already folds bookmark/resync handling in, so there is no
//! separate relist step to drive by hand).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use tokio::sync::RwLock;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// An orchestrator change, normalized across the `kube` watcher's
/// `Applied`/`Deleted`/`Restarted` shapes into the `Sync|Added|Updated|Deleted`
/// vocabulary §4.F/§4.G are written against. `Sync` and `Added`/`Updated` are
/// handled identically by every consumer in this crate, so they collapse to
/// one `Upsert` variant; only `Deleted` needs separate treatment.
#[derive(Debug, Clone)]
pub enum ObjectEvent<T> {
    Upsert(T),
    Deleted(T),
}

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub uid: String,
    pub ip: Option<IpAddr>,
}

#[derive(Debug, Clone)]
pub struct NamespaceInfo {
    pub name: String,
    pub uid: String,
}

#[derive(Debug, Clone)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub node_name: Option<String>,
    pub annotations: HashMap<String, String>,
}

pub struct Orchestrator {
    client: Client,
    pods: Arc<RwLock<HashMap<(String, String), PodInfo>>>,
}

impl Orchestrator {
    pub async fn connect() -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self {
            client,
            pods: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Synchronous point read against the in-memory pod reflector cache,
    /// used by PodManager's ADD path to resolve `{vnid, ingressKbps,
    /// egressKbps}` without a round trip to the API server per pod.
    pub async fn get_pod(&self, namespace: &str, name: &str) -> Option<PodInfo> {
        self.pods
            .read()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn watch_nodes(&self, cancel: CancellationToken) -> UnboundedReceiverStream<ObjectEvent<NodeInfo>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut stream = watcher(api, watcher::Config::default()).boxed();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = stream.next() => {
                        let Some(event) = next else { return };
                        match event {
                            Ok(Event::Applied(node)) => {
                                if let Some(info) = node_to_info(&node) {
                                    if tx.send(ObjectEvent::Upsert(info)).is_err() { return; }
                                }
                            }
                            Ok(Event::Deleted(node)) => {
                                if let Some(info) = node_to_info(&node) {
                                    if tx.send(ObjectEvent::Deleted(info)).is_err() { return; }
                                }
                            }
                            Ok(Event::Restarted(nodes)) => {
                                for node in nodes {
                                    if let Some(info) = node_to_info(&node) {
                                        if tx.send(ObjectEvent::Upsert(info)).is_err() { return; }
                                    }
                                }
                            }
                            Err(e) => warn!("node watcher error: {e}"),
                        }
                    }
                }
            }
        });

        UnboundedReceiverStream::new(rx)
    }

    pub fn watch_namespaces(
        &self,
        cancel: CancellationToken,
    ) -> UnboundedReceiverStream<ObjectEvent<NamespaceInfo>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut stream = watcher(api, watcher::Config::default()).boxed();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = stream.next() => {
                        let Some(event) = next else { return };
                        match event {
                            Ok(Event::Applied(ns)) => {
                                let info = namespace_to_info(&ns);
                                if tx.send(ObjectEvent::Upsert(info)).is_err() { return; }
                            }
                            Ok(Event::Deleted(ns)) => {
                                let info = namespace_to_info(&ns);
                                if tx.send(ObjectEvent::Deleted(info)).is_err() { return; }
                            }
                            Ok(Event::Restarted(namespaces)) => {
                                for ns in namespaces {
                                    let info = namespace_to_info(&ns);
                                    if tx.send(ObjectEvent::Upsert(info)).is_err() { return; }
                                }
                            }
                            Err(e) => warn!("namespace watcher error: {e}"),
                        }
                    }
                }
            }
        });

        UnboundedReceiverStream::new(rx)
    }

    /// Maintains the pod reflector cache used by `get_pod`. Runs for the
    /// lifetime of the process; there is no consumer-visible event stream
    /// because PodManager only ever needs point reads.
    pub fn spawn_pod_cache(&self, cancel: CancellationToken) {
        let api: Api<Pod> = Api::all(self.client.clone());
        let cache = Arc::clone(&self.pods);

        tokio::spawn(async move {
            let mut stream = watcher(api, watcher::Config::default()).boxed();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = stream.next() => {
                        let Some(event) = next else { return };
                        match event {
                            Ok(Event::Applied(pod)) => {
                                let info = pod_to_info(&pod);
                                cache.write().await.insert((info.namespace.clone(), info.name.clone()), info);
                            }
                            Ok(Event::Deleted(pod)) => {
                                let info = pod_to_info(&pod);
                                cache.write().await.remove(&(info.namespace, info.name));
                            }
                            Ok(Event::Restarted(pods)) => {
                                let mut guard = cache.write().await;
                                guard.clear();
                                for pod in pods {
                                    let info = pod_to_info(&pod);
                                    guard.insert((info.namespace.clone(), info.name.clone()), info);
                                }
                            }
                            Err(e) => {
                                debug!("pod watcher error: {e}");
                            }
                        }
                    }
                }
            }
        });
    }
}

fn watcher<K>(api: Api<K>, config: watcher::Config) -> impl futures::Stream<Item = watcher::Result<K>>
where
    K: kube::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + 'static,
    K::DynamicType: Default,
{
    kube::runtime::watcher(api, config)
}

fn node_to_info(node: &Node) -> Option<NodeInfo> {
    let name = node.metadata.name.clone()?;
    let uid = node.metadata.uid.clone().unwrap_or_default();
    let ip = node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .and_then(|addrs| {
            addrs
                .iter()
                .find(|a| a.type_ == "InternalIP")
                .or_else(|| addrs.iter().find(|a| a.type_ == "ExternalIP"))
        })
        .and_then(|a| a.address.parse::<IpAddr>().ok());

    Some(NodeInfo { name, uid, ip })
}

fn namespace_to_info(ns: &Namespace) -> NamespaceInfo {
    NamespaceInfo {
        name: ns.metadata.name.clone().unwrap_or_default(),
        uid: ns.metadata.uid.clone().unwrap_or_default(),
    }
}

fn pod_to_info(pod: &Pod) -> PodInfo {
    PodInfo {
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        name: pod.metadata.name.clone().unwrap_or_default(),
        node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
        annotations: pod.metadata.annotations.clone().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeStatus};
    use kube::api::ObjectMeta;

    #[test]
    fn prefers_internal_ip_over_external() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("n1".to_string()),
                uid: Some("u1".to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(vec![
                    NodeAddress { type_: "ExternalIP".to_string(), address: "203.0.113.5".to_string() },
                    NodeAddress { type_: "InternalIP".to_string(), address: "10.0.0.11".to_string() },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let info = node_to_info(&node).unwrap();
        assert_eq!(info.ip, Some("10.0.0.11".parse().unwrap()));
    }

    #[test]
    fn falls_back_to_external_ip() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("n1".to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(vec![NodeAddress {
                    type_: "ExternalIP".to_string(),
                    address: "203.0.113.5".to_string(),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let info = node_to_info(&node).unwrap();
        assert_eq!(info.ip, Some("203.0.113.5".parse().unwrap()));
    }

    #[test]
    fn node_without_name_is_skipped() {
        let node = Node::default();
        assert!(node_to_info(&node).is_none());
    }
}
