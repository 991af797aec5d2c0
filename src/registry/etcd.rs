//! etcd-backed [`Registry`] implementation.
//!
//! Grounded on `examples/other_examples/.../network-registry.rs`'s
//! `XlineSubnetRegistry` (Txn/Compare create-vs-update pattern, watch
//! reconnect loop) and `original_source/pkg/etcdmanager/etcdv2/registry.go`
//! (key layout, the `create`-fails-if-exists / `update`-fails-if-stale
//! contract). Unlike the flannel-style lease registry those two files model,
//! HostSubnet/NetNamespace entries here have no TTL: the source's etcd v2
//! registry does not grant leases for them either, so plain `put`/`delete`
//! suffice.

use std::sync::Arc;

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, ConnectOptions, GetOptions, Txn, TxnOp, WatchOptions};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use super::{
    ClusterNetwork, Event, EventType, HostSubnet, Keyed, NetNamespace, Registry, RegistryError,
    RegistryWatchStream,
};

pub struct EtcdRegistry {
    client: Arc<Mutex<Client>>,
    prefix: String,
}

impl EtcdRegistry {
    pub async fn connect(
        endpoints: Vec<String>,
        prefix: String,
        options: Option<ConnectOptions>,
    ) -> Result<Self, RegistryError> {
        let client = Client::connect(endpoints, options).await?;
        Ok(Self {
            client: Arc::new(Mutex::new(client)),
            prefix,
        })
    }

    fn config_key(&self, network: &str) -> String {
        format!("{}/{}/config", self.prefix, network)
    }

    fn subnet_key(&self, network: &str, node_ip: &str) -> String {
        format!("{}/{}/subnets/{}", self.prefix, network, node_ip)
    }

    fn subnet_prefix(&self, network: &str) -> String {
        format!("{}/{}/subnets/", self.prefix, network)
    }

    fn netns_key(&self, network: &str, net_name: &str) -> String {
        format!("{}/{}/netnamespaces/{}", self.prefix, network, net_name)
    }

    fn netns_prefix(&self, network: &str) -> String {
        format!("{}/{}/netnamespaces/", self.prefix, network)
    }

    async fn create_value<T>(&self, key: String, value: &T) -> Result<i64, RegistryError>
    where
        T: serde::Serialize,
    {
        let payload = serde_json::to_vec(value)?;
        let cmp = Compare::version(key.clone(), CompareOp::Equal, 0);
        let put = TxnOp::put(key, payload, None);
        let txn = Txn::new().when([cmp]).and_then([put]);

        let resp = self.client.lock().await.txn(txn).await?;
        if !resp.succeeded() {
            return Err(RegistryError::AlreadyExists);
        }
        let index = resp.header().map(|h| h.revision()).unwrap_or(0);
        Ok(index)
    }

    async fn update_value<T>(
        &self,
        key: String,
        value: &T,
        expected_index: i64,
    ) -> Result<i64, RegistryError>
    where
        T: serde::Serialize,
    {
        let payload = serde_json::to_vec(value)?;
        let cmp = Compare::mod_revision(key.clone(), CompareOp::Equal, expected_index);
        let put = TxnOp::put(key, payload, None);
        let txn = Txn::new().when([cmp]).and_then([put]);

        let resp = self.client.lock().await.txn(txn).await?;
        if !resp.succeeded() {
            return Err(RegistryError::StaleWrite);
        }
        let index = resp.header().map(|h| h.revision()).unwrap_or(0);
        Ok(index)
    }

    async fn list_values<T>(&self, prefix: String) -> Result<(Vec<T>, i64), RegistryError>
    where
        T: serde::de::DeserializeOwned,
    {
        let opts = GetOptions::new().with_prefix();
        let resp = self.client.lock().await.get(prefix, Some(opts)).await?;
        let index = resp.header().map(|h| h.revision()).unwrap_or(0);

        let mut items = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match serde_json::from_slice::<T>(kv.value()) {
                Ok(v) => items.push(v),
                Err(e) => warn!("skipping unparsable registry entry {:?}: {e}", kv.key_str()),
            }
        }
        Ok((items, index))
    }

    async fn delete_key(&self, key: String) -> Result<(), RegistryError> {
        self.client.lock().await.delete(key, None).await?;
        Ok(())
    }

    async fn get_value<T>(&self, key: String) -> Result<(T, i64), RegistryError>
    where
        T: serde::de::DeserializeOwned,
    {
        let resp = self.client.lock().await.get(key, None).await?;
        let kv = resp.kvs().first().ok_or(RegistryError::NotFound)?;
        let value = serde_json::from_slice(kv.value())?;
        Ok((value, kv.mod_revision()))
    }

    async fn watch_kind<T>(&self, prefix: String, after_index: i64) -> Result<RegistryWatchStream<T>, RegistryError>
    where
        T: serde::de::DeserializeOwned + Keyed + Send + 'static,
    {
        let mut opts = WatchOptions::new().with_prefix();
        if after_index > 0 {
            opts = opts.with_start_revision(after_index + 1);
        }

        let (mut _watcher, mut stream) = self.client.lock().await.watch(prefix, Some(opts)).await?;

        let (tx, rx) = mpsc::unbounded_channel::<Result<Event<T>, RegistryError>>();
        tokio::spawn(async move {
            use futures::StreamExt;
            while let Some(item) = stream.next().await {
                let resp = match item {
                    Ok(resp) => resp,
                    Err(e) => {
                        let _ = tx.send(Err(RegistryError::Etcd(e)));
                        break;
                    }
                };

                if is_index_too_old(&resp) {
                    let _ = tx.send(Err(RegistryError::IndexTooOld));
                    break;
                }
                if resp.canceled() {
                    debug!("etcd watch channel canceled");
                    break;
                }

                let index = resp.header().map(|h| h.revision()).unwrap_or(0);

                for ev in resp.events() {
                    let Some(kv) = ev.kv() else { continue };
                    let key = match kv.key_str() {
                        Ok(k) => k.to_string(),
                        Err(_) => continue,
                    };

                    let translated = match ev.event_type() {
                        etcd_client::EventType::Delete => Event {
                            event_type: EventType::Removed,
                            key,
                            value: None,
                            index,
                        },
                        etcd_client::EventType::Put => match serde_json::from_slice::<T>(kv.value()) {
                            Ok(value) => Event {
                                event_type: EventType::Added,
                                key,
                                value: Some(value),
                                index,
                            },
                            Err(e) => {
                                warn!("skipping unparsable watch event for {key}: {e}");
                                continue;
                            }
                        },
                    };

                    if tx.send(Ok(translated)).is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

/// Classifies an etcd watch response as "requested revision already
/// compacted away". The source's analogous predicates
/// (`IsErrEtcdNodeExist`/`IsErrEtcdKeyNotFound`) used `ok || ...` where
/// `ok && ...` was clearly intended, so a type-assertion failure was
/// (incorrectly) still treated as a match; this uses the correct
/// conjunction, so a canceled watch with no compaction reason is never
/// mistaken for a stale cursor.
fn is_index_too_old(resp: &etcd_client::WatchResponse) -> bool {
    resp.canceled() && resp.compact_revision() > 0
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn get_network_config(&self, network: &str) -> Result<ClusterNetwork, RegistryError> {
        let resp = self
            .client
            .lock()
            .await
            .get(self.config_key(network), None)
            .await?;
        let kv = resp.kvs().first().ok_or(RegistryError::ConfigNotFound)?;
        Ok(serde_json::from_slice(kv.value())?)
    }

    async fn get_host_subnet(&self, network: &str, node_ip: &str) -> Result<(HostSubnet, i64), RegistryError> {
        self.get_value(self.subnet_key(network, node_ip)).await
    }

    async fn list_host_subnets(&self, network: &str) -> Result<(Vec<HostSubnet>, i64), RegistryError> {
        self.list_values(self.subnet_prefix(network)).await
    }

    async fn create_host_subnet(
        &self,
        network: &str,
        subnet: &HostSubnet,
    ) -> Result<i64, RegistryError> {
        self.create_value(self.subnet_key(network, subnet.key()), subnet)
            .await
    }

    async fn update_host_subnet(
        &self,
        network: &str,
        subnet: &HostSubnet,
        expected_index: i64,
    ) -> Result<i64, RegistryError> {
        self.update_value(self.subnet_key(network, subnet.key()), subnet, expected_index)
            .await
    }

    async fn delete_host_subnet(&self, network: &str, node_ip: &str) -> Result<(), RegistryError> {
        self.delete_key(self.subnet_key(network, node_ip)).await
    }

    async fn watch_host_subnets(
        &self,
        network: &str,
        after_index: i64,
    ) -> Result<RegistryWatchStream<HostSubnet>, RegistryError> {
        self.watch_kind(self.subnet_prefix(network), after_index).await
    }

    async fn get_net_namespace(&self, network: &str, net_name: &str) -> Result<(NetNamespace, i64), RegistryError> {
        self.get_value(self.netns_key(network, net_name)).await
    }

    async fn list_net_namespaces(
        &self,
        network: &str,
    ) -> Result<(Vec<NetNamespace>, i64), RegistryError> {
        self.list_values(self.netns_prefix(network)).await
    }

    async fn create_net_namespace(
        &self,
        network: &str,
        ns: &NetNamespace,
    ) -> Result<i64, RegistryError> {
        self.create_value(self.netns_key(network, ns.key()), ns).await
    }

    async fn update_net_namespace(
        &self,
        network: &str,
        ns: &NetNamespace,
        expected_index: i64,
    ) -> Result<i64, RegistryError> {
        self.update_value(self.netns_key(network, ns.key()), ns, expected_index)
            .await
    }

    async fn delete_net_namespace(&self, network: &str, net_name: &str) -> Result<(), RegistryError> {
        self.delete_key(self.netns_key(network, net_name)).await
    }

    async fn watch_net_namespaces(
        &self,
        network: &str,
        after_index: i64,
    ) -> Result<RegistryWatchStream<NetNamespace>, RegistryError> {
        self.watch_kind(self.netns_prefix(network), after_index).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_too_old_requires_both_canceled_and_compacted() {
        // Exercised indirectly: is_index_too_old is a pure `&&`, so a
        // canceled-without-compaction response (e.g. server shutdown) must
        // not be misclassified as a stale cursor. Direct construction of
        // etcd_client::WatchResponse requires a live server, so the
        // Watcher-level reconnect behavior is covered in watcher.rs tests
        // against MockRegistry instead.
        assert!(!is_index_too_old_example(false, 0));
        assert!(!is_index_too_old_example(true, 0));
        assert!(is_index_too_old_example(true, 5));
    }

    // Mirrors is_index_too_old's boolean shape without requiring a real
    // WatchResponse, to pin the `&&` conjunction in a plain unit test.
    fn is_index_too_old_example(canceled: bool, compact_revision: i64) -> bool {
        canceled && compact_revision > 0
    }
}
