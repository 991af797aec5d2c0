//! In-process `Registry` implementation used by unit tests for Watcher,
//! MasterSubnet, and MasterVnid, so those tests don't require a live etcd.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
    ClusterNetwork, Event, EventType, HostSubnet, Keyed, NetNamespace, Registry, RegistryError,
    RegistryWatchStream,
};

#[derive(Default)]
struct State {
    configs: HashMap<String, ClusterNetwork>,
    host_subnets: HashMap<String, HashMap<String, HostSubnet>>,
    host_subnet_index: HashMap<String, HashMap<String, i64>>,
    net_namespaces: HashMap<String, HashMap<String, NetNamespace>>,
    net_namespace_index: HashMap<String, HashMap<String, i64>>,
    index: i64,
    host_subnet_watchers: Vec<mpsc::UnboundedSender<Result<Event<HostSubnet>, RegistryError>>>,
    net_namespace_watchers: Vec<mpsc::UnboundedSender<Result<Event<NetNamespace>, RegistryError>>>,
}

pub struct MockRegistry {
    state: Mutex<State>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    pub fn seed_config(&self, network: &str, config: ClusterNetwork) {
        self.state
            .lock()
            .unwrap()
            .configs
            .insert(network.to_string(), config);
    }

    pub fn current_index(&self) -> i64 {
        self.state.lock().unwrap().index
    }

    /// Force the current watch subscriber to receive `IndexTooOld` once,
    /// simulating an etcd-compacted revision (scenario S2).
    pub fn poison_host_subnet_watch(&self) {
        let state = self.state.lock().unwrap();
        if let Some(tx) = state.host_subnet_watchers.first() {
            let _ = tx.send(Err(RegistryError::IndexTooOld));
        }
    }
}

impl Default for MockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn get_network_config(&self, network: &str) -> Result<ClusterNetwork, RegistryError> {
        self.state
            .lock()
            .unwrap()
            .configs
            .get(network)
            .cloned()
            .ok_or(RegistryError::ConfigNotFound)
    }

    async fn get_host_subnet(&self, network: &str, node_ip: &str) -> Result<(HostSubnet, i64), RegistryError> {
        let state = self.state.lock().unwrap();
        let value = state
            .host_subnets
            .get(network)
            .and_then(|m| m.get(node_ip))
            .cloned()
            .ok_or(RegistryError::NotFound)?;
        let index = state
            .host_subnet_index
            .get(network)
            .and_then(|m| m.get(node_ip))
            .copied()
            .unwrap_or(state.index);
        Ok((value, index))
    }

    async fn list_host_subnets(&self, network: &str) -> Result<(Vec<HostSubnet>, i64), RegistryError> {
        let state = self.state.lock().unwrap();
        let items = state
            .host_subnets
            .get(network)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        Ok((items, state.index))
    }

    async fn create_host_subnet(
        &self,
        network: &str,
        subnet: &HostSubnet,
    ) -> Result<i64, RegistryError> {
        let mut state = self.state.lock().unwrap();
        if state
            .host_subnets
            .get(network)
            .and_then(|m| m.get(subnet.registry_key().as_str()))
            .is_some()
        {
            return Err(RegistryError::AlreadyExists);
        }
        state.index += 1;
        let index = state.index;
        state
            .host_subnets
            .entry(network.to_string())
            .or_default()
            .insert(subnet.registry_key(), subnet.clone());
        state
            .host_subnet_index
            .entry(network.to_string())
            .or_default()
            .insert(subnet.registry_key(), index);
        state.host_subnet_watchers.retain(|tx| {
            tx.send(Ok(Event {
                event_type: EventType::Added,
                key: subnet.registry_key(),
                value: Some(subnet.clone()),
                index,
            }))
            .is_ok()
        });
        Ok(index)
    }

    async fn update_host_subnet(
        &self,
        network: &str,
        subnet: &HostSubnet,
        expected_index: i64,
    ) -> Result<i64, RegistryError> {
        let mut state = self.state.lock().unwrap();
        let current = state
            .host_subnet_index
            .get(network)
            .and_then(|m| m.get(subnet.registry_key().as_str()))
            .copied();
        if current != Some(expected_index) {
            return Err(RegistryError::StaleWrite);
        }
        state.index += 1;
        let index = state.index;
        state
            .host_subnets
            .entry(network.to_string())
            .or_default()
            .insert(subnet.registry_key(), subnet.clone());
        state
            .host_subnet_index
            .entry(network.to_string())
            .or_default()
            .insert(subnet.registry_key(), index);
        state.host_subnet_watchers.retain(|tx| {
            tx.send(Ok(Event {
                event_type: EventType::Added,
                key: subnet.registry_key(),
                value: Some(subnet.clone()),
                index,
            }))
            .is_ok()
        });
        Ok(index)
    }

    async fn delete_host_subnet(&self, network: &str, node_ip: &str) -> Result<(), RegistryError> {
        let mut state = self.state.lock().unwrap();
        state
            .host_subnets
            .get_mut(network)
            .and_then(|m| m.remove(node_ip));
        state
            .host_subnet_index
            .get_mut(network)
            .and_then(|m| m.remove(node_ip));
        state.index += 1;
        let index = state.index;
        state.host_subnet_watchers.retain(|tx| {
            tx.send(Ok(Event {
                event_type: EventType::Removed,
                key: node_ip.to_string(),
                value: None,
                index,
            }))
            .is_ok()
        });
        Ok(())
    }

    async fn watch_host_subnets(
        &self,
        _network: &str,
        _after_index: i64,
    ) -> Result<RegistryWatchStream<HostSubnet>, RegistryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().host_subnet_watchers.push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn get_net_namespace(&self, network: &str, net_name: &str) -> Result<(NetNamespace, i64), RegistryError> {
        let state = self.state.lock().unwrap();
        let value = state
            .net_namespaces
            .get(network)
            .and_then(|m| m.get(net_name))
            .cloned()
            .ok_or(RegistryError::NotFound)?;
        let index = state
            .net_namespace_index
            .get(network)
            .and_then(|m| m.get(net_name))
            .copied()
            .unwrap_or(state.index);
        Ok((value, index))
    }

    async fn list_net_namespaces(
        &self,
        network: &str,
    ) -> Result<(Vec<NetNamespace>, i64), RegistryError> {
        let state = self.state.lock().unwrap();
        let items = state
            .net_namespaces
            .get(network)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        Ok((items, state.index))
    }

    async fn create_net_namespace(
        &self,
        network: &str,
        ns: &NetNamespace,
    ) -> Result<i64, RegistryError> {
        let mut state = self.state.lock().unwrap();
        if state
            .net_namespaces
            .get(network)
            .and_then(|m| m.get(ns.registry_key().as_str()))
            .is_some()
        {
            return Err(RegistryError::AlreadyExists);
        }
        state.index += 1;
        let index = state.index;
        state
            .net_namespaces
            .entry(network.to_string())
            .or_default()
            .insert(ns.registry_key(), ns.clone());
        state
            .net_namespace_index
            .entry(network.to_string())
            .or_default()
            .insert(ns.registry_key(), index);
        state.net_namespace_watchers.retain(|tx| {
            tx.send(Ok(Event {
                event_type: EventType::Added,
                key: ns.registry_key(),
                value: Some(ns.clone()),
                index,
            }))
            .is_ok()
        });
        Ok(index)
    }

    async fn update_net_namespace(
        &self,
        network: &str,
        ns: &NetNamespace,
        expected_index: i64,
    ) -> Result<i64, RegistryError> {
        let mut state = self.state.lock().unwrap();
        let current = state
            .net_namespace_index
            .get(network)
            .and_then(|m| m.get(ns.registry_key().as_str()))
            .copied();
        if current != Some(expected_index) {
            return Err(RegistryError::StaleWrite);
        }
        state.index += 1;
        let index = state.index;
        state
            .net_namespaces
            .entry(network.to_string())
            .or_default()
            .insert(ns.registry_key(), ns.clone());
        state
            .net_namespace_index
            .entry(network.to_string())
            .or_default()
            .insert(ns.registry_key(), index);
        state.net_namespace_watchers.retain(|tx| {
            tx.send(Ok(Event {
                event_type: EventType::Added,
                key: ns.registry_key(),
                value: Some(ns.clone()),
                index,
            }))
            .is_ok()
        });
        Ok(index)
    }

    async fn delete_net_namespace(&self, network: &str, net_name: &str) -> Result<(), RegistryError> {
        let mut state = self.state.lock().unwrap();
        state
            .net_namespaces
            .get_mut(network)
            .and_then(|m| m.remove(net_name));
        state
            .net_namespace_index
            .get_mut(network)
            .and_then(|m| m.remove(net_name));
        state.index += 1;
        let index = state.index;
        state.net_namespace_watchers.retain(|tx| {
            tx.send(Ok(Event {
                event_type: EventType::Removed,
                key: net_name.to_string(),
                value: None,
                index,
            }))
            .is_ok()
        });
        Ok(())
    }

    async fn watch_net_namespaces(
        &self,
        _network: &str,
        _after_index: i64,
    ) -> Result<RegistryWatchStream<NetNamespace>, RegistryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().net_namespace_watchers.push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
