//! Orchestrator Namespace watcher + NetNamespace watcher; VNID lifecycle
//! (component G).
//!
//! Direct port of `original_source/ksdn/vnids_master.go` (`populateVNIDs`,
//! `assignVNID`, `revokeVNID`, `updateNetID`), with the §9 design note
//! applied: `ref_counts: HashMap<u32, u32>` is maintained alongside
//! `id_of_namespace` so releasing the last reference to a VNID is an O(1)
//! decrement instead of a linear rescan of every namespace.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::netid_allocator::{NetIdAllocator, NetIdAllocatorError, MAX_VNID, MIN_VNID};
use crate::orchestrator::{ObjectEvent, Orchestrator};
use crate::registry::{NetNamespace, NetNamespaceAction, Registry, RegistryError};
use crate::watcher::{watch_stream, NetNamespaceSource};

#[derive(Debug, Error)]
pub enum MasterVnidError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Allocator(#[from] NetIdAllocatorError),
    #[error("namespace {0} has no assigned VNID")]
    UnknownPeer(String),
}

struct MasterVnidMap {
    id_of_namespace: HashMap<String, u32>,
    ref_counts: HashMap<u32, u32>,
    bitmap: NetIdAllocator,
    admin_namespaces: HashSet<String>,
}

impl MasterVnidMap {
    fn note_assignment(&mut self, name: &str, id: u32) {
        self.id_of_namespace.insert(name.to_string(), id);
        if id != 0 {
            *self.ref_counts.entry(id).or_insert(0) += 1;
        }
    }

    /// Drops `name`'s reference to its current id, releasing the id from
    /// the bitmap if that was the last reference. Returns the id that was
    /// released, if any.
    fn drop_reference(&mut self, name: &str) -> Option<u32> {
        let id = self.id_of_namespace.remove(name)?;
        if id == 0 {
            return None;
        }
        let count = self.ref_counts.get_mut(&id)?;
        *count -= 1;
        if *count == 0 {
            self.ref_counts.remove(&id);
            let _ = self.bitmap.release(id);
            return Some(id);
        }
        None
    }

    fn ref_count(&self, id: u32) -> u32 {
        if id == 0 {
            return u32::MAX;
        }
        self.ref_counts.get(&id).copied().unwrap_or(0)
    }
}

pub struct MasterVnid {
    registry: Arc<dyn Registry>,
    network: String,
    map: Mutex<MasterVnidMap>,
}

impl MasterVnid {
    pub async fn new(
        registry: Arc<dyn Registry>,
        network: String,
        admin_namespaces: HashSet<String>,
    ) -> Result<Self, MasterVnidError> {
        let (existing, _index) = registry.list_net_namespaces(&network).await?;
        let mut bitmap = NetIdAllocator::new(MIN_VNID, MAX_VNID);
        let mut id_of_namespace = HashMap::new();
        let mut ref_counts: HashMap<u32, u32> = HashMap::new();

        for ns in existing {
            id_of_namespace.insert(ns.net_name.clone(), ns.net_id);
            if ns.net_id != 0 {
                *ref_counts.entry(ns.net_id).or_insert(0) += 1;
                match bitmap.allocate(ns.net_id) {
                    Ok(()) | Err(NetIdAllocatorError::AlreadyAllocated(_)) => {}
                    Err(e) => warn!("failed to reserve VNID {} for {}: {e}", ns.net_id, ns.net_name),
                }
            }
        }

        Ok(Self {
            registry,
            network,
            map: Mutex::new(MasterVnidMap {
                id_of_namespace,
                ref_counts,
                bitmap,
                admin_namespaces,
            }),
        })
    }

    pub fn run(self: Arc<Self>, orchestrator: Arc<Orchestrator>, cancel: CancellationToken) {
        let this = Arc::clone(&self);
        let ns_cancel = cancel.clone();
        tokio::spawn(async move {
            this.run_namespace_watcher(orchestrator, ns_cancel).await;
        });

        let this = Arc::clone(&self);
        tokio::spawn(async move {
            this.run_net_namespace_watcher(cancel).await;
        });
    }

    async fn run_namespace_watcher(&self, orchestrator: Arc<Orchestrator>, cancel: CancellationToken) {
        use futures::StreamExt;

        let mut stream = orchestrator.watch_namespaces(cancel.clone());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                next = stream.next() => {
                    let Some(event) = next else { return };
                    match event {
                        ObjectEvent::Upsert(ns) => {
                            if let Err(e) = self.assign_vnid(&ns.name).await {
                                warn!("failed to assign VNID to namespace {}: {e}", ns.name);
                            }
                        }
                        ObjectEvent::Deleted(ns) => {
                            if let Err(e) = self.revoke_vnid(&ns.name).await {
                                warn!("failed to revoke VNID for namespace {}: {e}", ns.name);
                            }
                        }
                    }
                }
            }
        }
    }

    async fn run_net_namespace_watcher(&self, cancel: CancellationToken) {
        use crate::registry::EventType;
        use futures::StreamExt;

        let source = NetNamespaceSource {
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
                        if change.event_type != EventType::Added {
                            continue;
                        }
                        let Some(ns) = change.value else { continue };
                        if ns.action == NetNamespaceAction::None {
                            continue;
                        }
                        if let Err(e) = self.update_net_id(&ns).await {
                            warn!("failed to apply action {:?} to namespace {}: {e}", ns.action, ns.net_name);
                        }
                    }
                }
            }
        }
    }

    /// §4.G `assignVNID`.
    pub async fn assign_vnid(&self, name: &str) -> Result<(), MasterVnidError> {
        let mut map = self.map.lock().await;
        if map.id_of_namespace.contains_key(name) {
            return Ok(());
        }

        let id = if map.admin_namespaces.contains(name) {
            0
        } else {
            map.bitmap.allocate_next()?
        };

        let ns = NetNamespace {
            net_name: name.to_string(),
            net_id: id,
            action: NetNamespaceAction::None,
            namespace: String::new(),
        };

        match self.registry.create_net_namespace(&self.network, &ns).await {
            Ok(_) => {
                map.note_assignment(name, id);
                info!("assigned VNID {id} to namespace {name}");
                Ok(())
            }
            Err(e) => {
                if id != 0 {
                    let _ = map.bitmap.release(id);
                }
                Err(e.into())
            }
        }
    }

    /// §4.G `revokeVNID`.
    pub async fn revoke_vnid(&self, name: &str) -> Result<(), MasterVnidError> {
        self.registry.delete_net_namespace(&self.network, name).await?;
        let mut map = self.map.lock().await;
        map.drop_reference(name);
        Ok(())
    }

    /// §4.G `updateNetID`, triggered by a non-empty `Action` on a
    /// NetNamespace (the write-then-clear protocol).
    pub async fn update_net_id(&self, ns: &NetNamespace) -> Result<(), MasterVnidError> {
        let new_id = {
            let mut map = self.map.lock().await;
            match ns.action {
                NetNamespaceAction::None => return Ok(()),
                NetNamespaceAction::Global => 0,
                NetNamespaceAction::Join => {
                    let peer = &ns.namespace;
                    *map
                        .id_of_namespace
                        .get(peer)
                        .ok_or_else(|| MasterVnidError::UnknownPeer(peer.clone()))?
                }
                NetNamespaceAction::Isolate => {
                    let current = map.id_of_namespace.get(&ns.net_name).copied().unwrap_or(0);
                    if current != 0 && map.ref_count(current) == 1 {
                        current
                    } else {
                        map.bitmap.allocate_next()?
                    }
                }
            }
        };
        let old_id = self.map.lock().await.id_of_namespace.get(&ns.net_name).copied();

        let (_current, expected_index) = self
            .registry
            .get_net_namespace(&self.network, &ns.net_name)
            .await?;

        let persisted = NetNamespace {
            net_name: ns.net_name.clone(),
            net_id: new_id,
            action: NetNamespaceAction::None,
            namespace: String::new(),
        };

        match self
            .registry
            .update_net_namespace(&self.network, &persisted, expected_index)
            .await
        {
            Ok(_) => {
                let mut map = self.map.lock().await;
                // Isolate's "already the sole holder" path leaves the id
                // unchanged; dropping and re-noting it would release it from
                // the bitmap without re-reserving it, making it available to
                // a concurrent AllocateNext even though this namespace still
                // holds it.
                if old_id != Some(new_id) {
                    let released = map.drop_reference(&ns.net_name);
                    map.note_assignment(&ns.net_name, new_id);
                    if let Some(old) = released {
                        info!("namespace {} released VNID {old} via {:?}", ns.net_name, ns.action);
                    }
                }
                Ok(())
            }
            Err(e) => {
                let mut map = self.map.lock().await;
                if new_id != 0 && map.ref_count(new_id) == 0 {
                    let _ = map.bitmap.release(new_id);
                }
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::mock::MockRegistry;

    async fn master() -> (Arc<MockRegistry>, MasterVnid) {
        let registry = Arc::new(MockRegistry::new());
        let master = MasterVnid::new(Arc::new(registry.clone()) as Arc<dyn Registry>, "default".to_string(), HashSet::new())
            .await
            .unwrap();
        (registry, master)
    }

    #[tokio::test]
    async fn assigns_distinct_ids() {
        let (_registry, master) = master().await;
        master.assign_vnid("a").await.unwrap();
        master.assign_vnid("b").await.unwrap();
        let map = master.map.lock().await;
        assert_ne!(map.id_of_namespace["a"], map.id_of_namespace["b"]);
    }

    #[tokio::test]
    async fn admin_namespace_gets_zero() {
        let registry = Arc::new(MockRegistry::new());
        let master = MasterVnid::new(
            Arc::new(registry.clone()) as Arc<dyn Registry>,
            "default".to_string(),
            HashSet::from(["kube-system".to_string()]),
        )
        .await
        .unwrap();
        master.assign_vnid("kube-system").await.unwrap();
        let map = master.map.lock().await;
        assert_eq!(map.id_of_namespace["kube-system"], 0);
    }

    #[tokio::test]
    async fn join_then_isolate() {
        let (registry, master) = master().await;
        master.assign_vnid("a").await.unwrap();
        master.assign_vnid("b").await.unwrap();
        let x = *master.map.lock().await.id_of_namespace.get("a").unwrap();
        let y = *master.map.lock().await.id_of_namespace.get("b").unwrap();
        assert_ne!(x, y);

        let (a_ns, _) = registry.get_net_namespace("default", "a").await.unwrap();
        let join = NetNamespace {
            net_name: "a".to_string(),
            net_id: a_ns.net_id,
            action: NetNamespaceAction::Join,
            namespace: "b".to_string(),
        };
        master.update_net_id(&join).await.unwrap();
        {
            let map = master.map.lock().await;
            assert_eq!(map.id_of_namespace["a"], y);
            assert!(!map.bitmap.is_allocated(x));
        }

        let (a_ns, _) = registry.get_net_namespace("default", "a").await.unwrap();
        let isolate = NetNamespace {
            net_name: "a".to_string(),
            net_id: a_ns.net_id,
            action: NetNamespaceAction::Isolate,
            namespace: String::new(),
        };
        master.update_net_id(&isolate).await.unwrap();
        let map = master.map.lock().await;
        let z = map.id_of_namespace["a"];
        assert_ne!(z, y);
        assert_eq!(map.id_of_namespace["b"], y);
        assert!(map.bitmap.is_allocated(y));
    }

    #[tokio::test]
    async fn isolate_is_a_noop_for_the_sole_holder_of_its_id() {
        let (registry, master) = master().await;
        master.assign_vnid("a").await.unwrap();
        let id = master.map.lock().await.id_of_namespace["a"];

        let (a_ns, _) = registry.get_net_namespace("default", "a").await.unwrap();
        let isolate = NetNamespace {
            net_name: "a".to_string(),
            net_id: a_ns.net_id,
            action: NetNamespaceAction::Isolate,
            namespace: String::new(),
        };
        master.update_net_id(&isolate).await.unwrap();

        let map = master.map.lock().await;
        assert_eq!(map.id_of_namespace["a"], id);
        assert!(map.bitmap.is_allocated(id));
        assert_eq!(map.ref_count(id), 1);
    }

    #[tokio::test]
    async fn revoke_releases_last_reference() {
        let (_registry, master) = master().await;
        master.assign_vnid("a").await.unwrap();
        let id = master.map.lock().await.id_of_namespace["a"];
        master.revoke_vnid("a").await.unwrap();
        let map = master.map.lock().await;
        assert!(!map.id_of_namespace.contains_key("a"));
        assert!(!map.bitmap.is_allocated(id));
    }
}
