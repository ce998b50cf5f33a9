//! In-process transport for tests and single-process meshes.
//!
//! [`LocalBus`] delivers calls by dispatching directly into the target
//! peer's handlers, but every request and reply still round-trips through
//! the wire codec, so size limits and encoding mistakes surface here the
//! same way they would on a socket. Individual peers can be marked down
//! or given artificial latency to exercise failure paths.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use crate::id::{Id, PeerRef};
use crate::messages::{self, MeshRequest, MeshResponse, NeighborReply, TransferEntry};
use crate::node::MeshNode;
use crate::protocols::MeshRpc;

/// A shared in-process network that peers register with by identifier.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    peers: RwLock<HashMap<Id, MeshNode<LocalBus>>>,
    down: Mutex<HashSet<Id>>,
    latency: Mutex<HashMap<Id, Duration>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                peers: RwLock::new(HashMap::new()),
                down: Mutex::new(HashSet::new()),
                latency: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Make a peer reachable under its identifier.
    pub async fn register(&self, node: MeshNode<LocalBus>) {
        let id = node.peer().id.clone();
        self.inner.peers.write().await.insert(id, node);
    }

    /// Remove a peer from the bus entirely.
    pub async fn deregister(&self, id: &Id) {
        self.inner.peers.write().await.remove(id);
    }

    /// Mark a peer unreachable (or reachable again) without touching its
    /// registration; calls to a down peer fail immediately.
    pub fn set_down(&self, id: &Id, down: bool) {
        let mut set = match self.inner.down.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        if down {
            set.insert(id.clone());
        } else {
            set.remove(id);
        }
    }

    /// Delay every call to a peer by `delay`.
    pub fn set_latency(&self, id: &Id, delay: Duration) {
        let mut map = match self.inner.latency.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.insert(id.clone(), delay);
    }

    async fn dispatch(&self, to: &PeerRef, request: MeshRequest) -> Result<MeshResponse> {
        // Encode and decode even though delivery is in-process.
        let bytes = messages::serialize(&request)?;
        let request: MeshRequest = messages::deserialize_bounded(&bytes)?;

        let is_down = {
            let set = match self.inner.down.lock() {
                Ok(set) => set,
                Err(poisoned) => poisoned.into_inner(),
            };
            set.contains(&to.id)
        };
        if is_down {
            bail!("peer {to} is unreachable");
        }
        let delay = {
            let map = match self.inner.latency.lock() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.get(&to.id).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let node = {
            let peers = self.inner.peers.read().await;
            peers.get(&to.id).cloned()
        };
        let Some(node) = node else {
            bail!("no peer listening at {to}");
        };
        trace!(to = %to, "delivering request");

        let response = match request {
            MeshRequest::Hello => MeshResponse::Hello {
                peer: node.handle_hello(),
            },
            MeshRequest::GetNextHop { target } => MeshResponse::NextHop {
                next: node.handle_get_next_hop(target).await?,
            },
            MeshRequest::Register { key, replica } => MeshResponse::Registered {
                is_root: node.handle_register(&key, replica).await?,
            },
            MeshRequest::Fetch { key } => {
                let (is_root, replicas) = node.handle_fetch(&key).await;
                MeshResponse::Fetched { is_root, replicas }
            }
            MeshRequest::RemoveBadNodes { peers } => {
                node.handle_remove_bad_nodes(peers).await;
                MeshResponse::Ack
            }
            MeshRequest::AddNode { joiner } => {
                MeshResponse::Neighbors(node.handle_add_node(joiner).await?)
            }
            MeshRequest::AddNodeMulticast { joiner, level } => {
                MeshResponse::Neighbors(node.handle_add_node_multicast(joiner, level).await?)
            }
            MeshRequest::Transfer { from, entries } => {
                node.handle_transfer(from, entries).await;
                MeshResponse::Ack
            }
            MeshRequest::AddBackpointer { from } => {
                node.handle_add_backpointer(from).await;
                MeshResponse::Ack
            }
            MeshRequest::RemoveBackpointer { from } => {
                node.handle_remove_backpointer(&from).await;
                MeshResponse::Ack
            }
            MeshRequest::GetBackpointers { from, level } => MeshResponse::Backpointers {
                peers: node.handle_get_backpointers(&from, level).await,
            },
            MeshRequest::NotifyLeave { from, replacement } => {
                node.handle_notify_leave(from, replacement).await;
                MeshResponse::Ack
            }
            MeshRequest::BlobFetch { key } => MeshResponse::Blob {
                value: node.handle_blob_fetch(&key),
            },
            MeshRequest::MeshLookup { key } => MeshResponse::Located {
                replicas: node.lookup(&key).await?,
            },
            MeshRequest::MeshStore { key, value } => {
                node.store(&key, value).await?;
                MeshResponse::Ack
            }
        };

        let bytes = messages::serialize(&response)?;
        Ok(messages::deserialize_bounded(&bytes)?)
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeshRpc for LocalBus {
    async fn hello(&self, to: &PeerRef) -> Result<PeerRef> {
        match self.dispatch(to, MeshRequest::Hello).await? {
            MeshResponse::Hello { peer } => Ok(peer),
            other => bail!("unexpected response to hello: {other:?}"),
        }
    }

    async fn get_next_hop(&self, to: &PeerRef, target: Id) -> Result<Option<PeerRef>> {
        match self.dispatch(to, MeshRequest::GetNextHop { target }).await? {
            MeshResponse::NextHop { next } => Ok(next),
            other => bail!("unexpected response to get_next_hop: {other:?}"),
        }
    }

    async fn register(&self, to: &PeerRef, key: &str, replica: PeerRef) -> Result<bool> {
        let request = MeshRequest::Register {
            key: key.to_string(),
            replica,
        };
        match self.dispatch(to, request).await? {
            MeshResponse::Registered { is_root } => Ok(is_root),
            other => bail!("unexpected response to register: {other:?}"),
        }
    }

    async fn fetch(&self, to: &PeerRef, key: &str) -> Result<(bool, Vec<PeerRef>)> {
        let request = MeshRequest::Fetch {
            key: key.to_string(),
        };
        match self.dispatch(to, request).await? {
            MeshResponse::Fetched { is_root, replicas } => Ok((is_root, replicas)),
            other => bail!("unexpected response to fetch: {other:?}"),
        }
    }

    async fn remove_bad_nodes(&self, to: &PeerRef, peers: Vec<PeerRef>) -> Result<()> {
        match self.dispatch(to, MeshRequest::RemoveBadNodes { peers }).await? {
            MeshResponse::Ack => Ok(()),
            other => bail!("unexpected response to remove_bad_nodes: {other:?}"),
        }
    }

    async fn add_node(&self, to: &PeerRef, joiner: PeerRef) -> Result<NeighborReply> {
        match self.dispatch(to, MeshRequest::AddNode { joiner }).await? {
            MeshResponse::Neighbors(reply) => Ok(reply),
            other => bail!("unexpected response to add_node: {other:?}"),
        }
    }

    async fn add_node_multicast(
        &self,
        to: &PeerRef,
        joiner: PeerRef,
        level: usize,
    ) -> Result<NeighborReply> {
        let request = MeshRequest::AddNodeMulticast { joiner, level };
        match self.dispatch(to, request).await? {
            MeshResponse::Neighbors(reply) => Ok(reply),
            other => bail!("unexpected response to add_node_multicast: {other:?}"),
        }
    }

    async fn transfer(
        &self,
        to: &PeerRef,
        from: PeerRef,
        entries: Vec<TransferEntry>,
    ) -> Result<()> {
        match self.dispatch(to, MeshRequest::Transfer { from, entries }).await? {
            MeshResponse::Ack => Ok(()),
            other => bail!("unexpected response to transfer: {other:?}"),
        }
    }

    async fn add_backpointer(&self, to: &PeerRef, from: PeerRef) -> Result<()> {
        match self.dispatch(to, MeshRequest::AddBackpointer { from }).await? {
            MeshResponse::Ack => Ok(()),
            other => bail!("unexpected response to add_backpointer: {other:?}"),
        }
    }

    async fn remove_backpointer(&self, to: &PeerRef, from: PeerRef) -> Result<()> {
        match self.dispatch(to, MeshRequest::RemoveBackpointer { from }).await? {
            MeshResponse::Ack => Ok(()),
            other => bail!("unexpected response to remove_backpointer: {other:?}"),
        }
    }

    async fn get_backpointers(
        &self,
        to: &PeerRef,
        from: PeerRef,
        level: usize,
    ) -> Result<Vec<PeerRef>> {
        let request = MeshRequest::GetBackpointers { from, level };
        match self.dispatch(to, request).await? {
            MeshResponse::Backpointers { peers } => Ok(peers),
            other => bail!("unexpected response to get_backpointers: {other:?}"),
        }
    }

    async fn notify_leave(
        &self,
        to: &PeerRef,
        from: PeerRef,
        replacement: Option<PeerRef>,
    ) -> Result<()> {
        let request = MeshRequest::NotifyLeave { from, replacement };
        match self.dispatch(to, request).await? {
            MeshResponse::Ack => Ok(()),
            other => bail!("unexpected response to notify_leave: {other:?}"),
        }
    }

    async fn blob_fetch(&self, to: &PeerRef, key: &str) -> Result<Option<Vec<u8>>> {
        let request = MeshRequest::BlobFetch {
            key: key.to_string(),
        };
        match self.dispatch(to, request).await? {
            MeshResponse::Blob { value } => Ok(value),
            other => bail!("unexpected response to blob_fetch: {other:?}"),
        }
    }

    async fn mesh_lookup(&self, to: &PeerRef, key: &str) -> Result<Vec<PeerRef>> {
        let request = MeshRequest::MeshLookup {
            key: key.to_string(),
        };
        match self.dispatch(to, request).await? {
            MeshResponse::Located { replicas } => Ok(replicas),
            other => bail!("unexpected response to mesh_lookup: {other:?}"),
        }
    }

    async fn mesh_store(&self, to: &PeerRef, key: &str, value: Vec<u8>) -> Result<()> {
        let request = MeshRequest::MeshStore {
            key: key.to_string(),
            value,
        };
        match self.dispatch(to, request).await? {
            MeshResponse::Ack => Ok(()),
            other => bail!("unexpected response to mesh_store: {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::IdSpace;
    use crate::node::MeshConfig;
    use crate::store::MemoryBlobStore;
    use std::net::SocketAddr;
    use tokio::time::Instant;

    fn config() -> MeshConfig {
        MeshConfig {
            space: IdSpace::new(4, 6),
            rpc_timeout: Duration::from_millis(250),
            republish_interval: Duration::from_secs(600),
            expiry_sweep_interval: Duration::from_secs(600),
            ..MeshConfig::default()
        }
    }

    async fn spawn_peer(bus: &LocalBus, id: &str, port: u16) -> MeshNode<LocalBus> {
        let peer = PeerRef::new(
            config().space.parse(id).unwrap(),
            SocketAddr::from(([127, 0, 0, 1], port)),
        );
        let node = MeshNode::new(peer, config(), bus.clone(), Arc::new(MemoryBlobStore::new()));
        bus.register(node.clone()).await;
        node
    }

    #[tokio::test]
    async fn hello_identifies_the_target() {
        let bus = LocalBus::new();
        let a = spawn_peer(&bus, "123123", 1).await;
        let peer = bus.hello(a.peer()).await.unwrap();
        assert_eq!(peer, *a.peer());
    }

    #[tokio::test]
    async fn down_peer_fails_fast() {
        let bus = LocalBus::new();
        let a = spawn_peer(&bus, "123123", 1).await;
        bus.set_down(&a.peer().id, true);
        assert!(bus.hello(a.peer()).await.is_err());
        bus.set_down(&a.peer().id, false);
        assert!(bus.hello(a.peer()).await.is_ok());
    }

    #[tokio::test]
    async fn unregistered_peer_is_unreachable() {
        let bus = LocalBus::new();
        let a = spawn_peer(&bus, "123123", 1).await;
        bus.deregister(&a.peer().id).await;
        assert!(bus.hello(a.peer()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn latency_delays_delivery() {
        let bus = LocalBus::new();
        let a = spawn_peer(&bus, "123123", 1).await;
        bus.set_latency(&a.peer().id, Duration::from_millis(80));
        let started = Instant::now();
        bus.hello(a.peer()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(80));
    }
}
