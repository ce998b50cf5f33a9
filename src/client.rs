//! Client-side access to a mesh through any one member.
//!
//! A [`MeshClient`] is not a peer: it holds no routing state and appears
//! in no tables. It pins itself to a single entry member at connect time
//! and drives stores and lookups through it; payload bytes are then read
//! directly from the replica holders the lookup returned.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, trace};

use crate::id::PeerRef;
use crate::protocols::MeshRpc;

/// The mesh has no record of the requested key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNotFound {
    pub key: String,
}

impl fmt::Display for KeyNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key {:?} is not stored in the mesh", self.key)
    }
}

impl std::error::Error for KeyNotFound {}

/// Every replica holder for a key failed to serve its payload. Collects
/// one reason per holder so the caller sees the whole picture instead of
/// just the last failure.
#[derive(Debug)]
pub struct AggregateFetchError {
    pub key: String,
    pub failures: Vec<(PeerRef, String)>,
}

impl fmt::Display for AggregateFetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "all {} holder(s) of {:?} failed:",
            self.failures.len(),
            self.key
        )?;
        for (peer, reason) in &self.failures {
            write!(f, " [{peer}: {reason}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateFetchError {}

/// Handle for issuing mesh operations from outside the mesh.
pub struct MeshClient<N: MeshRpc> {
    network: Arc<N>,
    entry: PeerRef,
}

impl<N: MeshRpc> Clone for MeshClient<N> {
    fn clone(&self) -> Self {
        Self {
            network: Arc::clone(&self.network),
            entry: self.entry.clone(),
        }
    }
}

impl<N: MeshRpc> MeshClient<N> {
    /// Handshake with `entry` and pin the client to the member that
    /// answered, using the descriptor the member reports for itself.
    pub async fn connect(network: N, entry: PeerRef) -> Result<Self> {
        let network = Arc::new(network);
        let entry = network
            .hello(&entry)
            .await
            .context("entry peer did not answer")?;
        debug!(entry = %entry, "client connected");
        Ok(Self { network, entry })
    }

    pub fn entry(&self) -> &PeerRef {
        &self.entry
    }

    /// Store payload bytes under `key`; the entry member becomes a
    /// replica holder and publishes itself.
    pub async fn store(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.network.mesh_store(&self.entry, key, value).await
    }

    /// Resolve the replica holders for `key`. Empty means unknown.
    pub async fn lookup(&self, key: &str) -> Result<Vec<PeerRef>> {
        self.network.mesh_lookup(&self.entry, key).await
    }

    /// Fetch the payload for `key`: resolve its holders, then try each in
    /// turn until one serves the bytes. Fails with [`KeyNotFound`] when no
    /// holder exists and with [`AggregateFetchError`] when every holder
    /// fails.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let replicas = self.lookup(key).await?;
        if replicas.is_empty() {
            return Err(KeyNotFound {
                key: key.to_string(),
            }
            .into());
        }
        let mut failures = Vec::new();
        for replica in replicas {
            match self.network.blob_fetch(&replica, key).await {
                Ok(Some(value)) => {
                    trace!(key, holder = %replica, "payload served");
                    return Ok(value);
                }
                Ok(None) => failures.push((replica, "holder had no payload".to_string())),
                Err(err) => failures.push((replica, err.to_string())),
            }
        }
        Err(AggregateFetchError {
            key: key.to_string(),
            failures,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::IdSpace;
    use crate::node::{MeshConfig, MeshNode};
    use crate::store::{BlobStore, MemoryBlobStore};
    use crate::transport::LocalBus;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn config() -> MeshConfig {
        MeshConfig {
            space: IdSpace::new(4, 6),
            rpc_timeout: Duration::from_millis(250),
            republish_interval: Duration::from_secs(600),
            expiry_sweep_interval: Duration::from_secs(600),
            ..MeshConfig::default()
        }
    }

    fn peer_ref(id: &str, port: u16) -> PeerRef {
        PeerRef::new(
            config().space.parse(id).unwrap(),
            SocketAddr::from(([127, 0, 0, 1], port)),
        )
    }

    #[tokio::test]
    async fn store_then_get_roundtrip() {
        let bus = LocalBus::new();
        let node = MeshNode::new(
            peer_ref("000000", 1),
            config(),
            bus.clone(),
            Arc::new(MemoryBlobStore::new()),
        );
        bus.register(node.clone()).await;

        let client = MeshClient::connect(bus.clone(), node.peer().clone())
            .await
            .unwrap();
        client.store("greeting", b"hello".to_vec()).await.unwrap();
        assert_eq!(client.get("greeting").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn missing_key_reports_not_found() {
        let bus = LocalBus::new();
        let node = MeshNode::new(
            peer_ref("000000", 1),
            config(),
            bus.clone(),
            Arc::new(MemoryBlobStore::new()),
        );
        bus.register(node.clone()).await;

        let client = MeshClient::connect(bus.clone(), node.peer().clone())
            .await
            .unwrap();
        let err = client.get("absent").await.unwrap_err();
        assert!(err.downcast_ref::<KeyNotFound>().is_some());
    }

    #[tokio::test]
    async fn every_failed_holder_is_reported() {
        let bus = LocalBus::new();
        let blobs = Arc::new(MemoryBlobStore::new());
        let node = MeshNode::new(peer_ref("000000", 1), config(), bus.clone(), blobs.clone());
        bus.register(node.clone()).await;

        let client = MeshClient::connect(bus.clone(), node.peer().clone())
            .await
            .unwrap();
        client.store("k", b"payload".to_vec()).await.unwrap();
        // The holder loses its payload after publishing.
        blobs.remove("k");

        let err = client.get("k").await.unwrap_err();
        let aggregate = err.downcast_ref::<AggregateFetchError>().unwrap();
        assert_eq!(aggregate.failures.len(), 1);
        assert_eq!(aggregate.failures[0].0, *node.peer());
    }

    #[tokio::test]
    async fn connect_fails_when_entry_is_down() {
        let bus = LocalBus::new();
        let node = MeshNode::new(
            peer_ref("000000", 1),
            config(),
            bus.clone(),
            Arc::new(MemoryBlobStore::new()),
        );
        bus.register(node.clone()).await;
        bus.set_down(&node.peer().id, true);

        assert!(MeshClient::connect(bus.clone(), node.peer().clone())
            .await
            .is_err());
    }
}
