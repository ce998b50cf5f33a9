//! Protocol trait for peer-to-peer calls.
//!
//! The mesh core never talks to a socket directly; every remote operation
//! goes through [`MeshRpc`], so the same peer logic runs over an in-process
//! bus in tests and over a real transport in deployments. Implementations
//! return an error for any delivery failure; callers classify every error
//! as an unreachable peer and react by scrubbing it from their tables.

use anyhow::Result;
use async_trait::async_trait;

use crate::id::{Id, PeerRef};
use crate::messages::{NeighborReply, TransferEntry};

/// Remote operations exposed by every mesh peer.
#[async_trait]
pub trait MeshRpc: Send + Sync + 'static {
    /// Identify the peer at `to`; returns its canonical descriptor.
    async fn hello(&self, to: &PeerRef) -> Result<PeerRef>;

    /// Ask `to` for the next peer on the path toward `target`'s root.
    /// `None` means `to` is the root.
    async fn get_next_hop(&self, to: &PeerRef, target: Id) -> Result<Option<PeerRef>>;

    /// Register `replica` as a holder of `key` at `to`. Returns whether
    /// `to` is the key's root; a `false` reply means stale routing state
    /// and the caller must re-resolve.
    async fn register(&self, to: &PeerRef, key: &str, replica: PeerRef) -> Result<bool>;

    /// Read the replica set for `key` from `to`. Returns `(is_root,
    /// replicas)`; a non-root peer answers with an empty set.
    async fn fetch(&self, to: &PeerRef, key: &str) -> Result<(bool, Vec<PeerRef>)>;

    /// Tell `to` to scrub the given peers from its tables and backpointer
    /// sets.
    async fn remove_bad_nodes(&self, to: &PeerRef, peers: Vec<PeerRef>) -> Result<()>;

    /// Announce `joiner` to gateway `to`; the gateway inserts it and
    /// returns its neighbor set at the shared-prefix level.
    async fn add_node(&self, to: &PeerRef, joiner: PeerRef) -> Result<NeighborReply>;

    /// One step of the join fan-out: `to` inserts `joiner` and returns its
    /// row at `level`.
    async fn add_node_multicast(
        &self,
        to: &PeerRef,
        joiner: PeerRef,
        level: usize,
    ) -> Result<NeighborReply>;

    /// Hand off directory entries from `from` to `to`.
    async fn transfer(&self, to: &PeerRef, from: PeerRef, entries: Vec<TransferEntry>)
        -> Result<()>;

    /// Record at `to` that `from` holds it as a routing entry.
    async fn add_backpointer(&self, to: &PeerRef, from: PeerRef) -> Result<()>;

    /// Remove `from` from `to`'s backpointer sets.
    async fn remove_backpointer(&self, to: &PeerRef, from: PeerRef) -> Result<()>;

    /// Read `to`'s backpointer set at `level`.
    async fn get_backpointers(
        &self,
        to: &PeerRef,
        from: PeerRef,
        level: usize,
    ) -> Result<Vec<PeerRef>>;

    /// Tell `to` that `from` is departing; `replacement` may refill the
    /// vacated table slot.
    async fn notify_leave(
        &self,
        to: &PeerRef,
        from: PeerRef,
        replacement: Option<PeerRef>,
    ) -> Result<()>;

    /// Read payload bytes for `key` from `to`'s local store. `None` means
    /// not found.
    async fn blob_fetch(&self, to: &PeerRef, key: &str) -> Result<Option<Vec<u8>>>;

    /// Full lookup driven by member `to`: route to the root and return the
    /// replica set.
    async fn mesh_lookup(&self, to: &PeerRef, key: &str) -> Result<Vec<PeerRef>>;

    /// Store payload at member `to` and publish it to the mesh.
    async fn mesh_store(&self, to: &PeerRef, key: &str, value: Vec<u8>) -> Result<()>;
}
