//! # Arras - Prefix-Routed Object Location Mesh
//!
//! Arras is a structured peer-to-peer overlay in which every peer owns a
//! fixed-length digit identifier and routes by longest shared prefix. The
//! peer whose identifier is the surrogate match for a key's hash is that
//! key's **root**: it keeps the directory of replica holders, so any
//! member can resolve a key by walking at most one hop per digit.
//!
//! ## Architecture
//!
//! Concurrency follows the **Actor Pattern**:
//! - [`MeshNode`] is a cheap-to-clone handle over a private actor task
//! - The actor owns the routing table, backpointer sets, and directory
//! - All mutations flow through a command channel; no lock spans an await
//!
//! Remote calls go through the [`MeshRpc`] trait, so the same peer logic
//! runs over the in-process [`LocalBus`] in tests and over a real
//! transport in deployments.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `id` | Identifier space geometry, digit identifiers, peer descriptors |
//! | `routing` | Routing table, surrogate next-hop selection, backpointers |
//! | `directory` | Per-root replica pointer directory with TTL expiry |
//! | `store` | Local payload storage behind the `BlobStore` trait |
//! | `node` | Mesh peer: join, leave, publish, lookup, failure handling |
//! | `client` | Non-member access through any one mesh member |
//! | `protocols` | The `MeshRpc` trait every transport implements |
//! | `messages` | Wire types and bounded serialization |
//! | `transport` | In-process `LocalBus` transport |

mod client;
mod directory;
mod id;
mod messages;
mod node;
mod protocols;
mod routing;
mod store;
mod transport;

pub use client::{AggregateFetchError, KeyNotFound, MeshClient};
pub use id::{
    Id, IdSpace, MalformedIdentifier, MalformedReason, PeerRef, DEFAULT_BASE, DEFAULT_DIGITS,
};
pub use messages::{
    MeshRequest, MeshResponse, NeighborReply, ReplicaRecord, TransferEntry, MAX_VALUE_SIZE,
};
pub use node::{MeshConfig, MeshNode, MeshSnapshot, RootInconsistency};
pub use protocols::MeshRpc;
pub use store::{BlobStore, MemoryBlobStore};
pub use transport::LocalBus;
