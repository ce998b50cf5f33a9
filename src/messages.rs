//! Wire vocabulary for peer-to-peer calls.
//!
//! Messages are serialized with bincode under a size limit so a transport
//! never allocates unbounded buffers for a hostile frame. The concrete
//! transport is pluggable (see `protocols`); this module only fixes the
//! request/response shapes every transport shares.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::id::{Id, PeerRef};

/// Maximum size of a stored payload (1 MiB). Larger objects should be
/// chunked by the application before storing.
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization; slightly larger than
/// [`MAX_VALUE_SIZE`] to allow for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_VALUE_SIZE as u64) + 4096;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Serialize a message for the wire.
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize with the size bound enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// One replica pointer as carried during a directory handoff. Expiry is
/// transmitted as remaining lifetime so peers need no shared clock.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaRecord {
    pub peer: PeerRef,
    pub ttl_ms: u64,
}

/// Directory entries for one key, as carried by a transfer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferEntry {
    pub key: String,
    pub replicas: Vec<ReplicaRecord>,
}

/// Reply to the join calls: whether the answering peer now holds the
/// joiner in its table, and the requested routing row.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NeighborReply {
    pub added: bool,
    pub peers: Vec<PeerRef>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MeshRequest {
    Hello,
    GetNextHop {
        target: Id,
    },
    Register {
        key: String,
        replica: PeerRef,
    },
    Fetch {
        key: String,
    },
    RemoveBadNodes {
        peers: Vec<PeerRef>,
    },
    AddNode {
        joiner: PeerRef,
    },
    AddNodeMulticast {
        joiner: PeerRef,
        level: usize,
    },
    Transfer {
        from: PeerRef,
        entries: Vec<TransferEntry>,
    },
    AddBackpointer {
        from: PeerRef,
    },
    RemoveBackpointer {
        from: PeerRef,
    },
    GetBackpointers {
        from: PeerRef,
        level: usize,
    },
    NotifyLeave {
        from: PeerRef,
        replacement: Option<PeerRef>,
    },
    BlobFetch {
        key: String,
    },
    MeshLookup {
        key: String,
    },
    MeshStore {
        key: String,
        value: Vec<u8>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MeshResponse {
    Hello { peer: PeerRef },
    NextHop { next: Option<PeerRef> },
    Registered { is_root: bool },
    Fetched { is_root: bool, replicas: Vec<PeerRef> },
    Neighbors(NeighborReply),
    Backpointers { peers: Vec<PeerRef> },
    Blob { value: Option<Vec<u8>> },
    Located { replicas: Vec<PeerRef> },
    Ack,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::IdSpace;
    use std::net::SocketAddr;

    fn peer() -> PeerRef {
        let space = IdSpace::new(16, 8);
        PeerRef::new(
            space.parse("0123abcd").unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 9000)),
        )
    }

    #[test]
    fn request_roundtrip() {
        let req = MeshRequest::GetNextHop { target: peer().id };
        let bytes = serialize(&req).unwrap();
        let back: MeshRequest = deserialize_bounded(&bytes).unwrap();
        match back {
            MeshRequest::GetNextHop { target } => assert_eq!(target, peer().id),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn response_roundtrip() {
        let rsp = MeshResponse::Neighbors(NeighborReply {
            added: true,
            peers: vec![peer()],
        });
        let bytes = serialize(&rsp).unwrap();
        let back: MeshResponse = deserialize_bounded(&bytes).unwrap();
        match back {
            MeshResponse::Neighbors(reply) => {
                assert!(reply.added);
                assert_eq!(reply.peers, vec![peer()]);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn deserialize_rejects_oversized_payload() {
        let req = MeshRequest::MeshStore {
            key: "big".into(),
            value: vec![0u8; MAX_VALUE_SIZE + 8192],
        };
        let bytes = bincode::serialize(&req).unwrap();
        assert!(deserialize_bounded::<MeshRequest>(&bytes).is_err());
    }
}
