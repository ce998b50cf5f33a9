//! Object location directory.
//!
//! Each peer owns the directory entries for the keys it currently roots: a
//! map from key to replica pointers with per-pointer expiry. Entries are
//! created and refreshed by registration traffic, removed by the periodic
//! expiry sweep, and migrate between peers when root assignment changes
//! (leave handoff and join-time redistribution).
//!
//! The directory never holds payload bytes, only locations.

use std::collections::HashMap;

use tokio::time::{Duration, Instant};

use crate::id::{Id, PeerRef};
use crate::messages::{ReplicaRecord, TransferEntry};

/// One live replica pointer.
#[derive(Debug, Clone)]
pub struct Replica {
    pub peer: PeerRef,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct ObjectDirectory {
    ttl: Duration,
    entries: HashMap<String, HashMap<Id, Replica>>,
}

impl ObjectDirectory {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Insert or refresh a replica pointer for `key`.
    ///
    /// Deduplicates by replica identifier: registering the same replica
    /// again resets its expiry instead of adding a second pointer.
    pub fn register(&mut self, key: &str, replica: PeerRef) {
        let expires_at = Instant::now() + self.ttl;
        self.entries
            .entry(key.to_string())
            .or_default()
            .insert(replica.id.clone(), Replica { peer: replica, expires_at });
    }

    /// Current non-expired replica set for `key`.
    pub fn fetch(&self, key: &str) -> Vec<PeerRef> {
        let now = Instant::now();
        self.entries
            .get(key)
            .map(|replicas| {
                replicas
                    .values()
                    .filter(|r| r.expires_at > now)
                    .map(|r| r.peer.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop expired pointers and keys left without any pointer. Returns the
    /// number of pointers removed.
    pub fn sweep_expired(&mut self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, replicas| {
            let before = replicas.len();
            replicas.retain(|_, r| r.expires_at > now);
            removed += before - replicas.len();
            !replicas.is_empty()
        });
        removed
    }

    /// Merge handed-off entries. On a duplicate (key, replica) pair the
    /// later expiry wins, so a handoff can never shorten a pointer's life.
    pub fn merge(&mut self, entries: Vec<TransferEntry>) {
        let now = Instant::now();
        for entry in entries {
            let replicas = self.entries.entry(entry.key).or_default();
            for record in entry.replicas {
                let expires_at = now + Duration::from_millis(record.ttl_ms);
                match replicas.get_mut(&record.peer.id) {
                    Some(existing) => {
                        if expires_at > existing.expires_at {
                            existing.expires_at = expires_at;
                            existing.peer = record.peer;
                        }
                    }
                    None => {
                        replicas.insert(
                            record.peer.id.clone(),
                            Replica {
                                peer: record.peer,
                                expires_at,
                            },
                        );
                    }
                }
            }
        }
    }

    /// Remove and return every non-expired entry, for a departing root's
    /// handoff.
    pub fn drain(&mut self) -> Vec<TransferEntry> {
        let keys: Vec<String> = self.entries.keys().cloned().collect();
        self.drain_keys(keys)
    }

    /// Remove and return the non-expired entries for keys matched by
    /// `pred`, for join-time redistribution.
    pub fn drain_matching(&mut self, pred: impl Fn(&str) -> bool) -> Vec<TransferEntry> {
        let keys: Vec<String> = self
            .entries
            .keys()
            .filter(|key| pred(key))
            .cloned()
            .collect();
        self.drain_keys(keys)
    }

    fn drain_keys(&mut self, keys: Vec<String>) -> Vec<TransferEntry> {
        let now = Instant::now();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(replicas) = self.entries.remove(&key) else {
                continue;
            };
            let records: Vec<ReplicaRecord> = replicas
                .into_values()
                .filter(|r| r.expires_at > now)
                .map(|r| ReplicaRecord {
                    peer: r.peer,
                    ttl_ms: r.expires_at.duration_since(now).as_millis() as u64,
                })
                .collect();
            if !records.is_empty() {
                out.push(TransferEntry { key, replicas: records });
            }
        }
        out
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    fn expiry_of(&self, key: &str, replica: &Id) -> Option<Instant> {
        self.entries.get(key)?.get(replica).map(|r| r.expires_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::IdSpace;
    use std::net::SocketAddr;
    use tokio::time::advance;

    fn peer(seed: u8) -> PeerRef {
        let space = IdSpace::new(16, 8);
        let id = space.parse(&format!("{seed:08x}")).unwrap();
        PeerRef::new(id, SocketAddr::from(([127, 0, 0, 1], 9000 + seed as u16)))
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_registration_refreshes_without_duplicating() {
        let mut dir = ObjectDirectory::new(Duration::from_secs(10));
        let p = peer(1);
        dir.register("x", p.clone());
        let first = dir.expiry_of("x", &p.id).unwrap();

        advance(Duration::from_secs(4)).await;
        dir.register("x", p.clone());
        let second = dir.expiry_of("x", &p.id).unwrap();

        assert!(second > first);
        assert_eq!(dir.fetch("x"), vec![p]);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_skips_expired_and_sweep_removes_them() {
        let mut dir = ObjectDirectory::new(Duration::from_secs(5));
        dir.register("x", peer(1));
        advance(Duration::from_secs(3)).await;
        dir.register("x", peer(2));
        advance(Duration::from_secs(3)).await;

        // peer(1) expired at t=5, peer(2) lives until t=8.
        assert_eq!(dir.fetch("x"), vec![peer(2)]);

        assert_eq!(dir.sweep_expired(), 1);
        assert_eq!(dir.len(), 1);

        advance(Duration::from_secs(3)).await;
        assert!(dir.fetch("x").is_empty());
        assert_eq!(dir.sweep_expired(), 1);
        assert!(dir.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn merge_prefers_later_expiry() {
        let mut dir = ObjectDirectory::new(Duration::from_secs(5));
        let p = peer(1);
        dir.register("x", p.clone());

        // An incoming record with a shorter remaining lifetime must not
        // clobber the fresher local pointer.
        dir.merge(vec![TransferEntry {
            key: "x".into(),
            replicas: vec![ReplicaRecord {
                peer: p.clone(),
                ttl_ms: 1_000,
            }],
        }]);
        let kept = dir.expiry_of("x", &p.id).unwrap();
        assert_eq!(kept, Instant::now() + Duration::from_secs(5));

        // A longer one wins.
        dir.merge(vec![TransferEntry {
            key: "x".into(),
            replicas: vec![ReplicaRecord {
                peer: p.clone(),
                ttl_ms: 60_000,
            }],
        }]);
        assert_eq!(
            dir.expiry_of("x", &p.id).unwrap(),
            Instant::now() + Duration::from_secs(60)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn drain_carries_remaining_lifetime() {
        let mut dir = ObjectDirectory::new(Duration::from_secs(10));
        dir.register("x", peer(1));
        dir.register("y", peer(2));
        advance(Duration::from_secs(4)).await;

        let mut entries = dir.drain();
        assert!(dir.is_empty());
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "x");
        assert_eq!(entries[0].replicas[0].ttl_ms, 6_000);

        // Merging into a fresh directory restores the same remaining life.
        let mut other = ObjectDirectory::new(Duration::from_secs(10));
        other.merge(entries);
        assert_eq!(other.fetch("x"), vec![peer(1)]);
        assert_eq!(other.fetch("y"), vec![peer(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_matching_takes_only_matched_keys() {
        let mut dir = ObjectDirectory::new(Duration::from_secs(10));
        dir.register("keep", peer(1));
        dir.register("move", peer(2));

        let entries = dir.drain_matching(|key| key == "move");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "move");
        assert_eq!(dir.keys(), vec!["keep".to_string()]);
    }
}
