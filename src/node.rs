//! Mesh peer: the actor owning routing state and the handle around it.
//!
//! A [`MeshNode`] is a cheaply clonable handle over a private actor task.
//! The actor owns the routing table, the backpointer sets, and the object
//! directory; every mutation flows through its command channel, so no lock
//! is ever held across an await. The handle carries the peer's own
//! descriptor, the shared configuration, the [`MeshRpc`] network, and the
//! local blob store, and implements the multi-hop operations (joining,
//! root resolution, publish, lookup, departure) on top of the actor's
//! single-step queries.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, ensure, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::directory::ObjectDirectory;
use crate::id::{Id, IdSpace, PeerRef};
use crate::messages::{NeighborReply, TransferEntry, MAX_VALUE_SIZE};
use crate::protocols::MeshRpc;
use crate::routing::{Backpointers, RoutingTable, SlotOutcome};
use crate::store::BlobStore;

const COMMAND_BUFFER: usize = 128;

/// Tunables for one mesh peer. Every peer in a mesh must agree on
/// `space`; the rest is local policy.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Identifier geometry shared by the whole mesh.
    pub space: IdSpace,
    /// Peers kept per routing table cell.
    pub slot_size: usize,
    /// Lifetime of a replica pointer in the object directory.
    pub object_ttl: Duration,
    /// How often locally stored keys are re-published. Must stay well
    /// under `object_ttl` or pointers lapse between refreshes.
    pub republish_interval: Duration,
    /// How often the directory is swept for expired pointers.
    pub expiry_sweep_interval: Duration,
    /// Deadline for a single remote call.
    pub rpc_timeout: Duration,
    /// Concurrent calls per join fan-out wave.
    pub multicast_parallelism: usize,
    /// Attempts for the departure directory handoff.
    pub transfer_retries: usize,
    /// Initial backoff between handoff attempts; doubles per retry.
    pub transfer_backoff: Duration,
    /// Fresh routing walks attempted before giving up on a root.
    pub route_retries: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            space: IdSpace::default(),
            slot_size: 3,
            object_ttl: Duration::from_secs(10),
            republish_interval: Duration::from_secs(3),
            expiry_sweep_interval: Duration::from_secs(1),
            rpc_timeout: Duration::from_secs(2),
            multicast_parallelism: 8,
            transfer_retries: 3,
            transfer_backoff: Duration::from_millis(100),
            route_retries: 3,
        }
    }
}

/// Routing could not settle on a single live root for a key within the
/// configured number of fresh walks. Transient under churn; callers may
/// retry later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootInconsistency {
    /// The key's identifier in the mesh space.
    pub target: String,
}

impl fmt::Display for RootInconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no consistent root found for target {}", self.target)
    }
}

impl std::error::Error for RootInconsistency {}

/// Point-in-time copy of a peer's routing state, for inspection.
#[derive(Debug, Clone, Default)]
pub struct MeshSnapshot {
    pub routes: Vec<PeerRef>,
    pub backpointers: Vec<(usize, Vec<PeerRef>)>,
    pub directory_keys: Vec<String>,
}

enum Command {
    NextHop {
        target: Id,
        reply: oneshot::Sender<Option<PeerRef>>,
    },
    Insert {
        peer: PeerRef,
        reply: oneshot::Sender<SlotOutcome>,
    },
    Scrub {
        ids: Vec<Id>,
        reply: oneshot::Sender<()>,
    },
    Row {
        level: usize,
        reply: oneshot::Sender<Vec<PeerRef>>,
    },
    RowsFrom {
        level: usize,
        reply: oneshot::Sender<Vec<PeerRef>>,
    },
    SubstituteAbove {
        level: usize,
        reply: oneshot::Sender<Option<PeerRef>>,
    },
    ClosestNeighbor {
        reply: oneshot::Sender<Option<PeerRef>>,
    },
    AddBackpointer {
        peer: PeerRef,
        reply: oneshot::Sender<()>,
    },
    RemoveBackpointer {
        id: Id,
        reply: oneshot::Sender<()>,
    },
    BackpointersAt {
        level: usize,
        reply: oneshot::Sender<Vec<PeerRef>>,
    },
    BackpointerLevels {
        reply: oneshot::Sender<Vec<(usize, Vec<PeerRef>)>>,
    },
    FindBackpointerAt {
        level: usize,
        digit: u8,
        reply: oneshot::Sender<Option<PeerRef>>,
    },
    RegisterObject {
        key: String,
        replica: PeerRef,
        reply: oneshot::Sender<bool>,
    },
    FetchObject {
        key: String,
        reply: oneshot::Sender<(bool, Vec<PeerRef>)>,
    },
    MergeEntries {
        entries: Vec<TransferEntry>,
    },
    DrainDirectory {
        reply: oneshot::Sender<Vec<TransferEntry>>,
    },
    DrainRoutedTo {
        peer: PeerRef,
        reply: oneshot::Sender<Vec<TransferEntry>>,
    },
    SweepExpired,
    Snapshot {
        reply: oneshot::Sender<MeshSnapshot>,
    },
    Shutdown,
}

/// Handle to a running mesh peer.
pub struct MeshNode<N: MeshRpc> {
    peer: PeerRef,
    config: Arc<MeshConfig>,
    network: Arc<N>,
    blobs: Arc<dyn BlobStore>,
    cmd_tx: mpsc::Sender<Command>,
}

impl<N: MeshRpc> Clone for MeshNode<N> {
    fn clone(&self) -> Self {
        Self {
            peer: self.peer.clone(),
            config: Arc::clone(&self.config),
            network: Arc::clone(&self.network),
            blobs: Arc::clone(&self.blobs),
            cmd_tx: self.cmd_tx.clone(),
        }
    }
}

impl<N: MeshRpc> MeshNode<N> {
    /// Spawn the actor and maintenance tasks for a new peer. Must run
    /// inside a tokio runtime.
    pub fn new(peer: PeerRef, config: MeshConfig, network: N, blobs: Arc<dyn BlobStore>) -> Self {
        assert!(
            config.space.contains(&peer.id),
            "peer identifier must fit the configured space"
        );
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = MeshActor {
            peer: peer.clone(),
            space: config.space,
            table: RoutingTable::new(peer.id.clone(), config.space, config.slot_size),
            backpointers: Backpointers::new(peer.id.clone(), config.space),
            directory: ObjectDirectory::new(config.object_ttl),
            cmd_rx,
        };
        tokio::spawn(actor.run());
        let node = Self {
            peer,
            config: Arc::new(config),
            network: Arc::new(network),
            blobs,
            cmd_tx,
        };
        node.spawn_maintenance();
        node
    }

    pub fn peer(&self) -> &PeerRef {
        &self.peer
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Stop the actor. In-flight handle calls resolve to defaults.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }

    // ------------------------------------------------------------------
    // Multi-hop operations.
    // ------------------------------------------------------------------

    /// Enter the mesh through `gateway`: resolve our own surrogate root,
    /// announce ourselves to it, fan the announcement out level by level
    /// through the root's prefix region, then backfill shallow table
    /// levels by walking backpointer sets downward.
    pub async fn join(&self, gateway: &PeerRef) -> Result<()> {
        if gateway.id == self.peer.id {
            bail!("cannot join through self");
        }
        self.config.space.validate(&gateway.id)?;
        info!(peer = %self.peer, gateway = %gateway, "joining mesh");

        // Admission goes through our surrogate root, not the gateway: the
        // root shares the longest prefix any member shares with us, so its
        // region is exactly the set of peers whose routing we affect.
        let root = self.resolve_root_via(gateway, &self.peer.id).await?;
        ensure!(
            root.id != self.peer.id,
            "identifier collision with an existing peer"
        );
        let start_level = self.peer.id.shared_prefix_len(&root.id);
        let reply = self
            .rpc(self.network.add_node(&root, self.peer.clone()))
            .await?;
        if reply.added {
            self.record_backpointer(root.clone()).await;
        }
        let mut known: HashMap<Id, PeerRef> = HashMap::new();
        known.insert(root.id.clone(), root);
        for peer in reply.peers {
            if peer.id != self.peer.id {
                known.insert(peer.id.clone(), peer);
            }
        }

        let digits = self.config.space.digits();
        for level in start_level..digits {
            let wave: Vec<PeerRef> = known
                .values()
                .filter(|p| p.id.shared_prefix_len(&self.peer.id) >= level)
                .cloned()
                .collect();
            if wave.is_empty() {
                break;
            }
            trace!(level, contacts = wave.len(), "join fan-out");
            for chunk in wave.chunks(self.config.multicast_parallelism.max(1)) {
                let mut calls = JoinSet::new();
                for contact in chunk.iter().cloned() {
                    let network = Arc::clone(&self.network);
                    let joiner = self.peer.clone();
                    let deadline = self.config.rpc_timeout;
                    calls.spawn(async move {
                        let outcome =
                            match timeout(deadline, network.add_node_multicast(&contact, joiner, level))
                                .await
                            {
                                Ok(res) => res,
                                Err(_) => Err(anyhow!("add_node_multicast timed out")),
                            };
                        (contact, outcome)
                    });
                }
                while let Some(finished) = calls.join_next().await {
                    let Ok((contact, outcome)) = finished else {
                        continue;
                    };
                    match outcome {
                        Ok(reply) => {
                            if reply.added {
                                self.record_backpointer(contact).await;
                            }
                            for peer in reply.peers {
                                if peer.id != self.peer.id {
                                    known.entry(peer.id.clone()).or_insert(peer);
                                }
                            }
                        }
                        Err(err) => {
                            debug!(peer = %contact, level, error = %err, "join contact unreachable, skipping")
                        }
                    }
                }
            }
        }

        // Peers outside the root's prefix region were not in the fan-out.
        // A holder of a known peer at level L shares exactly L digits with
        // us too, so walking backpointer sets downward fills the rows the
        // multicast could not.
        let mut level = start_level;
        while level > 0 {
            level -= 1;
            let contacts: Vec<PeerRef> = known.values().cloned().collect();
            for contact in contacts {
                match self
                    .rpc(self.network.get_backpointers(&contact, self.peer.clone(), level))
                    .await
                {
                    Ok(peers) => {
                        for peer in peers {
                            if peer.id != self.peer.id {
                                known.entry(peer.id.clone()).or_insert(peer);
                            }
                        }
                    }
                    Err(err) => {
                        debug!(peer = %contact, level, error = %err, "backpointer walk skipped a peer")
                    }
                }
            }
        }

        let seeded = known.len();
        for peer in known.into_values() {
            self.add_route(peer).await;
        }
        info!(peer = %self.peer, seeded, "join complete");
        Ok(())
    }

    /// Walk next-hop pointers toward `target` starting from a remote
    /// peer, for callers whose own table cannot seed the walk yet.
    async fn resolve_root_via(&self, start: &PeerRef, target: &Id) -> Result<PeerRef> {
        let digits = self.config.space.digits();
        let mut current = start.clone();
        let mut visited: HashSet<Id> = HashSet::new();
        visited.insert(current.id.clone());
        loop {
            match self
                .rpc(self.network.get_next_hop(&current, target.clone()))
                .await?
            {
                None => return Ok(current),
                Some(next) => {
                    if visited.len() > digits || !visited.insert(next.id.clone()) {
                        return Err(RootInconsistency {
                            target: target.to_string(),
                        }
                        .into());
                    }
                    current = next;
                }
            }
        }
    }

    /// Depart cleanly: hand the directory to the closest neighbor, then
    /// tell every peer holding us to drop or replace the entry, then stop.
    /// A failed handoff aborts the departure with the directory intact.
    pub async fn leave(&self) -> Result<()> {
        info!(peer = %self.peer, "leaving mesh");
        let entries = self.drain_directory().await;
        if !entries.is_empty() {
            match self.closest_neighbor().await {
                Some(successor) => self.transfer_with_retry(&successor, entries).await?,
                None => {
                    debug!(count = entries.len(), "no successor for directory handoff, entries lapse")
                }
            }
        }
        for (level, holders) in self.backpointer_levels().await {
            let replacement = self.substitute_above(level).await;
            for holder in holders {
                if let Err(err) = self
                    .rpc(self.network.notify_leave(&holder, self.peer.clone(), replacement.clone()))
                    .await
                {
                    debug!(holder = %holder, error = %err, "holder unreachable during leave");
                }
            }
        }
        self.shutdown().await;
        info!(peer = %self.peer, "departed");
        Ok(())
    }

    async fn transfer_with_retry(
        &self,
        successor: &PeerRef,
        entries: Vec<TransferEntry>,
    ) -> Result<()> {
        let attempts = self.config.transfer_retries.max(1);
        let mut delay = self.config.transfer_backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .rpc(self.network.transfer(successor, self.peer.clone(), entries.clone()))
                .await
            {
                Ok(()) => {
                    debug!(count = entries.len(), to = %successor, "directory handed off");
                    return Ok(());
                }
                Err(err) if attempt < attempts => {
                    warn!(to = %successor, error = %err, attempt, "directory handoff failed, backing off");
                    sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(err) => {
                    self.merge_entries(entries).await;
                    return Err(err.context("directory handoff failed, peer stays in the mesh"));
                }
            }
        }
    }

    /// Resolve the root peer for `target` by walking next-hop pointers.
    /// Unreachable hops are scrubbed and reported to the previous hop,
    /// then the walk restarts from scratch; so does a detected cycle.
    pub async fn find_root(&self, target: &Id) -> Result<PeerRef> {
        self.config.space.validate(target)?;
        let digits = self.config.space.digits();
        'attempt: for _ in 0..self.config.route_retries.max(1) {
            let mut current = self.peer.clone();
            let mut previous: Option<PeerRef> = None;
            let mut visited: HashSet<Id> = HashSet::new();
            visited.insert(current.id.clone());
            loop {
                let hop = if current.id == self.peer.id {
                    Ok(self.next_hop(target.clone()).await)
                } else {
                    self.rpc(self.network.get_next_hop(&current, target.clone()))
                        .await
                };
                match hop {
                    Ok(None) => return Ok(current),
                    Ok(Some(next)) => {
                        if visited.len() > digits || !visited.insert(next.id.clone()) {
                            debug!(target = %target.short(), "route revisited a peer, restarting walk");
                            continue 'attempt;
                        }
                        previous = Some(std::mem::replace(&mut current, next));
                    }
                    Err(err) => {
                        warn!(peer = %current, error = %err, "hop unreachable, scrubbing and restarting walk");
                        self.scrub(vec![current.clone()]).await;
                        if let Some(prev) = previous.filter(|p| p.id != self.peer.id) {
                            let network = Arc::clone(&self.network);
                            let bad = vec![current.clone()];
                            let deadline = self.config.rpc_timeout;
                            tokio::spawn(async move {
                                let _ = timeout(deadline, network.remove_bad_nodes(&prev, bad)).await;
                            });
                        }
                        continue 'attempt;
                    }
                }
            }
        }
        Err(RootInconsistency {
            target: target.to_string(),
        }
        .into())
    }

    /// Publish this peer as a replica holder for `key` at the key's root.
    /// A root that answers "not root" means its state moved under us; the
    /// root is re-resolved a bounded number of times.
    pub async fn publish(&self, key: &str) -> Result<()> {
        let target = self.config.space.hash_key(key);
        for _ in 0..self.config.route_retries.max(1) {
            let root = self.find_root(&target).await?;
            if root.id == self.peer.id {
                if self.handle_register(key, self.peer.clone()).await? {
                    return Ok(());
                }
            } else {
                match self
                    .rpc(self.network.register(&root, key, self.peer.clone()))
                    .await
                {
                    Ok(true) => {
                        trace!(key, root = %root, "published");
                        return Ok(());
                    }
                    Ok(false) => debug!(key, root = %root, "register bounced, re-resolving root"),
                    Err(err) => {
                        debug!(root = %root, error = %err, "root unreachable during publish, scrubbing");
                        self.scrub(vec![root]).await;
                    }
                }
            }
        }
        Err(RootInconsistency {
            target: target.to_string(),
        }
        .into())
    }

    /// Resolve the replica holders for `key`. An empty set means the key
    /// is unknown to its root.
    pub async fn lookup(&self, key: &str) -> Result<Vec<PeerRef>> {
        let target = self.config.space.hash_key(key);
        for _ in 0..self.config.route_retries.max(1) {
            let root = self.find_root(&target).await?;
            if root.id == self.peer.id {
                let (is_root, replicas) = self.handle_fetch(key).await;
                if is_root {
                    return Ok(replicas);
                }
            } else {
                match self.rpc(self.network.fetch(&root, key)).await {
                    Ok((true, replicas)) => return Ok(replicas),
                    Ok((false, _)) => debug!(key, root = %root, "fetch bounced, re-resolving root"),
                    Err(err) => {
                        debug!(root = %root, error = %err, "root unreachable during lookup, scrubbing");
                        self.scrub(vec![root]).await;
                    }
                }
            }
        }
        Err(RootInconsistency {
            target: target.to_string(),
        }
        .into())
    }

    /// Store payload bytes locally and publish this peer as a holder.
    pub async fn store(&self, key: &str, value: Vec<u8>) -> Result<()> {
        ensure!(
            value.len() <= MAX_VALUE_SIZE,
            "value for {key:?} exceeds {MAX_VALUE_SIZE} bytes"
        );
        self.blobs.put(key, value);
        self.publish(key).await
    }

    /// Offer a peer to the routing table, keeping backpointers symmetric:
    /// a newly added peer is told it now holds us, and a displaced peer is
    /// told it no longer does. An unreachable new peer is dropped again.
    pub async fn add_route(&self, peer: PeerRef) {
        if peer.id == self.peer.id {
            return;
        }
        let outcome = self.offer_route(peer.clone()).await;
        if let SlotOutcome::Added { .. } = outcome {
            if let Err(err) = self
                .rpc(self.network.add_backpointer(&peer, self.peer.clone()))
                .await
            {
                debug!(peer = %peer, error = %err, "new route unreachable, dropping it");
                self.scrub(vec![peer]).await;
            }
        }
    }

    /// Drop peers from the table and backpointer sets without notifying
    /// them. For peers presumed dead.
    pub async fn scrub(&self, peers: Vec<PeerRef>) {
        let ids: Vec<Id> = peers.into_iter().map(|p| p.id).collect();
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Scrub { ids, reply: tx }).await;
        let _ = rx.await;
    }

    pub async fn snapshot(&self) -> MeshSnapshot {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Snapshot { reply: tx }).await;
        rx.await.unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Call handlers, invoked by the transport on inbound requests.
    // ------------------------------------------------------------------

    pub fn handle_hello(&self) -> PeerRef {
        self.peer.clone()
    }

    pub async fn handle_get_next_hop(&self, target: Id) -> Result<Option<PeerRef>> {
        self.config.space.validate(&target)?;
        Ok(self.next_hop(target).await)
    }

    /// Record `replica` as a holder of `key` if this peer is the key's
    /// root. Returns whether it is; a `false` reply tells the caller its
    /// routing state is stale.
    pub async fn handle_register(&self, key: &str, replica: PeerRef) -> Result<bool> {
        self.config.space.validate(&replica.id)?;
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(Command::RegisterObject {
                key: key.to_string(),
                replica,
                reply: tx,
            })
            .await;
        Ok(rx.await.unwrap_or_default())
    }

    pub async fn handle_fetch(&self, key: &str) -> (bool, Vec<PeerRef>) {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(Command::FetchObject {
                key: key.to_string(),
                reply: tx,
            })
            .await;
        rx.await.unwrap_or_default()
    }

    pub async fn handle_remove_bad_nodes(&self, peers: Vec<PeerRef>) {
        self.scrub(peers).await;
    }

    /// Admission half of a join, run by the joiner's surrogate root:
    /// insert the joiner and return every entry at the shared-prefix
    /// level and deeper, seeding the joiner's fan-out.
    pub async fn handle_add_node(&self, joiner: PeerRef) -> Result<NeighborReply> {
        self.config.space.validate(&joiner.id)?;
        if joiner.id == self.peer.id {
            return Ok(NeighborReply::default());
        }
        let level = self.peer.id.shared_prefix_len(&joiner.id);
        debug!(joiner = %joiner, level, "admitting joiner");
        let peers: Vec<PeerRef> = self
            .rows_from(level)
            .await
            .into_iter()
            .filter(|p| p.id != joiner.id)
            .collect();
        let outcome = self.offer_route(joiner).await;
        Ok(NeighborReply {
            added: outcome.holds(),
            peers,
        })
    }

    /// One step of the join fan-out: insert the joiner, return our row at
    /// `level`, and hand over any directory entries that now route to the
    /// joiner instead of us.
    pub async fn handle_add_node_multicast(
        &self,
        joiner: PeerRef,
        level: usize,
    ) -> Result<NeighborReply> {
        self.config.space.validate(&joiner.id)?;
        if level >= self.config.space.digits() || joiner.id == self.peer.id {
            return Ok(NeighborReply::default());
        }
        trace!(joiner = %joiner, level, "multicast step");
        let peers: Vec<PeerRef> = self
            .row(level)
            .await
            .into_iter()
            .filter(|p| p.id != joiner.id)
            .collect();
        let outcome = self.offer_route(joiner.clone()).await;

        let entries = self.drain_routed_to(joiner.clone()).await;
        if !entries.is_empty() {
            debug!(count = entries.len(), to = %joiner, "redistributing directory entries to joiner");
            let node = self.clone();
            tokio::spawn(async move {
                let result = node
                    .rpc(node.network.transfer(&joiner, node.peer.clone(), entries.clone()))
                    .await;
                if let Err(err) = result {
                    warn!(to = %joiner, error = %err, "redistribution failed, restoring entries");
                    node.merge_entries(entries).await;
                }
            });
        }
        Ok(NeighborReply {
            added: outcome.holds(),
            peers,
        })
    }

    /// Absorb directory entries handed over by `from`, and keep `from` as
    /// a route since it has proven itself live.
    pub async fn handle_transfer(&self, from: PeerRef, entries: Vec<TransferEntry>) {
        debug!(from = %from, count = entries.len(), "absorbing transferred directory entries");
        self.merge_entries(entries).await;
        self.add_route(from).await;
    }

    pub async fn handle_add_backpointer(&self, from: PeerRef) {
        self.record_backpointer(from).await;
    }

    pub async fn handle_remove_backpointer(&self, from: &PeerRef) {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(Command::RemoveBackpointer {
                id: from.id.clone(),
                reply: tx,
            })
            .await;
        let _ = rx.await;
    }

    pub async fn handle_get_backpointers(&self, from: &PeerRef, level: usize) -> Vec<PeerRef> {
        trace!(from = %from, level, "backpointer set requested");
        if level >= self.config.space.digits() {
            return Vec::new();
        }
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(Command::BackpointersAt { level, reply: tx })
            .await;
        rx.await.unwrap_or_default()
    }

    /// A peer we hold is departing. Drop it, and refill the vacated cell
    /// with the offered replacement, or failing that with a backpointer
    /// holder shaped for the cell.
    pub async fn handle_notify_leave(&self, from: PeerRef, replacement: Option<PeerRef>) {
        let level = self.peer.id.shared_prefix_len(&from.id);
        debug!(from = %from, level, "peer departing");
        let digit = (level < self.config.space.digits()).then(|| from.id.digit(level));
        self.scrub(vec![from]).await;
        let refill = match replacement {
            Some(peer) if peer.id != self.peer.id => Some(peer),
            Some(_) => None,
            None => match digit {
                Some(digit) => self.find_backpointer_at(level, digit).await,
                None => None,
            },
        };
        if let Some(candidate) = refill {
            self.add_route(candidate).await;
        }
    }

    pub fn handle_blob_fetch(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.get(key)
    }

    // ------------------------------------------------------------------
    // Actor queries.
    // ------------------------------------------------------------------

    async fn next_hop(&self, target: Id) -> Option<PeerRef> {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::NextHop { target, reply: tx }).await;
        rx.await.unwrap_or_default()
    }

    async fn offer_route(&self, peer: PeerRef) -> SlotOutcome {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Insert { peer, reply: tx }).await;
        let outcome = rx.await.unwrap_or(SlotOutcome::Rejected);
        if let SlotOutcome::Added {
            displaced: Some(displaced),
        } = &outcome
        {
            let network = Arc::clone(&self.network);
            let local = self.peer.clone();
            let displaced = displaced.clone();
            let deadline = self.config.rpc_timeout;
            tokio::spawn(async move {
                match timeout(deadline, network.remove_backpointer(&displaced, local)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        trace!(peer = %displaced, error = %err, "displaced peer unreachable for backpointer removal")
                    }
                    Err(_) => {
                        trace!(peer = %displaced, "backpointer removal timed out")
                    }
                }
            });
        }
        outcome
    }

    async fn record_backpointer(&self, peer: PeerRef) {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(Command::AddBackpointer { peer, reply: tx })
            .await;
        let _ = rx.await;
    }

    async fn row(&self, level: usize) -> Vec<PeerRef> {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Row { level, reply: tx }).await;
        rx.await.unwrap_or_default()
    }

    async fn rows_from(&self, level: usize) -> Vec<PeerRef> {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::RowsFrom { level, reply: tx }).await;
        rx.await.unwrap_or_default()
    }

    async fn substitute_above(&self, level: usize) -> Option<PeerRef> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(Command::SubstituteAbove { level, reply: tx })
            .await;
        rx.await.unwrap_or_default()
    }

    async fn closest_neighbor(&self) -> Option<PeerRef> {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::ClosestNeighbor { reply: tx }).await;
        rx.await.unwrap_or_default()
    }

    async fn backpointer_levels(&self) -> Vec<(usize, Vec<PeerRef>)> {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::BackpointerLevels { reply: tx }).await;
        rx.await.unwrap_or_default()
    }

    async fn find_backpointer_at(&self, level: usize, digit: u8) -> Option<PeerRef> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(Command::FindBackpointerAt { level, digit, reply: tx })
            .await;
        rx.await.unwrap_or_default()
    }

    async fn merge_entries(&self, entries: Vec<TransferEntry>) {
        let _ = self.cmd_tx.send(Command::MergeEntries { entries }).await;
    }

    async fn drain_directory(&self) -> Vec<TransferEntry> {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::DrainDirectory { reply: tx }).await;
        rx.await.unwrap_or_default()
    }

    async fn drain_routed_to(&self, peer: PeerRef) -> Vec<TransferEntry> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(Command::DrainRoutedTo { peer, reply: tx })
            .await;
        rx.await.unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Plumbing.
    // ------------------------------------------------------------------

    async fn rpc<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match timeout(self.config.rpc_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("call timed out after {:?}", self.config.rpc_timeout)),
        }
    }

    fn spawn_maintenance(&self) {
        let node = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(node.config.expiry_sweep_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if node.cmd_tx.is_closed() {
                    break;
                }
                let _ = node.cmd_tx.send(Command::SweepExpired).await;
            }
        });

        let node = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(node.config.republish_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh peer
            // does not republish before it has joined anything.
            tick.tick().await;
            loop {
                tick.tick().await;
                if node.cmd_tx.is_closed() {
                    break;
                }
                for key in node.blobs.keys() {
                    if let Err(err) = node.publish(&key).await {
                        debug!(key = %key, error = %err, "republish failed, retrying next cycle");
                    }
                }
            }
        });
    }
}

struct MeshActor {
    peer: PeerRef,
    space: IdSpace,
    table: RoutingTable,
    backpointers: Backpointers,
    directory: ObjectDirectory,
    cmd_rx: mpsc::Receiver<Command>,
}

impl MeshActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::NextHop { target, reply } => {
                    let _ = reply.send(self.table.next_hop(&target));
                }
                Command::Insert { peer, reply } => {
                    let _ = reply.send(self.table.insert(peer));
                }
                Command::Scrub { ids, reply } => {
                    for id in &ids {
                        let removed = self.table.remove(id);
                        self.backpointers.remove(id);
                        if removed {
                            trace!(peer = %self.peer, scrubbed = %id.short(), "route dropped");
                        }
                    }
                    let _ = reply.send(());
                }
                Command::Row { level, reply } => {
                    let _ = reply.send(self.table.row(level));
                }
                Command::RowsFrom { level, reply } => {
                    let _ = reply.send(self.table.rows_from(level));
                }
                Command::SubstituteAbove { level, reply } => {
                    let _ = reply.send(self.table.substitute_above(level));
                }
                Command::ClosestNeighbor { reply } => {
                    let _ = reply.send(self.table.closest_neighbor());
                }
                Command::AddBackpointer { peer, reply } => {
                    self.backpointers.add(peer);
                    let _ = reply.send(());
                }
                Command::RemoveBackpointer { id, reply } => {
                    self.backpointers.remove(&id);
                    let _ = reply.send(());
                }
                Command::BackpointersAt { level, reply } => {
                    let _ = reply.send(self.backpointers.at(level));
                }
                Command::BackpointerLevels { reply } => {
                    let _ = reply.send(self.backpointers.by_level());
                }
                Command::FindBackpointerAt { level, digit, reply } => {
                    let _ = reply.send(self.backpointers.find_at(level, digit));
                }
                Command::RegisterObject { key, replica, reply } => {
                    let target = self.space.hash_key(&key);
                    let is_root = self.table.next_hop(&target).is_none();
                    if is_root {
                        trace!(peer = %self.peer, key = %key, replica = %replica, "replica registered");
                        self.directory.register(&key, replica);
                    }
                    let _ = reply.send(is_root);
                }
                Command::FetchObject { key, reply } => {
                    let target = self.space.hash_key(&key);
                    let is_root = self.table.next_hop(&target).is_none();
                    // A non-root answer carries no replicas; whatever the
                    // directory still holds for the key is stale here.
                    let replicas = if is_root {
                        self.directory.fetch(&key)
                    } else {
                        Vec::new()
                    };
                    let _ = reply.send((is_root, replicas));
                }
                Command::MergeEntries { entries } => {
                    self.directory.merge(entries);
                }
                Command::DrainDirectory { reply } => {
                    let _ = reply.send(self.directory.drain());
                }
                Command::DrainRoutedTo { peer, reply } => {
                    let space = self.space;
                    let table = &self.table;
                    let entries = self.directory.drain_matching(|key| {
                        table
                            .next_hop(&space.hash_key(key))
                            .map(|next| next.id == peer.id)
                            .unwrap_or(false)
                    });
                    let _ = reply.send(entries);
                }
                Command::SweepExpired => {
                    let swept = self.directory.sweep_expired();
                    if swept > 0 {
                        trace!(peer = %self.peer, swept, "expired replica pointers dropped");
                    }
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(MeshSnapshot {
                        routes: self.table.all(),
                        backpointers: self.backpointers.by_level(),
                        directory_keys: self.directory.keys(),
                    });
                }
                Command::Shutdown => break,
            }
        }
        trace!(peer = %self.peer, "mesh actor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::MalformedIdentifier;
    use crate::store::MemoryBlobStore;
    use crate::transport::LocalBus;
    use std::net::SocketAddr;

    fn test_config() -> MeshConfig {
        MeshConfig {
            space: IdSpace::new(4, 6),
            slot_size: 2,
            object_ttl: Duration::from_secs(5),
            republish_interval: Duration::from_secs(600),
            expiry_sweep_interval: Duration::from_secs(600),
            rpc_timeout: Duration::from_millis(250),
            multicast_parallelism: 4,
            transfer_retries: 2,
            transfer_backoff: Duration::from_millis(10),
            route_retries: 3,
        }
    }

    fn peer_ref(id: &str, port: u16) -> PeerRef {
        let space = test_config().space;
        PeerRef::new(
            space.parse(id).unwrap(),
            SocketAddr::from(([127, 0, 0, 1], port)),
        )
    }

    async fn spawn_peer(bus: &LocalBus, id: &str, port: u16) -> MeshNode<LocalBus> {
        let node = MeshNode::new(
            peer_ref(id, port),
            test_config(),
            bus.clone(),
            Arc::new(MemoryBlobStore::new()),
        );
        bus.register(node.clone()).await;
        node
    }

    #[tokio::test]
    async fn lone_peer_roots_every_key() {
        let bus = LocalBus::new();
        let a = spawn_peer(&bus, "000000", 1).await;
        let target = a.config().space.hash_key("anything");
        assert_eq!(a.find_root(&target).await.unwrap(), *a.peer());

        a.store("anything", b"payload".to_vec()).await.unwrap();
        let replicas = a.lookup("anything").await.unwrap();
        assert_eq!(replicas, vec![a.peer().clone()]);
    }

    #[tokio::test]
    async fn join_makes_routes_and_backpointers_symmetric() {
        let bus = LocalBus::new();
        let a = spawn_peer(&bus, "000000", 1).await;
        let b = spawn_peer(&bus, "130000", 2).await;
        b.join(a.peer()).await.unwrap();

        let snap_a = a.snapshot().await;
        let snap_b = b.snapshot().await;
        assert!(snap_a.routes.contains(b.peer()));
        assert!(snap_b.routes.contains(a.peer()));
        // a holds b, so b's holders include a; and vice versa.
        let holders_of_b: Vec<_> = snap_b
            .backpointers
            .iter()
            .flat_map(|(_, peers)| peers.clone())
            .collect();
        let holders_of_a: Vec<_> = snap_a
            .backpointers
            .iter()
            .flat_map(|(_, peers)| peers.clone())
            .collect();
        assert!(holders_of_b.contains(a.peer()));
        assert!(holders_of_a.contains(b.peer()));
    }

    #[tokio::test]
    async fn register_is_idempotent_per_replica() {
        let bus = LocalBus::new();
        let a = spawn_peer(&bus, "000000", 1).await;
        assert!(a.handle_register("k", a.peer().clone()).await.unwrap());
        assert!(a.handle_register("k", a.peer().clone()).await.unwrap());
        let (is_root, replicas) = a.handle_fetch("k").await;
        assert!(is_root);
        assert_eq!(replicas.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn replica_pointer_expires_without_refresh() {
        let bus = LocalBus::new();
        let a = spawn_peer(&bus, "000000", 1).await;
        assert!(a.handle_register("k", a.peer().clone()).await.unwrap());
        tokio::time::advance(Duration::from_secs(6)).await;
        let (is_root, replicas) = a.handle_fetch("k").await;
        assert!(is_root);
        assert!(replicas.is_empty());
    }

    #[tokio::test]
    async fn foreign_identifier_is_rejected() {
        let bus = LocalBus::new();
        let a = spawn_peer(&bus, "000000", 1).await;
        let foreign = IdSpace::new(4, 3).random();
        let err = a.handle_get_next_hop(foreign).await.unwrap_err();
        assert!(err.downcast_ref::<MalformedIdentifier>().is_some());
    }

    #[tokio::test]
    async fn unreachable_hop_is_scrubbed_during_root_walk() {
        let bus = LocalBus::new();
        let a = spawn_peer(&bus, "000000", 1).await;
        let c = spawn_peer(&bus, "200000", 3).await;
        c.join(a.peer()).await.unwrap();

        bus.set_down(&c.peer().id, true);
        let target = a.config().space.parse("200000").unwrap();
        // The walk first points at c, finds it dead, scrubs it, and the
        // fresh walk roots at a itself.
        let root = a.find_root(&target).await.unwrap();
        assert_eq!(root, *a.peer());
        assert!(!a.snapshot().await.routes.contains(c.peer()));
    }

    #[tokio::test]
    async fn remove_bad_nodes_scrubs_routes_and_backpointers() {
        let bus = LocalBus::new();
        let a = spawn_peer(&bus, "000000", 1).await;
        let b = spawn_peer(&bus, "100000", 2).await;
        b.join(a.peer()).await.unwrap();

        let holders = |snap: &MeshSnapshot| -> Vec<PeerRef> {
            snap.backpointers
                .iter()
                .flat_map(|(_, peers)| peers.clone())
                .collect()
        };
        let snap = a.snapshot().await;
        assert!(snap.routes.contains(b.peer()));
        assert!(holders(&snap).contains(b.peer()));

        a.handle_remove_bad_nodes(vec![b.peer().clone()]).await;
        let snap = a.snapshot().await;
        assert!(!snap.routes.contains(b.peer()));
        assert!(!holders(&snap).contains(b.peer()));
    }

    #[tokio::test]
    async fn non_root_fetch_returns_no_replicas() {
        let bus = LocalBus::new();
        let a = spawn_peer(&bus, "000000", 1).await;
        let b = spawn_peer(&bus, "100000", 2).await;

        // A key whose hash routes through a's cell for digit 1, so b's
        // arrival takes the root role for it away from a.
        let space = a.config().space;
        let key = (0..)
            .map(|i| format!("k-{i}"))
            .find(|k| space.hash_key(k).digit(0) == 1)
            .unwrap();
        assert!(a.handle_register(&key, a.peer().clone()).await.unwrap());

        a.add_route(b.peer().clone()).await;
        let (is_root, replicas) = a.handle_fetch(&key).await;
        assert!(!is_root);
        assert!(replicas.is_empty());
    }

    #[tokio::test]
    async fn displaced_peer_loses_its_backpointer() {
        let bus = LocalBus::new();
        let a = spawn_peer(&bus, "000000", 1).await;
        let x = spawn_peer(&bus, "100000", 2).await;
        let y = spawn_peer(&bus, "100001", 3).await;
        let z = spawn_peer(&bus, "100002", 4).await;

        // All three land in the same cell; slot_size 2 displaces x.
        a.add_route(x.peer().clone()).await;
        a.add_route(y.peer().clone()).await;
        a.add_route(z.peer().clone()).await;
        sleep(Duration::from_millis(50)).await;

        let holders = |snap: MeshSnapshot| -> Vec<PeerRef> {
            snap.backpointers
                .into_iter()
                .flat_map(|(_, peers)| peers)
                .collect()
        };
        assert!(!holders(x.snapshot().await).contains(a.peer()));
        assert!(holders(y.snapshot().await).contains(a.peer()));
        assert!(holders(z.snapshot().await).contains(a.peer()));
    }

    #[tokio::test]
    async fn leave_hands_directory_to_survivor() {
        let bus = LocalBus::new();
        let a = spawn_peer(&bus, "000000", 1).await;
        let b = spawn_peer(&bus, "130000", 2).await;
        b.join(a.peer()).await.unwrap();

        let target = a.config().space.hash_key("k");
        let root = a.find_root(&target).await.unwrap();
        let (leaver, survivor) = if root == *a.peer() { (a, b) } else { (b, a) };
        assert!(leaver
            .handle_register("k", survivor.peer().clone())
            .await
            .unwrap());

        leaver.leave().await.unwrap();

        let snap = survivor.snapshot().await;
        assert!(snap.directory_keys.contains(&"k".to_string()));
        assert!(!snap.routes.contains(leaver.peer()));
        let (is_root, replicas) = survivor.handle_fetch("k").await;
        assert!(is_root);
        assert_eq!(replicas, vec![survivor.peer().clone()]);
    }

    #[tokio::test]
    async fn notify_leave_refills_from_replacement() {
        let bus = LocalBus::new();
        let a = spawn_peer(&bus, "000000", 1).await;
        let b = spawn_peer(&bus, "100000", 2).await;
        let r = spawn_peer(&bus, "100001", 3).await;
        b.join(a.peer()).await.unwrap();
        r.join(a.peer()).await.unwrap();

        a.handle_notify_leave(b.peer().clone(), Some(r.peer().clone()))
            .await;
        let snap = a.snapshot().await;
        assert!(!snap.routes.contains(b.peer()));
        assert!(snap.routes.contains(r.peer()));
    }

    #[tokio::test]
    async fn notify_leave_heals_from_backpointer_holders() {
        let bus = LocalBus::new();
        let a = spawn_peer(&bus, "000000", 1).await;
        let b = spawn_peer(&bus, "100000", 2).await;
        let c = spawn_peer(&bus, "100001", 3).await;
        b.join(a.peer()).await.unwrap();
        // c holds a unilaterally, so a knows c only as a backpointer
        // holder, not as a route.
        c.add_route(a.peer().clone()).await;
        assert!(!a.snapshot().await.routes.contains(c.peer()));

        // b departs offering no replacement; a refills the vacated cell
        // from its backpointer set, where c has the right shape.
        a.handle_notify_leave(b.peer().clone(), None).await;
        let snap = a.snapshot().await;
        assert!(!snap.routes.contains(b.peer()));
        assert!(snap.routes.contains(c.peer()));
    }

    #[tokio::test]
    async fn oversized_value_is_refused() {
        let bus = LocalBus::new();
        let a = spawn_peer(&bus, "000000", 1).await;
        let oversized = vec![0u8; MAX_VALUE_SIZE + 1];
        assert!(a.store("big", oversized).await.is_err());
        assert!(a.handle_blob_fetch("big").is_none());
    }
}
