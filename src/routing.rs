//! Routing matrix, surrogate next-hop selection, and backpointer sets.
//!
//! The routing table is a `level x digit` matrix. An entry at
//! `rows[level][digit]` shares exactly the owner's first `level` digits and
//! carries `digit` at position `level`; the owner itself is never stored.
//! Each cell keeps up to `slot_size` peers ordered most-recently-confirmed
//! first.
//!
//! Backpointers are the inverse relation: for each level, the set of peers
//! that currently hold the owner in their own tables. They carry no
//! ownership; they exist so a departing or healing peer knows who to notify.

use std::collections::HashMap;

use crate::id::{Id, IdSpace, PeerRef};

/// Result of offering a peer to the routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOutcome {
    /// The peer now occupies a cell. `displaced` is the entry that was
    /// pushed out of a full cell, if any; the caller owes it a
    /// backpointer removal.
    Added { displaced: Option<PeerRef> },
    /// The peer was already present; its entry moved to the front of the
    /// cell and its address was refreshed.
    Refreshed,
    /// The peer cannot be stored (it is the owner itself).
    Rejected,
}

impl SlotOutcome {
    /// Whether the table now holds the offered peer.
    pub fn holds(&self) -> bool {
        matches!(self, SlotOutcome::Added { .. } | SlotOutcome::Refreshed)
    }
}

#[derive(Debug)]
pub struct RoutingTable {
    local: Id,
    space: IdSpace,
    slot_size: usize,
    rows: Vec<Vec<Vec<PeerRef>>>,
}

impl RoutingTable {
    pub fn new(local: Id, space: IdSpace, slot_size: usize) -> Self {
        debug_assert!(space.contains(&local));
        let rows = vec![vec![Vec::new(); space.base() as usize]; space.digits()];
        Self {
            local,
            space,
            slot_size,
            rows,
        }
    }

    pub fn local(&self) -> &Id {
        &self.local
    }

    /// Cell coordinates for `id`, or `None` when `id` is the owner.
    fn cell_for(&self, id: &Id) -> Option<(usize, usize)> {
        let level = self.local.shared_prefix_len(id);
        if level == self.space.digits() {
            return None;
        }
        Some((level, id.digit(level) as usize))
    }

    /// Offer a peer to its cell.
    ///
    /// A fresh offer counts as the most recent confirmation, so a full cell
    /// displaces its least recently confirmed occupant.
    pub fn insert(&mut self, peer: PeerRef) -> SlotOutcome {
        if !self.space.contains(&peer.id) {
            return SlotOutcome::Rejected;
        }
        let Some((level, digit)) = self.cell_for(&peer.id) else {
            return SlotOutcome::Rejected;
        };
        let cell = &mut self.rows[level][digit];
        if let Some(pos) = cell.iter().position(|p| p.id == peer.id) {
            cell.remove(pos);
            cell.insert(0, peer);
            return SlotOutcome::Refreshed;
        }
        let displaced = if cell.len() >= self.slot_size {
            cell.pop()
        } else {
            None
        };
        cell.insert(0, peer);
        SlotOutcome::Added { displaced }
    }

    /// Remove every entry with the given identifier. Quietly does nothing
    /// when the identifier is absent.
    pub fn remove(&mut self, id: &Id) -> bool {
        let mut removed = false;
        for row in &mut self.rows {
            for cell in row {
                let before = cell.len();
                cell.retain(|p| p.id != *id);
                removed |= cell.len() != before;
            }
        }
        removed
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.cell_for(id)
            .map(|(level, digit)| self.rows[level][digit].iter().any(|p| p.id == *id))
            .unwrap_or(false)
    }

    /// Snapshot of every occupied cell at `level`, flattened.
    pub fn row(&self, level: usize) -> Vec<PeerRef> {
        self.rows[level].iter().flatten().cloned().collect()
    }

    /// Snapshot of every entry at levels `from..digits`.
    pub fn rows_from(&self, from: usize) -> Vec<PeerRef> {
        self.rows[from..]
            .iter()
            .flat_map(|row| row.iter().flatten())
            .cloned()
            .collect()
    }

    /// Every entry in the table.
    pub fn all(&self) -> Vec<PeerRef> {
        self.rows_from(0)
    }

    pub fn is_empty(&self) -> bool {
        self.rows
            .iter()
            .all(|row| row.iter().all(|cell| cell.is_empty()))
    }

    /// Next peer on the path toward `target`'s root.
    ///
    /// Pure and deterministic; performs no I/O. The walk settles one digit
    /// per level: at each level the candidate digit is the target's own
    /// digit, falling back cyclically upward to the next occupied column.
    /// When the scan reaches the owner's own column first, the owner is the
    /// best match at that level and the walk moves one level deeper.
    /// `None` means the owner is the root: every level resolved to the
    /// owner, so no present identifier is closer to the target.
    pub fn next_hop(&self, target: &Id) -> Option<PeerRef> {
        let digits = self.space.digits();
        let base = self.space.base() as usize;
        let mut level = self.local.shared_prefix_len(target);
        while level < digits {
            let own = self.local.digit(level) as usize;
            let start = target.digit(level) as usize;
            if start == own {
                // Past the first mismatch the target digit can agree with
                // the owner's again; the owner wins the level outright.
                level += 1;
                continue;
            }
            for offset in 0..base {
                let digit = (start + offset) % base;
                if digit == own {
                    break;
                }
                if let Some(best) = self.rows[level][digit].first() {
                    return Some(best.clone());
                }
            }
            level += 1;
        }
        None
    }

    /// A stand-in for the owner from the perspective of a peer holding the
    /// owner at `level`: any entry at a deeper level shares at least
    /// `level + 1` digits with the owner and therefore fits the holder's
    /// vacated cell. Scans deepest-first for the longest match.
    pub fn substitute_above(&self, level: usize) -> Option<PeerRef> {
        for l in ((level + 1)..self.space.digits()).rev() {
            if let Some(peer) = self.rows[l].iter().flatten().next() {
                return Some(peer.clone());
            }
        }
        None
    }

    /// The known peer sharing the longest prefix with the owner; where the
    /// owner's keys re-root once the owner is gone.
    pub fn closest_neighbor(&self) -> Option<PeerRef> {
        for row in self.rows.iter().rev() {
            if let Some(peer) = row.iter().flatten().next() {
                return Some(peer.clone());
            }
        }
        None
    }
}

/// Per-level sets of peers that hold the owner in their routing tables.
#[derive(Debug)]
pub struct Backpointers {
    local: Id,
    levels: Vec<HashMap<Id, PeerRef>>,
}

impl Backpointers {
    pub fn new(local: Id, space: IdSpace) -> Self {
        Self {
            local,
            levels: vec![HashMap::new(); space.digits()],
        }
    }

    fn level_for(&self, id: &Id) -> Option<usize> {
        let level = self.local.shared_prefix_len(id);
        (level < self.levels.len()).then_some(level)
    }

    /// Record that `peer` holds the owner. Idempotent.
    pub fn add(&mut self, peer: PeerRef) -> bool {
        match self.level_for(&peer.id) {
            Some(level) => {
                self.levels[level].insert(peer.id.clone(), peer);
                true
            }
            None => false,
        }
    }

    /// Forget a holder; quietly does nothing when absent.
    pub fn remove(&mut self, id: &Id) -> bool {
        match self.level_for(id) {
            Some(level) => self.levels[level].remove(id).is_some(),
            None => false,
        }
    }

    pub fn at(&self, level: usize) -> Vec<PeerRef> {
        self.levels[level].values().cloned().collect()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.level_for(id)
            .map(|level| self.levels[level].contains_key(id))
            .unwrap_or(false)
    }

    /// Every non-empty level with its holders.
    pub fn by_level(&self) -> Vec<(usize, Vec<PeerRef>)> {
        self.levels
            .iter()
            .enumerate()
            .filter(|(_, set)| !set.is_empty())
            .map(|(level, set)| (level, set.values().cloned().collect()))
            .collect()
    }

    /// A holder at `level` whose digit at that position is `digit`; such a
    /// peer fits the table cell vacated when a same-shaped peer departs.
    pub fn find_at(&self, level: usize, digit: u8) -> Option<PeerRef> {
        self.levels[level]
            .values()
            .find(|p| p.id.digit(level) == digit)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(|set| set.is_empty())
    }
}
