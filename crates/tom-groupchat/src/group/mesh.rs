/// Mesh slot set: closest-peer candidates and the connection pool.
///
/// Pure bookkeeping, no I/O. The session decides when to open or close
/// transport connections; this module only tracks which slots are used
/// and which peers the mesh should be connected to.
///
/// Distance is the XOR of two identity keys, compared as a 256-bit
/// big-endian integer. Ties go to the lower slot id.
use std::cmp::Ordering;

use crate::group::peer::PeerRecord;
use crate::types::{
    ConnectionId, GroupNumber, PublicKey, SlotId, DESIRED_CLOSE_CONNECTIONS,
    MAX_GROUP_CONNECTIONS, PUBLIC_KEY_LENGTH,
};

// ── Distance ─────────────────────────────────────────────────────────────

/// XOR distance between two identity keys. Smaller = closer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Distance([u8; PUBLIC_KEY_LENGTH]);

impl Distance {
    pub fn between(a: &PublicKey, b: &PublicKey) -> Self {
        let mut out = [0u8; PUBLIC_KEY_LENGTH];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = a.0[i] ^ b.0[i];
        }
        Self(out)
    }
}

// ── ClosestCandidate ─────────────────────────────────────────────────────

/// A peer selected as a preferred mesh neighbour, connected or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosestCandidate {
    pub identity_key: PublicKey,
    pub session_key: PublicKey,
    pub slot_id: SlotId,
    pub distance: Distance,
}

impl ClosestCandidate {
    fn new(local: &PublicKey, identity_key: PublicKey, session_key: PublicKey, slot_id: SlotId) -> Self {
        Self {
            identity_key,
            session_key,
            slot_id,
            distance: Distance::between(local, &identity_key),
        }
    }

    fn rank_cmp(&self, other: &Self) -> Ordering {
        self.distance
            .cmp(&other.distance)
            .then(self.slot_id.cmp(&other.slot_id))
    }
}

// ── MeshConnection ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Opened, waiting for the link to come up.
    Connecting,
    Online,
}

/// One occupied connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshConnection {
    pub kind: ConnectionKind,
    /// Realizes a closest-candidate relationship.
    pub closest: bool,
    pub connection: ConnectionId,
    /// Owning session.
    pub group: GroupNumber,
    /// Identity at the far end, once known.
    pub identity: Option<PublicKey>,
    /// Opened by us (must be closed by us) rather than lent by the caller.
    pub owned: bool,
    pub opened_at: u64,
    /// Unix ms of the last packet received on this connection.
    pub last_recv: u64,
}

// ── MeshSlots ────────────────────────────────────────────────────────────

/// Fixed-capacity arenas for closest candidates and connections.
#[derive(Debug)]
pub struct MeshSlots {
    local_identity: PublicKey,
    /// Occupied entries first, sorted by (distance, slot id).
    closest: [Option<ClosestCandidate>; DESIRED_CLOSE_CONNECTIONS],
    connections: [Option<MeshConnection>; MAX_GROUP_CONNECTIONS],
}

impl MeshSlots {
    pub fn new(local_identity: PublicKey) -> Self {
        Self {
            local_identity,
            closest: [None; DESIRED_CLOSE_CONNECTIONS],
            connections: [None; MAX_GROUP_CONNECTIONS],
        }
    }

    // ── Closest candidates ───────────────────────────────────────────────

    pub fn closest(&self) -> impl Iterator<Item = &ClosestCandidate> {
        self.closest.iter().flatten()
    }

    pub fn closest_len(&self) -> usize {
        self.closest().count()
    }

    pub fn is_closest(&self, identity: &PublicKey) -> bool {
        self.closest().any(|c| c.identity_key == *identity)
    }

    /// Offer a newly learned peer. Returns `true` if it entered the set.
    pub fn consider(&mut self, identity_key: PublicKey, session_key: PublicKey, slot_id: SlotId) -> bool {
        if identity_key == self.local_identity {
            return false;
        }

        let mut current: Vec<ClosestCandidate> = self.closest().copied().collect();
        if let Some(existing) = current.iter_mut().find(|c| c.identity_key == identity_key) {
            existing.session_key = session_key;
            existing.slot_id = slot_id;
            self.store_closest(current);
            return false;
        }

        current.push(ClosestCandidate::new(
            &self.local_identity,
            identity_key,
            session_key,
            slot_id,
        ));
        self.store_closest(current);
        self.is_closest(&identity_key)
    }

    /// Drop a peer from the candidate set.
    pub fn forget(&mut self, identity: &PublicKey) {
        let current: Vec<ClosestCandidate> = self
            .closest()
            .filter(|c| c.identity_key != *identity)
            .copied()
            .collect();
        self.store_closest(current);
    }

    /// Recompute the candidate set from scratch. Idempotent for an
    /// unchanged membership.
    pub fn rebuild<'a>(&mut self, peers: impl Iterator<Item = &'a PeerRecord>) {
        let local = self.local_identity;
        let all: Vec<ClosestCandidate> = peers
            .filter(|p| p.identity_key != local)
            .map(|p| ClosestCandidate::new(&local, p.identity_key, p.session_key, p.slot_id))
            .collect();
        self.store_closest(all);
    }

    fn store_closest(&mut self, mut candidates: Vec<ClosestCandidate>) {
        candidates.sort_by(|a, b| a.rank_cmp(b));
        candidates.dedup_by(|a, b| a.identity_key == b.identity_key);
        candidates.truncate(DESIRED_CLOSE_CONNECTIONS);

        self.closest = [None; DESIRED_CLOSE_CONNECTIONS];
        for (slot, candidate) in self.closest.iter_mut().zip(candidates) {
            *slot = Some(candidate);
        }
        self.check_invariants();
    }

    // ── Connection pool ──────────────────────────────────────────────────

    pub fn occupied(&self) -> usize {
        self.connections.iter().flatten().count()
    }

    pub fn is_full(&self) -> bool {
        self.occupied() >= MAX_GROUP_CONNECTIONS
    }

    pub fn connections(&self) -> impl Iterator<Item = (usize, &MeshConnection)> {
        self.connections
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|c| (i, c)))
    }

    pub fn get(&self, index: usize) -> Option<&MeshConnection> {
        self.connections.get(index).and_then(|c| c.as_ref())
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut MeshConnection> {
        self.connections.get_mut(index).and_then(|c| c.as_mut())
    }

    pub fn find_connection(&self, connection: ConnectionId) -> Option<usize> {
        self.connections()
            .find(|(_, c)| c.connection == connection)
            .map(|(i, _)| i)
    }

    pub fn find_by_identity(&self, identity: &PublicKey) -> Option<usize> {
        self.connections()
            .find(|(_, c)| c.identity.as_ref() == Some(identity))
            .map(|(i, _)| i)
    }

    /// Put a connection into the first free slot.
    pub fn occupy(&mut self, connection: MeshConnection) -> Option<usize> {
        let index = self.connections.iter().position(|c| c.is_none())?;
        self.connections[index] = Some(connection);
        self.check_invariants();
        Some(index)
    }

    pub fn release(&mut self, index: usize) -> Option<MeshConnection> {
        self.connections.get_mut(index).and_then(|c| c.take())
    }

    /// Empty every connection slot.
    pub fn drain(&mut self) -> Vec<MeshConnection> {
        self.connections.iter_mut().filter_map(|c| c.take()).collect()
    }

    pub fn has_online(&self) -> bool {
        self.connections()
            .any(|(_, c)| c.kind == ConnectionKind::Online)
    }

    pub fn online_connections(&self) -> Vec<ConnectionId> {
        self.connections()
            .filter(|(_, c)| c.kind == ConnectionKind::Online)
            .map(|(_, c)| c.connection)
            .collect()
    }

    /// Re-derive each slot's `closest` flag from the candidate set.
    pub fn refresh_closest_flags(&mut self) {
        let closest: Vec<PublicKey> = self.closest().map(|c| c.identity_key).collect();
        for conn in self.connections.iter_mut().flatten() {
            conn.closest = conn
                .identity
                .map(|id| closest.contains(&id))
                .unwrap_or(false);
        }
    }

    /// Closest candidates that no connection slot realizes yet.
    pub fn missing_closest(&self) -> Vec<ClosestCandidate> {
        self.closest()
            .filter(|c| self.find_by_identity(&c.identity_key).is_none())
            .copied()
            .collect()
    }

    /// Non-closest slot that has been quiet the longest; `protect` is
    /// never chosen.
    pub fn eviction_candidate(&self, protect: Option<ConnectionId>) -> Option<usize> {
        self.connections()
            .filter(|(_, c)| !c.closest && Some(c.connection) != protect)
            .min_by_key(|(_, c)| c.last_recv)
            .map(|(i, _)| i)
    }

    fn check_invariants(&self) {
        debug_assert!(self.occupied() <= MAX_GROUP_CONNECTIONS);
        debug_assert!(self.closest_len() <= DESIRED_CLOSE_CONNECTIONS);
        debug_assert!(self
            .closest()
            .zip(self.closest().skip(1))
            .all(|(a, b)| a.rank_cmp(b) != Ordering::Greater));
    }
}
