/// Membership directory. One `PeerRecord` per known room member.
///
/// Slot ids are the wire-visible peer references. A removed peer's slot
/// id is tombstoned so that frames still in flight for the old occupant
/// can't be attributed to a newcomer.
use std::collections::HashMap;

use crate::error::GroupError;
use crate::types::{PublicKey, SlotId, MAX_NAME_LENGTH};

/// Local bookkeeping for one room member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Long-term identity, stable across rooms. Drives mesh distance.
    pub identity_key: PublicKey,
    /// Room-scoped key. May rotate without changing the identity.
    pub session_key: PublicKey,
    /// Unix ms of the last accepted frame from this peer.
    pub last_seen: u64,
    /// Highest sequence number accepted from this peer.
    pub last_sequence: u32,
    pub nickname: Vec<u8>,
    pub slot_id: SlotId,
}

/// Outcome of learning about a peer from an announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Learned {
    /// New identity, new record.
    Added,
    /// Known identity, session key rotated.
    Rotated,
    /// Known identity, nothing changed.
    Known,
    /// Known identity showed up under a different slot id; the old
    /// record was dropped.
    Moved { old_slot: SlotId },
}

/// Announcement rejected: the slot id is live for another identity or
/// still tombstoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotConflict(pub SlotId);

/// Reject names over [`MAX_NAME_LENGTH`]. Names are never truncated.
pub fn validate_name(name: &[u8]) -> Result<(), GroupError> {
    if name.len() > MAX_NAME_LENGTH {
        return Err(GroupError::NameTooLong {
            len: name.len(),
            max: MAX_NAME_LENGTH,
        });
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: Vec<PeerRecord>,
    /// slot id → Unix ms at which it may be reused.
    tombstones: HashMap<SlotId, u64>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.iter()
    }

    pub fn get(&self, slot: SlotId) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| p.slot_id == slot)
    }

    pub fn get_mut(&mut self, slot: SlotId) -> Option<&mut PeerRecord> {
        self.peers.iter_mut().find(|p| p.slot_id == slot)
    }

    pub fn find_by_identity(&self, identity: &PublicKey) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| p.identity_key == *identity)
    }

    pub fn is_tombstoned(&self, slot: SlotId) -> bool {
        self.tombstones.contains_key(&slot)
    }

    /// Neither live nor tombstoned.
    pub fn is_free(&self, slot: SlotId) -> bool {
        self.get(slot).is_none() && !self.is_tombstoned(slot)
    }

    /// Pick a random free slot id.
    pub fn allocate_slot(&self) -> SlotId {
        loop {
            let slot: SlotId = rand::random();
            if self.is_free(slot) {
                return slot;
            }
        }
    }

    // ── Mutations ────────────────────────────────────────────────────────

    /// Lookup-or-create by identity key.
    pub fn learn(
        &mut self,
        identity: PublicKey,
        session_key: PublicKey,
        slot: SlotId,
        now: u64,
        tombstone_ms: u64,
    ) -> Result<Learned, SlotConflict> {
        if let Some(index) = self.peers.iter().position(|p| p.identity_key == identity) {
            let existing = &mut self.peers[index];
            if existing.slot_id == slot {
                if existing.session_key == session_key {
                    return Ok(Learned::Known);
                }
                existing.session_key = session_key;
                return Ok(Learned::Rotated);
            }
            if !self.is_free(slot) {
                return Err(SlotConflict(slot));
            }
            let mut record = self.peers.remove(index);
            let old_slot = record.slot_id;
            self.tombstones.insert(old_slot, now.saturating_add(tombstone_ms));
            record.slot_id = slot;
            record.session_key = session_key;
            self.peers.push(record);
            return Ok(Learned::Moved { old_slot });
        }

        if !self.is_free(slot) {
            return Err(SlotConflict(slot));
        }

        self.peers.push(PeerRecord {
            identity_key: identity,
            session_key,
            last_seen: now,
            last_sequence: 0,
            nickname: Vec::new(),
            slot_id: slot,
        });
        Ok(Learned::Added)
    }

    /// Set a peer's nickname. Returns `None` if the slot is unknown,
    /// `Some(changed)` otherwise. Length must be validated by the caller.
    pub fn rename(&mut self, slot: SlotId, name: &[u8]) -> Option<bool> {
        debug_assert!(name.len() <= MAX_NAME_LENGTH);
        let peer = self.get_mut(slot)?;
        if peer.nickname == name {
            return Some(false);
        }
        peer.nickname = name.to_vec();
        Some(true)
    }

    /// Remove a peer and tombstone its slot id until `now + tombstone_ms`.
    pub fn remove(&mut self, slot: SlotId, now: u64, tombstone_ms: u64) -> Option<PeerRecord> {
        let index = self.peers.iter().position(|p| p.slot_id == slot)?;
        let record = self.peers.remove(index);
        self.tombstones.insert(slot, now.saturating_add(tombstone_ms));
        Some(record)
    }

    /// Change a slot id in place (join handshake reassigned our slot).
    pub fn renumber(&mut self, from: SlotId, to: SlotId) -> bool {
        if from == to {
            return true;
        }
        if !self.is_free(to) {
            return false;
        }
        match self.get_mut(from) {
            Some(peer) => {
                peer.slot_id = to;
                true
            }
            None => false,
        }
    }

    /// Drop expired tombstones.
    pub fn expire_tombstones(&mut self, now: u64) {
        self.tombstones.retain(|_, &mut until| until > now);
    }

    /// Peers (other than `local`) silent for at least `timeout` ms.
    pub fn timed_out(&self, now: u64, timeout: u64, local: SlotId) -> Vec<SlotId> {
        self.peers
            .iter()
            .filter(|p| p.slot_id != local && now.saturating_sub(p.last_seen) >= timeout)
            .map(|p| p.slot_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> PublicKey {
        PublicKey([seed; 32])
    }

    #[test]
    fn learn_adds_then_knows() {
        let mut dir = PeerDirectory::new();
        assert_eq!(dir.learn(key(1), key(101), 5, 1000, 100), Ok(Learned::Added));
        assert_eq!(dir.learn(key(1), key(101), 5, 1000, 100), Ok(Learned::Known));
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.get(5).unwrap().identity_key, key(1));
    }

    #[test]
    fn session_key_rotation_keeps_slot() {
        let mut dir = PeerDirectory::new();
        dir.learn(key(1), key(101), 5, 1000, 100).unwrap();
        assert_eq!(dir.learn(key(1), key(102), 5, 1000, 100), Ok(Learned::Rotated));

        let peer = dir.get(5).unwrap();
        assert_eq!(peer.identity_key, key(1));
        assert_eq!(peer.session_key, key(102));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn slot_taken_by_other_identity_is_rejected() {
        let mut dir = PeerDirectory::new();
        dir.learn(key(1), key(101), 5, 1000, 100).unwrap();
        assert_eq!(dir.learn(key(2), key(102), 5, 1000, 100), Err(SlotConflict(5)));
        assert_eq!(dir.get(5).unwrap().identity_key, key(1));
    }

    #[test]
    fn removed_slot_is_tombstoned_until_expiry() {
        let mut dir = PeerDirectory::new();
        dir.learn(key(1), key(101), 5, 1000, 100).unwrap();
        assert!(dir.remove(5, 2000, 100).is_some());
        assert!(dir.get(5).is_none());
        assert!(dir.is_tombstoned(5));

        // Newcomer can't take the slot while the tombstone lives
        assert_eq!(dir.learn(key(2), key(102), 5, 2050, 100), Err(SlotConflict(5)));

        dir.expire_tombstones(2099);
        assert!(dir.is_tombstoned(5));
        dir.expire_tombstones(2100);
        assert!(!dir.is_tombstoned(5));
        assert_eq!(dir.learn(key(2), key(102), 5, 2100, 100), Ok(Learned::Added));
    }

    #[test]
    fn known_identity_moving_slot() {
        let mut dir = PeerDirectory::new();
        dir.learn(key(1), key(101), 5, 1000, 100).unwrap();
        dir.rename(5, b"alice").unwrap();

        assert_eq!(
            dir.learn(key(1), key(103), 9, 1500, 100),
            Ok(Learned::Moved { old_slot: 5 })
        );
        assert!(dir.get(5).is_none());
        assert!(dir.is_tombstoned(5));
        let peer = dir.get(9).unwrap();
        assert_eq!(peer.nickname, b"alice");
        assert_eq!(peer.session_key, key(103));
    }

    #[test]
    fn rename_reports_change() {
        let mut dir = PeerDirectory::new();
        dir.learn(key(1), key(101), 5, 1000, 100).unwrap();
        assert_eq!(dir.rename(5, b"bob"), Some(true));
        assert_eq!(dir.rename(5, b"bob"), Some(false));
        assert_eq!(dir.rename(6, b"bob"), None);
    }

    #[test]
    fn validate_name_rejects_overlong() {
        assert!(validate_name(&[b'a'; MAX_NAME_LENGTH]).is_ok());
        let err = validate_name(&[b'a'; MAX_NAME_LENGTH + 1]).unwrap_err();
        assert!(matches!(err, GroupError::NameTooLong { len, .. } if len == MAX_NAME_LENGTH + 1));
    }

    #[test]
    fn timed_out_skips_local() {
        let mut dir = PeerDirectory::new();
        dir.learn(key(1), key(101), 1, 0, 100).unwrap();
        dir.learn(key(2), key(102), 2, 0, 100).unwrap();
        dir.get_mut(2).unwrap().last_seen = 900;

        let stale = dir.timed_out(1000, 500, 1);
        assert!(stale.is_empty());
        let stale = dir.timed_out(1000, 500, 7);
        assert_eq!(stale, vec![1]);
    }

    #[test]
    fn renumber_moves_slot() {
        let mut dir = PeerDirectory::new();
        dir.learn(key(1), key(101), 1, 0, 100).unwrap();
        dir.learn(key(2), key(102), 2, 0, 100).unwrap();
        assert!(!dir.renumber(1, 2));
        assert!(dir.renumber(1, 3));
        assert_eq!(dir.get(3).unwrap().identity_key, key(1));
    }

    #[test]
    fn allocate_slot_avoids_live_and_tombstoned() {
        let mut dir = PeerDirectory::new();
        dir.learn(key(1), key(101), 1, 0, 100).unwrap();
        dir.learn(key(2), key(102), 2, 0, 100).unwrap();
        dir.remove(2, 0, 1_000);
        for _ in 0..200 {
            let slot = dir.allocate_slot();
            assert!(slot != 1 && slot != 2);
        }
    }
}
