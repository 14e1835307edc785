/// One chat room's full local state.
///
/// Owns the membership directory and the mesh slot set. Every handler
/// mutates state, talks to the connection layer it is handed, and
/// returns the application events produced. The caller delivers those
/// events after the handler returns.
use tracing::{debug, info, trace, warn};

use crate::config::GroupConfig;
use crate::error::{GroupError, TransportError};
use crate::group::mesh::{ConnectionKind, MeshConnection, MeshSlots};
use crate::group::peer::{validate_name, Learned, PeerDirectory, PeerRecord};
use crate::group::types::{GroupEvent, GroupStatus, NameListChange};
use crate::group::wire::{FrameBody, GroupFrame, GroupPacket, PeerAnnouncement};
use crate::transport::ConnectionLayer;
use crate::types::{
    ConnectionId, GroupIdentifier, GroupNumber, PublicKey, SlotId, MAX_GROUP_MESSAGE_LENGTH,
    MAX_NAME_LENGTH,
};

/// Message or action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Message,
    Action,
}

pub struct GroupSession {
    group: GroupNumber,
    status: GroupStatus,
    identifier: GroupIdentifier,
    local_identity: PublicKey,
    session_key: PublicKey,
    members: PeerDirectory,
    mesh: MeshSlots,
    /// Sequence number of our latest broadcast.
    message_counter: u32,
    local_slot: SlotId,
    last_ping_sent: u64,
    /// Friend connection the invite came through, if we joined.
    joined_via: Option<ConnectionId>,
    join_pending: bool,
    last_join_request: u64,
    /// Membership changed since the application last looked.
    dirty: bool,
}

impl GroupSession {
    /// A room created locally.
    pub fn create(
        group: GroupNumber,
        local_identity: PublicKey,
        nickname: &[u8],
        now: u64,
    ) -> Self {
        Self::new(group, GroupIdentifier::random(), local_identity, nickname, None, now)
    }

    /// A room we are joining through `friend`. Call [`start_join`](Self::start_join) next.
    pub fn joining(
        group: GroupNumber,
        identifier: GroupIdentifier,
        local_identity: PublicKey,
        nickname: &[u8],
        friend: ConnectionId,
        now: u64,
    ) -> Self {
        let mut session = Self::new(group, identifier, local_identity, nickname, Some(friend), now);
        session.join_pending = true;
        session
    }

    fn new(
        group: GroupNumber,
        identifier: GroupIdentifier,
        local_identity: PublicKey,
        nickname: &[u8],
        joined_via: Option<ConnectionId>,
        now: u64,
    ) -> Self {
        let session_key = PublicKey::random();
        let mut members = PeerDirectory::new();
        let local_slot = members.allocate_slot();
        // An empty directory never conflicts.
        let _ = members.learn(local_identity, session_key, local_slot, now, 0);
        if nickname.len() <= MAX_NAME_LENGTH {
            members.rename(local_slot, nickname);
        }

        Self {
            group,
            status: GroupStatus::Valid,
            identifier,
            local_identity,
            session_key,
            members,
            mesh: MeshSlots::new(local_identity),
            message_counter: 0,
            local_slot,
            last_ping_sent: now,
            joined_via,
            join_pending: false,
            last_join_request: 0,
            dirty: true,
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn status(&self) -> GroupStatus {
        self.status
    }

    pub fn identifier(&self) -> &GroupIdentifier {
        &self.identifier
    }

    pub fn local_slot(&self) -> SlotId {
        self.local_slot
    }

    pub fn message_counter(&self) -> u32 {
        self.message_counter
    }

    pub fn joined_via(&self) -> Option<ConnectionId> {
        self.joined_via
    }

    pub fn is_join_pending(&self) -> bool {
        self.join_pending
    }

    pub fn members(&self) -> impl Iterator<Item = &PeerRecord> {
        self.members.iter()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn peer(&self, slot: SlotId) -> Option<&PeerRecord> {
        self.members.get(slot)
    }

    pub fn mesh(&self) -> &MeshSlots {
        &self.mesh
    }

    /// Read and clear the membership-changed flag.
    pub fn take_changed(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    fn announcement(&self, peer: &PeerRecord) -> PeerAnnouncement {
        let last_sequence = if peer.slot_id == self.local_slot {
            self.message_counter
        } else {
            peer.last_sequence
        };
        PeerAnnouncement {
            slot_id: peer.slot_id,
            identity_key: peer.identity_key,
            session_key: peer.session_key,
            nickname: peer.nickname.clone(),
            last_sequence,
        }
    }

    fn roster(&self) -> Vec<PeerAnnouncement> {
        self.members.iter().map(|p| self.announcement(p)).collect()
    }

    fn changed(&mut self, peer: SlotId, change: NameListChange) -> GroupEvent {
        self.dirty = true;
        GroupEvent::NameListChanged {
            group: self.group,
            peer,
            change,
        }
    }

    // ── Sending ──────────────────────────────────────────────────────────

    /// Stamp a new frame with the next sequence number.
    fn next_frame(&mut self, body: FrameBody) -> GroupFrame {
        self.message_counter = self.message_counter.wrapping_add(1);
        GroupFrame {
            identifier: self.identifier,
            sender: self.local_slot,
            sender_key: self.local_identity,
            sequence: self.message_counter,
            body,
        }
    }

    /// Broadcast a new frame over every online connection except `except`.
    /// Returns the number of successful sends.
    fn broadcast<C: ConnectionLayer>(
        &mut self,
        net: &mut C,
        body: FrameBody,
        except: Option<ConnectionId>,
    ) -> Result<usize, GroupError> {
        let frame = self.next_frame(body);
        let bytes = GroupPacket::Broadcast(frame).to_bytes()?;
        Ok(self.send_raw_all(net, &bytes, except))
    }

    fn send_raw_all<C: ConnectionLayer>(
        &self,
        net: &mut C,
        bytes: &[u8],
        except: Option<ConnectionId>,
    ) -> usize {
        let mut sent = 0;
        for connection in self.mesh.online_connections() {
            if Some(connection) == except {
                continue;
            }
            match net.send(connection, bytes) {
                Ok(()) => sent += 1,
                Err(e) => debug!("group {}: send on {connection} failed: {e}", self.group),
            }
        }
        sent
    }

    fn send_direct<C: ConnectionLayer>(
        &self,
        net: &mut C,
        connection: ConnectionId,
        packet: &GroupPacket,
    ) -> Result<(), GroupError> {
        let bytes = packet.to_bytes()?;
        net.send(connection, &bytes)?;
        Ok(())
    }

    /// Send a message or action to the room.
    pub fn send_payload<C: ConnectionLayer>(
        &mut self,
        net: &mut C,
        kind: PayloadKind,
        payload: &[u8],
    ) -> Result<(), GroupError> {
        if payload.len() > MAX_GROUP_MESSAGE_LENGTH {
            return Err(GroupError::MessageTooLong {
                len: payload.len(),
                max: MAX_GROUP_MESSAGE_LENGTH,
            });
        }
        let body = match kind {
            PayloadKind::Message => FrameBody::Message(payload.to_vec()),
            PayloadKind::Action => FrameBody::Action(payload.to_vec()),
        };
        if self.broadcast(net, body, None)? == 0 {
            return Err(TransportError::NoOnlineConnections.into());
        }
        Ok(())
    }

    /// Change our nickname in this room and tell the others.
    pub fn set_local_name<C: ConnectionLayer>(
        &mut self,
        net: &mut C,
        name: &[u8],
    ) -> Result<Option<GroupEvent>, GroupError> {
        validate_name(name)?;
        if self.members.rename(self.local_slot, name) != Some(true) {
            return Ok(None);
        }
        let event = self.changed(self.local_slot, NameListChange::Renamed);
        if self.mesh.has_online() {
            self.broadcast(net, FrameBody::Name(name.to_vec()), None)?;
        }
        Ok(Some(event))
    }

    // ── Join handshake ───────────────────────────────────────────────────

    /// Occupy a slot for the inviting friend connection and ask to be admitted.
    pub fn start_join<C: ConnectionLayer>(&mut self, net: &mut C, now: u64) {
        let Some(friend) = self.joined_via else {
            return;
        };
        if self.mesh.find_connection(friend).is_none() {
            self.mesh.occupy(MeshConnection {
                kind: ConnectionKind::Connecting,
                closest: false,
                connection: friend,
                group: self.group,
                identity: None,
                owned: false,
                opened_at: now,
                last_recv: now,
            });
        }
        self.send_join_request(net, now);
    }

    fn send_join_request<C: ConnectionLayer>(&mut self, net: &mut C, now: u64) {
        let Some(friend) = self.joined_via else {
            return;
        };
        self.last_join_request = now;
        let nickname = self
            .members
            .get(self.local_slot)
            .map(|p| p.nickname.clone())
            .unwrap_or_default();
        let request = GroupPacket::JoinRequest {
            identifier: self.identifier,
            identity_key: self.local_identity,
            session_key: self.session_key,
            slot_id: self.local_slot,
            nickname,
        };
        if let Err(e) = self.send_direct(net, friend, &request) {
            warn!("group {}: join request on {friend} failed, will retry: {e}", self.group);
        }
    }

    fn handle_join_request<C: ConnectionLayer>(
        &mut self,
        net: &mut C,
        cfg: &GroupConfig,
        connection: ConnectionId,
        announcement: PeerAnnouncement,
        now: u64,
    ) -> Vec<GroupEvent> {
        if self.join_pending {
            debug!("group {}: not admitting while our own join is pending", self.group);
            return vec![];
        }
        if announcement.nickname.len() > MAX_NAME_LENGTH
            || announcement.identity_key == self.local_identity
        {
            return vec![];
        }

        let known = self
            .members
            .find_by_identity(&announcement.identity_key)
            .map(|existing| existing.slot_id);
        let assigned = match known {
            Some(existing) => existing,
            None if self.members.is_free(announcement.slot_id) => announcement.slot_id,
            None => self.members.allocate_slot(),
        };
        let admitted = PeerAnnouncement {
            slot_id: assigned,
            last_sequence: 0,
            ..announcement
        };

        let events = self.learn_peer(cfg, &admitted, now);
        if known.is_some() {
            // A rejoining member starts a fresh sequence space.
            if let Some(peer) = self.members.get_mut(assigned) {
                peer.last_sequence = 0;
                peer.last_seen = now;
            }
            self.rebind_connection(net, connection, &admitted.identity_key, now);
        }
        self.adopt_connection(net, connection, admitted.identity_key, now);

        let accept = GroupPacket::JoinAccept {
            identifier: self.identifier,
            assigned_slot: assigned,
            inviter_slot: self.local_slot,
            peers: self.roster(),
        };
        if let Err(e) = self.send_direct(net, connection, &accept) {
            warn!("group {}: join accept on {connection} failed: {e}", self.group);
        }

        if let Err(e) = self.broadcast(net, FrameBody::NewPeer(admitted), Some(connection)) {
            warn!("group {}: new peer broadcast failed: {e}", self.group);
        }
        info!("group {}: admitted peer {assigned}", self.group);

        self.update_status();
        events
    }

    fn handle_join_accept(
        &mut self,
        cfg: &GroupConfig,
        connection: ConnectionId,
        assigned_slot: SlotId,
        inviter_slot: SlotId,
        peers: Vec<PeerAnnouncement>,
        now: u64,
    ) -> Vec<GroupEvent> {
        if !self.join_pending || self.joined_via != Some(connection) {
            debug!("group {}: unexpected join accept on {connection}", self.group);
            return vec![];
        }
        if assigned_slot != self.local_slot {
            if !self.members.renumber(self.local_slot, assigned_slot) {
                warn!("group {}: cannot take assigned slot {assigned_slot}", self.group);
                return vec![];
            }
            self.local_slot = assigned_slot;
        }

        let mut events = Vec::new();
        let mut inviter = None;
        for announcement in &peers {
            if announcement.identity_key == self.local_identity {
                continue;
            }
            if announcement.slot_id == inviter_slot {
                inviter = Some(announcement.identity_key);
            }
            events.extend(self.learn_peer(cfg, announcement, now));
        }

        if let Some(index) = self.mesh.find_connection(connection) {
            if let Some(slot) = self.mesh.get_mut(index) {
                slot.identity = inviter;
                slot.kind = ConnectionKind::Online;
                slot.last_recv = now;
            }
        }
        self.mesh.refresh_closest_flags();
        self.join_pending = false;
        self.update_status();
        info!(
            "group {}: joined as peer {} with {} members",
            self.group,
            self.local_slot,
            self.members.len()
        );
        events
    }

    // ── Membership ───────────────────────────────────────────────────────

    /// Record an announced member. Returns the resulting events.
    fn learn_peer(
        &mut self,
        cfg: &GroupConfig,
        announcement: &PeerAnnouncement,
        now: u64,
    ) -> Vec<GroupEvent> {
        if announcement.identity_key == self.local_identity
            || announcement.nickname.len() > MAX_NAME_LENGTH
        {
            return vec![];
        }

        let learned = match self.members.learn(
            announcement.identity_key,
            announcement.session_key,
            announcement.slot_id,
            now,
            cfg.slot_tombstone_ms,
        ) {
            Ok(learned) => learned,
            Err(conflict) => {
                debug!(
                    "group {}: rejected announcement of {} at slot {}",
                    self.group, announcement.identity_key, conflict.0
                );
                return vec![];
            }
        };

        let slot = announcement.slot_id;
        let mut events = Vec::new();
        match learned {
            Learned::Added => {
                if let Some(peer) = self.members.get_mut(slot) {
                    peer.nickname = announcement.nickname.clone();
                    peer.last_sequence = announcement.last_sequence;
                }
                events.push(self.changed(slot, NameListChange::Added));
            }
            Learned::Moved { old_slot } => {
                if let Some(peer) = self.members.get_mut(slot) {
                    peer.last_sequence = announcement.last_sequence;
                    peer.last_seen = now;
                }
                events.push(self.changed(old_slot, NameListChange::Removed));
                events.push(self.changed(slot, NameListChange::Added));
            }
            Learned::Rotated => {
                if let Some(peer) = self.members.get_mut(slot) {
                    peer.last_sequence = announcement.last_sequence;
                    peer.last_seen = now;
                }
                debug!("group {}: peer {slot} rotated its session key", self.group);
            }
            Learned::Known => {}
        }

        if learned != Learned::Known {
            if self
                .mesh
                .consider(announcement.identity_key, announcement.session_key, slot)
            {
                trace!("group {}: peer {slot} is now a closest candidate", self.group);
            }
            self.mesh.refresh_closest_flags();
        }
        events
    }

    /// Remove a member and any connection realizing it.
    fn remove_peer<C: ConnectionLayer>(
        &mut self,
        net: &mut C,
        cfg: &GroupConfig,
        slot: SlotId,
        now: u64,
    ) -> Option<GroupEvent> {
        if slot == self.local_slot {
            return None;
        }
        let record = self.members.remove(slot, now, cfg.slot_tombstone_ms)?;
        self.mesh.forget(&record.identity_key);
        if let Some(index) = self.mesh.find_by_identity(&record.identity_key) {
            self.teardown_connection(net, index);
        }
        self.mesh.refresh_closest_flags();
        self.update_status();
        Some(self.changed(slot, NameListChange::Removed))
    }

    // ── Connections ──────────────────────────────────────────────────────

    /// Bind `connection` to `identity`, taking a pool slot if needed.
    fn adopt_connection<C: ConnectionLayer>(
        &mut self,
        net: &mut C,
        connection: ConnectionId,
        identity: PublicKey,
        now: u64,
    ) {
        if let Some(index) = self.mesh.find_connection(connection) {
            if let Some(slot) = self.mesh.get_mut(index) {
                slot.identity = Some(identity);
                slot.kind = ConnectionKind::Online;
                slot.last_recv = now;
            }
            self.mesh.refresh_closest_flags();
            return;
        }
        if let Some(index) = self.mesh.find_by_identity(&identity) {
            // Already linked to this peer through another handle.
            if let Some(slot) = self.mesh.get_mut(index) {
                slot.last_recv = now;
            }
            return;
        }

        let closest = self.mesh.is_closest(&identity);
        if self.mesh.is_full() {
            if !closest {
                debug!("group {}: pool full, not adopting {connection}", self.group);
                return;
            }
            match self.mesh.eviction_candidate(self.protected_connection()) {
                Some(index) => self.teardown_connection(net, index),
                None => return,
            }
        }

        self.mesh.occupy(MeshConnection {
            kind: ConnectionKind::Online,
            closest,
            connection,
            group: self.group,
            identity: Some(identity),
            owned: false,
            opened_at: now,
            last_recv: now,
        });
    }

    /// Move the link held for `identity` onto `connection`.
    fn rebind_connection<C: ConnectionLayer>(
        &mut self,
        net: &mut C,
        connection: ConnectionId,
        identity: &PublicKey,
        now: u64,
    ) {
        let Some(index) = self.mesh.find_by_identity(identity) else {
            return;
        };
        if self.mesh.find_connection(connection).is_some_and(|other| other != index) {
            self.teardown_connection(net, index);
            return;
        }
        let Some(slot) = self.mesh.get_mut(index) else {
            return;
        };
        if slot.connection == connection {
            return;
        }
        let (stale, owned) = (slot.connection, slot.owned);
        slot.connection = connection;
        slot.owned = false;
        slot.kind = ConnectionKind::Online;
        slot.opened_at = now;
        slot.last_recv = now;
        if owned {
            net.close(stale);
        }
        debug!("group {}: moved link for {identity} from {stale} to {connection}", self.group);
    }

    /// The join connection must survive until the handshake completes.
    fn protected_connection(&self) -> Option<ConnectionId> {
        if self.join_pending {
            self.joined_via
        } else {
            None
        }
    }

    fn teardown_connection<C: ConnectionLayer>(&mut self, net: &mut C, index: usize) {
        if let Some(slot) = self.mesh.release(index) {
            debug!(
                "group {}: released {} (closest: {})",
                self.group, slot.connection, slot.closest
            );
            if slot.owned {
                net.close(slot.connection);
            }
        }
    }

    /// Refresh the last-activity time of a known connection.
    fn touch_connection(&mut self, connection: ConnectionId, now: u64) {
        if let Some(index) = self.mesh.find_connection(connection) {
            if let Some(slot) = self.mesh.get_mut(index) {
                slot.last_recv = now;
            }
        }
    }

    fn update_status(&mut self) {
        let status = if self.mesh.has_online() && !self.join_pending {
            GroupStatus::Connected
        } else {
            GroupStatus::Valid
        };
        if status != self.status {
            info!("group {}: {:?} -> {:?}", self.group, self.status, status);
            self.status = status;
        }
    }

    // ── Incoming ─────────────────────────────────────────────────────────

    /// Process one decoded packet that belongs to this room.
    pub fn handle_packet<C: ConnectionLayer>(
        &mut self,
        net: &mut C,
        cfg: &GroupConfig,
        connection: ConnectionId,
        packet: GroupPacket,
        raw: &[u8],
        now: u64,
    ) -> Vec<GroupEvent> {
        self.touch_connection(connection, now);
        match packet {
            GroupPacket::Invite { .. } => vec![],
            GroupPacket::JoinRequest {
                identity_key,
                session_key,
                slot_id,
                nickname,
                ..
            } => {
                let announcement = PeerAnnouncement {
                    slot_id,
                    identity_key,
                    session_key,
                    nickname,
                    last_sequence: 0,
                };
                self.handle_join_request(net, cfg, connection, announcement, now)
            }
            GroupPacket::JoinAccept {
                assigned_slot,
                inviter_slot,
                peers,
                ..
            } => self.handle_join_accept(cfg, connection, assigned_slot, inviter_slot, peers, now),
            GroupPacket::Online {
                slot_id,
                identity_key,
                ..
            } => {
                self.handle_online(net, connection, slot_id, identity_key, now);
                vec![]
            }
            GroupPacket::PeerQuery { .. } => {
                let response = GroupPacket::PeerResponse {
                    identifier: self.identifier,
                    peers: self.roster(),
                };
                if let Err(e) = self.send_direct(net, connection, &response) {
                    debug!("group {}: peer response failed: {e}", self.group);
                }
                vec![]
            }
            GroupPacket::PeerResponse { peers, .. } => {
                let mut events = Vec::new();
                for announcement in &peers {
                    events.extend(self.learn_peer(cfg, announcement, now));
                }
                events
            }
            GroupPacket::Broadcast(frame) => self.handle_frame(net, cfg, connection, frame, raw, now),
        }
    }

    fn handle_online<C: ConnectionLayer>(
        &mut self,
        net: &mut C,
        connection: ConnectionId,
        slot: SlotId,
        identity: PublicKey,
        now: u64,
    ) {
        let known = self
            .members
            .get(slot)
            .is_some_and(|peer| peer.identity_key == identity);
        if known {
            self.adopt_connection(net, connection, identity, now);
            self.update_status();
            return;
        }
        debug!("group {}: online from unknown peer {slot}, querying", self.group);
        let query = GroupPacket::PeerQuery {
            identifier: self.identifier,
        };
        if let Err(e) = self.send_direct(net, connection, &query) {
            debug!("group {}: peer query on {connection} failed: {e}", self.group);
        }
    }

    fn handle_frame<C: ConnectionLayer>(
        &mut self,
        net: &mut C,
        cfg: &GroupConfig,
        connection: ConnectionId,
        frame: GroupFrame,
        raw: &[u8],
        now: u64,
    ) -> Vec<GroupEvent> {
        if frame.sender == self.local_slot || frame.sender_key == self.local_identity {
            return vec![];
        }

        let Some(peer) = self.members.get(frame.sender) else {
            if !self.members.is_tombstoned(frame.sender) && !self.join_pending {
                debug!("group {}: frame from unknown peer {}, querying", self.group, frame.sender);
                let query = GroupPacket::PeerQuery {
                    identifier: self.identifier,
                };
                if let Err(e) = self.send_direct(net, connection, &query) {
                    debug!("group {}: peer query on {connection} failed: {e}", self.group);
                }
            }
            return vec![];
        };
        if peer.identity_key != frame.sender_key {
            debug!("group {}: slot {} identity mismatch, dropped", self.group, frame.sender);
            return vec![];
        }
        if frame.sequence <= peer.last_sequence {
            trace!(
                "group {}: duplicate {} from {} (last {})",
                self.group,
                frame.sequence,
                frame.sender,
                peer.last_sequence
            );
            return vec![];
        }
        if let Some(peer) = self.members.get_mut(frame.sender) {
            peer.last_sequence = frame.sequence;
            peer.last_seen = now;
        }

        // Gossip: pass the frame on unchanged.
        self.send_raw_all(net, raw, Some(connection));

        let sender = frame.sender;
        match frame.body {
            FrameBody::Ping => vec![],
            FrameBody::NewPeer(announcement) => self.learn_peer(cfg, &announcement, now),
            FrameBody::KillPeer => {
                info!("group {}: peer {sender} left", self.group);
                self.remove_peer(net, cfg, sender, now).into_iter().collect()
            }
            FrameBody::Name(name) => {
                if name.len() > MAX_NAME_LENGTH {
                    return vec![];
                }
                match self.members.rename(sender, &name) {
                    Some(true) => vec![self.changed(sender, NameListChange::Renamed)],
                    _ => vec![],
                }
            }
            FrameBody::Message(payload) if payload.len() <= MAX_GROUP_MESSAGE_LENGTH => {
                vec![GroupEvent::Message {
                    group: self.group,
                    peer: sender,
                    payload,
                }]
            }
            FrameBody::Action(payload) if payload.len() <= MAX_GROUP_MESSAGE_LENGTH => {
                vec![GroupEvent::Action {
                    group: self.group,
                    peer: sender,
                    payload,
                }]
            }
            FrameBody::Message(_) | FrameBody::Action(_) => vec![],
        }
    }

    // ── Maintenance ──────────────────────────────────────────────────────

    /// One maintenance tick: evict silent peers, repair the mesh, ping.
    pub fn do_maintenance<C: ConnectionLayer>(
        &mut self,
        net: &mut C,
        cfg: &GroupConfig,
        now: u64,
    ) -> Vec<GroupEvent> {
        let mut events = Vec::new();

        self.members.expire_tombstones(now);
        if let Some(me) = self.members.get_mut(self.local_slot) {
            me.last_seen = now;
        }

        if !self.join_pending {
            for slot in self.members.timed_out(now, cfg.peer_timeout_ms, self.local_slot) {
                info!("group {}: peer {slot} timed out", self.group);
                events.extend(self.remove_peer(net, cfg, slot, now));
            }
        }

        self.mesh.rebuild(self.members.iter());
        self.refresh_connections(net, cfg, now);
        self.mesh.refresh_closest_flags();
        self.connect_closest(net, now);
        self.update_status();

        if self.mesh.has_online() && now.saturating_sub(self.last_ping_sent) >= cfg.ping_interval_ms {
            self.last_ping_sent = now;
            if let Err(e) = self.broadcast(net, FrameBody::Ping, None) {
                warn!("group {}: ping failed: {e}", self.group);
            }
        }

        if self.join_pending && now.saturating_sub(self.last_join_request) >= cfg.ping_interval_ms {
            self.send_join_request(net, now);
        }

        events
    }

    /// Promote links that came up, drop those that failed or went idle.
    fn refresh_connections<C: ConnectionLayer>(&mut self, net: &mut C, cfg: &GroupConfig, now: u64) {
        let protected = self.protected_connection();
        let snapshot: Vec<(usize, MeshConnection)> =
            self.mesh.connections().map(|(i, c)| (i, *c)).collect();

        for (index, slot) in snapshot {
            if Some(slot.connection) == protected {
                continue;
            }
            let up = net.is_online(slot.connection);
            match slot.kind {
                ConnectionKind::Connecting if up => self.promote(net, index, now),
                ConnectionKind::Connecting => {
                    if now.saturating_sub(slot.opened_at) >= cfg.connect_timeout_ms {
                        debug!("group {}: {} never came up", self.group, slot.connection);
                        self.teardown_connection(net, index);
                    }
                }
                ConnectionKind::Online if !up => {
                    debug!("group {}: {} went down", self.group, slot.connection);
                    self.teardown_connection(net, index);
                }
                ConnectionKind::Online => {
                    if now.saturating_sub(slot.last_recv) >= cfg.connection_timeout_ms {
                        debug!("group {}: {} idle, dropping", self.group, slot.connection);
                        self.teardown_connection(net, index);
                    }
                }
            }
        }
    }

    /// Mark a connecting slot online and introduce ourselves on it.
    fn promote<C: ConnectionLayer>(&mut self, net: &mut C, index: usize, now: u64) {
        let Some(slot) = self.mesh.get_mut(index) else {
            return;
        };
        slot.kind = ConnectionKind::Online;
        slot.last_recv = now;
        let (connection, owned) = (slot.connection, slot.owned);
        if owned {
            let hello = GroupPacket::Online {
                identifier: self.identifier,
                slot_id: self.local_slot,
                identity_key: self.local_identity,
            };
            if let Err(e) = self.send_direct(net, connection, &hello) {
                debug!("group {}: online packet on {connection} failed: {e}", self.group);
            }
        }
    }

    /// Open connections to closest candidates that have none.
    fn connect_closest<C: ConnectionLayer>(&mut self, net: &mut C, now: u64) {
        if self.join_pending {
            return;
        }
        for candidate in self.mesh.missing_closest() {
            let connection = match net.open(&candidate.identity_key) {
                Ok(connection) => connection,
                Err(e) => {
                    warn!(
                        "group {}: connect to peer {} failed, will retry: {e}",
                        self.group, candidate.slot_id
                    );
                    continue;
                }
            };

            if let Some(index) = self.mesh.find_connection(connection) {
                // The layer handed back a link we already hold.
                net.close(connection);
                if let Some(slot) = self.mesh.get_mut(index) {
                    slot.identity = Some(candidate.identity_key);
                    slot.closest = true;
                }
                continue;
            }

            if self.mesh.is_full() {
                match self.mesh.eviction_candidate(self.protected_connection()) {
                    Some(index) => self.teardown_connection(net, index),
                    None => {
                        net.close(connection);
                        break;
                    }
                }
            }

            let occupied = self.mesh.occupy(MeshConnection {
                kind: ConnectionKind::Connecting,
                closest: true,
                connection,
                group: self.group,
                identity: Some(candidate.identity_key),
                owned: true,
                opened_at: now,
                last_recv: now,
            });
            match occupied {
                Some(index) if net.is_online(connection) => self.promote(net, index, now),
                Some(_) => {}
                None => net.close(connection),
            }
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    /// Say goodbye and release every connection slot.
    pub fn teardown<C: ConnectionLayer>(&mut self, net: &mut C) {
        if self.mesh.has_online() {
            if let Err(e) = self.broadcast(net, FrameBody::KillPeer, None) {
                debug!("group {}: departure broadcast failed: {e}", self.group);
            }
        }
        for slot in self.mesh.drain() {
            if slot.owned {
                net.close(slot.connection);
            }
        }
        self.status = GroupStatus::None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockConnections;
    use crate::types::MAX_GROUP_CONNECTIONS;

    fn key(seed: u8) -> PublicKey {
        PublicKey([seed; 32])
    }

    fn frame_bytes(frame: GroupFrame) -> Vec<u8> {
        GroupPacket::Broadcast(frame).to_bytes().unwrap()
    }

    /// A created session with one admitted peer on `link`.
    fn session_with_peer(net: &mut MockConnections, link: ConnectionId) -> (GroupSession, SlotId) {
        let cfg = GroupConfig::new();
        let mut session = GroupSession::create(0, key(1), b"alice", 1000);
        net.set_online(link, true);
        let request = GroupPacket::JoinRequest {
            identifier: *session.identifier(),
            identity_key: key(2),
            session_key: key(102),
            slot_id: 77,
            nickname: b"bob".to_vec(),
        };
        let raw = request.to_bytes().unwrap();
        session.handle_packet(net, &cfg, link, request, &raw, 1000);
        let slot = session.peer_slot_of(&key(2)).unwrap();
        (session, slot)
    }

    impl GroupSession {
        fn peer_slot_of(&self, identity: &PublicKey) -> Option<SlotId> {
            self.members.find_by_identity(identity).map(|p| p.slot_id)
        }
    }

    #[test]
    fn create_registers_local_peer() {
        let session = GroupSession::create(3, key(1), b"alice", 1000);
        assert_eq!(session.status(), GroupStatus::Valid);
        assert_eq!(session.member_count(), 1);
        let me = session.peer(session.local_slot()).unwrap();
        assert_eq!(me.identity_key, key(1));
        assert_eq!(me.nickname, b"alice");
        assert_ne!(me.session_key, me.identity_key);
    }

    #[test]
    fn join_request_admits_and_accepts() {
        let mut net = MockConnections::new(key(1));
        let link = ConnectionId(5);
        let (session, slot) = session_with_peer(&mut net, link);

        assert_eq!(slot, 77);
        assert_eq!(session.member_count(), 2);
        assert_eq!(session.status(), GroupStatus::Connected);
        assert_eq!(session.peer(77).unwrap().nickname, b"bob");

        let sent = net.sent_on(link);
        assert_eq!(sent.len(), 1);
        match GroupPacket::from_bytes(&sent[0]).unwrap() {
            GroupPacket::JoinAccept { assigned_slot, peers, .. } => {
                assert_eq!(assigned_slot, 77);
                assert_eq!(peers.len(), 2);
            }
            other => panic!("expected JoinAccept, got {other:?}"),
        }
    }

    #[test]
    fn send_payload_increments_counter_and_broadcasts() {
        let mut net = MockConnections::new(key(1));
        let link = ConnectionId(5);
        let (mut session, _) = session_with_peer(&mut net, link);
        net.sent.clear();

        let before = session.message_counter();
        session.send_payload(&mut net, PayloadKind::Message, b"hi").unwrap();
        assert!(session.message_counter() > before);
        session.send_payload(&mut net, PayloadKind::Action, b"waves").unwrap();
        assert_eq!(session.message_counter(), before + 2);
        assert_eq!(net.sent_on(link).len(), 2);
    }

    #[test]
    fn send_payload_rejects_too_long() {
        let mut net = MockConnections::new(key(1));
        let mut session = GroupSession::create(0, key(1), b"", 1000);
        let big = vec![0u8; MAX_GROUP_MESSAGE_LENGTH + 1];
        let err = session.send_payload(&mut net, PayloadKind::Message, &big).unwrap_err();
        assert!(matches!(err, GroupError::MessageTooLong { .. }));
        assert_eq!(session.message_counter(), 0);
    }

    #[test]
    fn send_payload_without_connections_fails() {
        let mut net = MockConnections::new(key(1));
        let mut session = GroupSession::create(0, key(1), b"", 1000);
        let err = session.send_payload(&mut net, PayloadKind::Message, b"x").unwrap_err();
        assert!(matches!(err, GroupError::Transport(TransportError::NoOnlineConnections)));
    }

    #[test]
    fn duplicate_and_stale_frames_are_dropped() {
        let cfg = GroupConfig::new();
        let mut net = MockConnections::new(key(1));
        let link = ConnectionId(5);
        let (mut session, slot) = session_with_peer(&mut net, link);

        let identifier = *session.identifier();
        let frame = |seq: u32| GroupFrame {
            identifier,
            sender: slot,
            sender_key: key(2),
            sequence: seq,
            body: FrameBody::Message(b"hello".to_vec()),
        };

        let first = frame(5);
        let raw = frame_bytes(first.clone());
        let events = session.handle_packet(&mut net, &cfg, link, GroupPacket::Broadcast(first), &raw, 2000);
        assert_eq!(events.len(), 1);

        let again = frame(5);
        let raw = frame_bytes(again.clone());
        assert!(session
            .handle_packet(&mut net, &cfg, link, GroupPacket::Broadcast(again), &raw, 2000)
            .is_empty());

        let older = frame(4);
        let raw = frame_bytes(older.clone());
        assert!(session
            .handle_packet(&mut net, &cfg, link, GroupPacket::Broadcast(older), &raw, 2000)
            .is_empty());

        assert_eq!(session.peer(slot).unwrap().last_sequence, 5);
    }

    #[test]
    fn frame_with_wrong_identity_is_dropped() {
        let cfg = GroupConfig::new();
        let mut net = MockConnections::new(key(1));
        let link = ConnectionId(5);
        let (mut session, slot) = session_with_peer(&mut net, link);

        let forged = GroupFrame {
            identifier: *session.identifier(),
            sender: slot,
            sender_key: key(9),
            sequence: 100,
            body: FrameBody::Message(b"spoof".to_vec()),
        };
        let raw = frame_bytes(forged.clone());
        assert!(session
            .handle_packet(&mut net, &cfg, link, GroupPacket::Broadcast(forged), &raw, 2000)
            .is_empty());
        assert_eq!(session.peer(slot).unwrap().last_sequence, 0);
    }

    #[test]
    fn frame_from_unknown_slot_triggers_peer_query() {
        let cfg = GroupConfig::new();
        let mut net = MockConnections::new(key(1));
        let link = ConnectionId(5);
        let (mut session, _) = session_with_peer(&mut net, link);
        net.sent.clear();

        let frame = GroupFrame {
            identifier: *session.identifier(),
            sender: 4242,
            sender_key: key(3),
            sequence: 1,
            body: FrameBody::Message(b"who am i".to_vec()),
        };
        let raw = frame_bytes(frame.clone());
        let events = session.handle_packet(&mut net, &cfg, link, GroupPacket::Broadcast(frame), &raw, 2000);
        assert!(events.is_empty());

        let sent = net.sent_on(link);
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            GroupPacket::from_bytes(&sent[0]).unwrap(),
            GroupPacket::PeerQuery { .. }
        ));
    }

    #[test]
    fn peer_query_on_dead_link_is_dropped() {
        let cfg = GroupConfig::new();
        let mut net = MockConnections::new(key(1));
        let link = ConnectionId(5);
        let (mut session, _) = session_with_peer(&mut net, link);
        net.sent.clear();
        net.set_online(link, false);

        let frame = GroupFrame {
            identifier: *session.identifier(),
            sender: 4242,
            sender_key: key(3),
            sequence: 1,
            body: FrameBody::Message(b"who am i".to_vec()),
        };
        let raw = frame_bytes(frame.clone());
        let events = session.handle_packet(&mut net, &cfg, link, GroupPacket::Broadcast(frame), &raw, 2000);
        assert!(events.is_empty());

        let online = GroupPacket::Online {
            identifier: *session.identifier(),
            slot_id: 4343,
            identity_key: key(4),
        };
        let raw = online.to_bytes().unwrap();
        assert!(session.handle_packet(&mut net, &cfg, link, online, &raw, 2000).is_empty());
        assert!(net.sent.is_empty());
        assert_eq!(session.member_count(), 2);
    }

    #[test]
    fn kill_peer_removes_and_tombstones() {
        let cfg = GroupConfig::new();
        let mut net = MockConnections::new(key(1));
        let link = ConnectionId(5);
        let (mut session, slot) = session_with_peer(&mut net, link);
        session.take_changed();

        let kill = GroupFrame {
            identifier: *session.identifier(),
            sender: slot,
            sender_key: key(2),
            sequence: 1,
            body: FrameBody::KillPeer,
        };
        let raw = frame_bytes(kill.clone());
        let events = session.handle_packet(&mut net, &cfg, link, GroupPacket::Broadcast(kill), &raw, 2000);

        assert_eq!(
            events,
            vec![GroupEvent::NameListChanged {
                group: 0,
                peer: slot,
                change: NameListChange::Removed,
            }]
        );
        assert_eq!(session.member_count(), 1);
        assert!(session.take_changed());
        assert_eq!(session.mesh().occupied(), 0);
        assert_eq!(session.status(), GroupStatus::Valid);

        // A late frame for the old slot is not reattributed.
        let late = GroupFrame {
            identifier: *session.identifier(),
            sender: slot,
            sender_key: key(2),
            sequence: 2,
            body: FrameBody::Message(b"late".to_vec()),
        };
        let raw = frame_bytes(late.clone());
        assert!(session
            .handle_packet(&mut net, &cfg, link, GroupPacket::Broadcast(late), &raw, 2001)
            .is_empty());
    }

    #[test]
    fn name_frame_renames_peer() {
        let cfg = GroupConfig::new();
        let mut net = MockConnections::new(key(1));
        let link = ConnectionId(5);
        let (mut session, slot) = session_with_peer(&mut net, link);

        let rename = GroupFrame {
            identifier: *session.identifier(),
            sender: slot,
            sender_key: key(2),
            sequence: 1,
            body: FrameBody::Name(b"robert".to_vec()),
        };
        let raw = frame_bytes(rename.clone());
        let events = session.handle_packet(&mut net, &cfg, link, GroupPacket::Broadcast(rename), &raw, 2000);
        assert_eq!(events.len(), 1);
        assert_eq!(session.peer(slot).unwrap().nickname, b"robert");
    }

    #[test]
    fn maintenance_evicts_silent_peer() {
        let cfg = GroupConfig::new().peer_timeout_ms(5_000);
        let mut net = MockConnections::new(key(1));
        let link = ConnectionId(5);
        let (mut session, slot) = session_with_peer(&mut net, link);

        let events = session.do_maintenance(&mut net, &cfg, 3_000);
        assert!(events.is_empty());

        let events = session.do_maintenance(&mut net, &cfg, 6_000);
        assert_eq!(
            events,
            vec![GroupEvent::NameListChanged {
                group: 0,
                peer: slot,
                change: NameListChange::Removed,
            }]
        );
        assert_eq!(session.member_count(), 1);
    }

    #[test]
    fn maintenance_opens_closest_connections() {
        let cfg = GroupConfig::new();
        let mut net = MockConnections::new(key(1));
        let link = ConnectionId(5);
        let (mut session, _) = session_with_peer(&mut net, link);

        // Learn a third peer through a roster response
        let response = GroupPacket::PeerResponse {
            identifier: *session.identifier(),
            peers: vec![PeerAnnouncement {
                slot_id: 900,
                identity_key: key(3),
                session_key: key(103),
                nickname: b"carol".to_vec(),
                last_sequence: 0,
            }],
        };
        let raw = response.to_bytes().unwrap();
        session.handle_packet(&mut net, &cfg, link, response, &raw, 1500);

        session.do_maintenance(&mut net, &cfg, 2_000);

        let carol = net.connection_to(&key(3)).expect("opened a link to carol");
        let index = session.mesh().find_connection(carol).unwrap();
        let slot = session.mesh().get(index).unwrap();
        assert!(slot.closest);
        assert!(slot.owned);
        assert_eq!(slot.kind, ConnectionKind::Online);
        // Introduced ourselves on the new link
        assert!(net
            .sent_on(carol)
            .iter()
            .any(|p| matches!(GroupPacket::from_bytes(p), Ok(GroupPacket::Online { .. }))));
    }

    #[test]
    fn maintenance_drops_failed_connection() {
        let cfg = GroupConfig::new();
        let mut net = MockConnections::new(key(1));
        let link = ConnectionId(5);
        let (mut session, _) = session_with_peer(&mut net, link);
        net.fail_open = true;

        net.set_online(link, false);
        session.do_maintenance(&mut net, &cfg, 2_000);
        assert_eq!(session.mesh().occupied(), 0);
        assert_eq!(session.status(), GroupStatus::Valid);
        // Lent connection is not ours to close
        assert!(net.closed.is_empty());
    }

    #[test]
    fn maintenance_pings_on_interval() {
        let cfg = GroupConfig::new().ping_interval_ms(1_000);
        let mut net = MockConnections::new(key(1));
        let link = ConnectionId(5);
        let (mut session, _) = session_with_peer(&mut net, link);
        net.sent.clear();
        net.fail_open = true;

        session.do_maintenance(&mut net, &cfg, 1_500);
        let counter = session.message_counter();
        session.do_maintenance(&mut net, &cfg, 1_600);
        assert_eq!(session.message_counter(), counter, "no second ping inside interval");
        session.do_maintenance(&mut net, &cfg, 2_600);
        assert_eq!(session.message_counter(), counter + 1);
    }

    #[test]
    fn teardown_closes_owned_connections() {
        let cfg = GroupConfig::new();
        let mut net = MockConnections::new(key(1));
        let link = ConnectionId(5);
        let (mut session, _) = session_with_peer(&mut net, link);
        let response = GroupPacket::PeerResponse {
            identifier: *session.identifier(),
            peers: vec![PeerAnnouncement {
                slot_id: 900,
                identity_key: key(3),
                session_key: key(103),
                nickname: Vec::new(),
                last_sequence: 0,
            }],
        };
        let raw = response.to_bytes().unwrap();
        session.handle_packet(&mut net, &cfg, link, response, &raw, 1500);
        session.do_maintenance(&mut net, &cfg, 2_000);
        let carol = net.connection_to(&key(3)).unwrap();

        session.teardown(&mut net);
        assert_eq!(session.mesh().occupied(), 0);
        assert_eq!(net.closed, vec![carol]);
        assert_eq!(session.status(), GroupStatus::None);
    }

    /// Fill every pool slot with anonymous online links, quietest first.
    fn fill_pool(session: &mut GroupSession, net: &mut MockConnections, since: u64) {
        for i in 0..MAX_GROUP_CONNECTIONS {
            let connection = ConnectionId(2000 + i as u32);
            net.set_online(connection, true);
            session.mesh.occupy(MeshConnection {
                kind: ConnectionKind::Online,
                closest: false,
                connection,
                group: 0,
                identity: None,
                owned: true,
                opened_at: since,
                last_recv: since + i as u64,
            });
        }
        assert!(session.mesh().is_full());
    }

    fn learn_carol(session: &mut GroupSession, net: &mut MockConnections, via: ConnectionId, now: u64) {
        let response = GroupPacket::PeerResponse {
            identifier: *session.identifier(),
            peers: vec![PeerAnnouncement {
                slot_id: 900,
                identity_key: key(3),
                session_key: key(103),
                nickname: b"carol".to_vec(),
                last_sequence: 0,
            }],
        };
        let raw = response.to_bytes().unwrap();
        session.handle_packet(net, &GroupConfig::new(), via, response, &raw, now);
    }

    #[test]
    fn rejoin_with_new_session_key_restarts_sequence() {
        let cfg = GroupConfig::new();
        let mut net = MockConnections::new(key(1));
        let link = ConnectionId(5);
        let (mut session, slot) = session_with_peer(&mut net, link);
        let identifier = *session.identifier();
        let message = |seq: u32| GroupFrame {
            identifier,
            sender: slot,
            sender_key: key(2),
            sequence: seq,
            body: FrameBody::Message(b"hello".to_vec()),
        };

        let before = message(50);
        let raw = frame_bytes(before.clone());
        let events = session.handle_packet(&mut net, &cfg, link, GroupPacket::Broadcast(before), &raw, 2000);
        assert_eq!(events.len(), 1);

        // Bob restarts and comes back on a fresh link with a new session key.
        let relink = ConnectionId(6);
        net.set_online(relink, true);
        let request = GroupPacket::JoinRequest {
            identifier,
            identity_key: key(2),
            session_key: key(103),
            slot_id: 4321,
            nickname: b"bob".to_vec(),
        };
        let raw = request.to_bytes().unwrap();
        let events = session.handle_packet(&mut net, &cfg, relink, request, &raw, 3000);
        assert!(events.is_empty());
        assert_eq!(session.peer_slot_of(&key(2)), Some(slot));
        assert_eq!(session.member_count(), 2);

        let bob = session.peer(slot).unwrap();
        assert_eq!(bob.session_key, key(103));
        assert_eq!(bob.last_sequence, 0);

        let index = session.mesh().find_connection(relink).expect("bound to the new link");
        assert_eq!(session.mesh().get(index).unwrap().identity, Some(key(2)));
        assert!(session.mesh().find_connection(link).is_none());
        assert_eq!(session.mesh().occupied(), 1);
        // The old link was lent, so it is released rather than closed
        assert!(net.closed.is_empty());

        let after = message(1);
        let raw = frame_bytes(after.clone());
        let events = session.handle_packet(&mut net, &cfg, relink, GroupPacket::Broadcast(after), &raw, 3100);
        assert_eq!(events.len(), 1);
        assert_eq!(session.peer(slot).unwrap().last_sequence, 1);
    }

    #[test]
    fn rotated_key_from_roster_adopts_its_sequence() {
        let cfg = GroupConfig::new();
        let mut net = MockConnections::new(key(1));
        let link = ConnectionId(5);
        let (mut session, slot) = session_with_peer(&mut net, link);
        let identifier = *session.identifier();

        let old = GroupFrame {
            identifier,
            sender: slot,
            sender_key: key(2),
            sequence: 50,
            body: FrameBody::Ping,
        };
        let raw = frame_bytes(old.clone());
        session.handle_packet(&mut net, &cfg, link, GroupPacket::Broadcast(old), &raw, 2000);
        assert_eq!(session.peer(slot).unwrap().last_sequence, 50);

        let response = GroupPacket::PeerResponse {
            identifier,
            peers: vec![PeerAnnouncement {
                slot_id: slot,
                identity_key: key(2),
                session_key: key(103),
                nickname: b"bob".to_vec(),
                last_sequence: 3,
            }],
        };
        let raw = response.to_bytes().unwrap();
        assert!(session.handle_packet(&mut net, &cfg, link, response, &raw, 2500).is_empty());

        let bob = session.peer(slot).unwrap();
        assert_eq!(bob.session_key, key(103));
        assert_eq!(bob.last_sequence, 3);
    }

    #[test]
    fn overlong_name_frame_is_dropped() {
        let cfg = GroupConfig::new();
        let mut net = MockConnections::new(key(1));
        let link = ConnectionId(5);
        let (mut session, slot) = session_with_peer(&mut net, link);
        session.take_changed();

        let rename = GroupFrame {
            identifier: *session.identifier(),
            sender: slot,
            sender_key: key(2),
            sequence: 1,
            body: FrameBody::Name(vec![b'x'; MAX_NAME_LENGTH + 1]),
        };
        let raw = frame_bytes(rename.clone());
        let events = session.handle_packet(&mut net, &cfg, link, GroupPacket::Broadcast(rename), &raw, 2000);
        assert!(events.is_empty());
        assert_eq!(session.peer(slot).unwrap().nickname, b"bob");
        assert!(!session.take_changed());
    }

    #[test]
    fn maintenance_abandons_connection_that_never_comes_up() {
        let cfg = GroupConfig::new().connect_timeout_ms(10_000);
        let mut net = MockConnections::new(key(1));
        let link = ConnectionId(5);
        let (mut session, _) = session_with_peer(&mut net, link);
        learn_carol(&mut session, &mut net, link, 1500);
        net.auto_online = false;

        session.do_maintenance(&mut net, &cfg, 2_000);
        let pending = net.connection_to(&key(3)).unwrap();
        let index = session.mesh().find_connection(pending).unwrap();
        assert_eq!(session.mesh().get(index).unwrap().kind, ConnectionKind::Connecting);

        session.do_maintenance(&mut net, &cfg, 11_999);
        assert!(session.mesh().find_connection(pending).is_some());
        assert!(net.closed.is_empty());

        session.do_maintenance(&mut net, &cfg, 12_000);
        assert!(session.mesh().find_connection(pending).is_none());
        assert_eq!(net.closed, vec![pending]);
        // A fresh attempt replaces it
        let retry = net.connection_to(&key(3)).unwrap();
        assert_ne!(retry, pending);
        assert!(session.mesh().find_connection(retry).is_some());
    }

    #[test]
    fn maintenance_drops_idle_connection() {
        let cfg = GroupConfig::new().connection_timeout_ms(5_000);
        let mut net = MockConnections::new(key(1));
        let link = ConnectionId(5);
        let (mut session, _) = session_with_peer(&mut net, link);

        session.do_maintenance(&mut net, &cfg, 5_999);
        assert!(session.mesh().find_connection(link).is_some());

        session.do_maintenance(&mut net, &cfg, 6_000);
        assert!(session.mesh().find_connection(link).is_none());
        assert!(net.closed.is_empty());
        // Bob is still a closest candidate, so a link of our own replaces it
        let own = net.connection_to(&key(2)).unwrap();
        let index = session.mesh().find_connection(own).unwrap();
        assert!(session.mesh().get(index).unwrap().owned);
    }

    #[test]
    fn full_pool_evicts_quietest_for_closest_joiner() {
        let cfg = GroupConfig::new();
        let mut net = MockConnections::new(key(1));
        let mut session = GroupSession::create(0, key(1), b"alice", 1000);
        fill_pool(&mut session, &mut net, 1000);

        let link = ConnectionId(5);
        net.set_online(link, true);
        let request = GroupPacket::JoinRequest {
            identifier: *session.identifier(),
            identity_key: key(2),
            session_key: key(102),
            slot_id: 77,
            nickname: b"bob".to_vec(),
        };
        let raw = request.to_bytes().unwrap();
        session.handle_packet(&mut net, &cfg, link, request, &raw, 1100);

        assert_eq!(net.closed, vec![ConnectionId(2000)]);
        assert_eq!(session.mesh().occupied(), MAX_GROUP_CONNECTIONS);
        let index = session.mesh().find_connection(link).unwrap();
        assert!(session.mesh().get(index).unwrap().closest);
    }

    #[test]
    fn full_pool_keeps_slots_when_open_fails() {
        let cfg = GroupConfig::new();
        let mut net = MockConnections::new(key(1));
        let mut session = GroupSession::create(0, key(1), b"alice", 1000);
        fill_pool(&mut session, &mut net, 1000);
        learn_carol(&mut session, &mut net, ConnectionId(99), 1500);

        net.fail_open = true;
        session.do_maintenance(&mut net, &cfg, 2_000);
        assert_eq!(session.mesh().occupied(), MAX_GROUP_CONNECTIONS);
        assert!(net.closed.is_empty());

        net.fail_open = false;
        session.do_maintenance(&mut net, &cfg, 2_100);
        assert_eq!(session.mesh().occupied(), MAX_GROUP_CONNECTIONS);
        assert_eq!(net.closed, vec![ConnectionId(2000)]);
        let carol = net.connection_to(&key(3)).unwrap();
        let slot = session.mesh().get(session.mesh().find_connection(carol).unwrap()).unwrap();
        assert!(slot.closest);
        assert!(slot.owned);
    }
}
