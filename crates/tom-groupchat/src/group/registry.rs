/// The registry every caller drives.
///
/// Owns the connection layer, all sessions indexed by group number, the
/// local nickname and one optional handler per event kind. Handlers are
/// invoked after the session that produced the events has finished
/// mutating and never receive the registry, so they cannot re-enter it.
use tracing::{debug, info, warn};

use crate::config::GroupConfig;
use crate::error::GroupError;
use crate::group::peer::validate_name;
use crate::group::session::{GroupSession, PayloadKind};
use crate::group::types::{GroupEvent, GroupStatus, NameListChange};
use crate::group::wire::{GroupPacket, InviteBlob};
use crate::transport::ConnectionLayer;
use crate::types::{now_ms, ConnectionId, GroupIdentifier, GroupNumber, SlotId, MAX_NAME_LENGTH};

pub type InviteHandler = Box<dyn FnMut(ConnectionId, &[u8])>;
pub type PayloadHandler = Box<dyn FnMut(GroupNumber, SlotId, &[u8])>;
pub type NameListHandler = Box<dyn FnMut(GroupNumber, SlotId, NameListChange)>;

#[derive(Default)]
struct Callbacks {
    invite: Option<InviteHandler>,
    message: Option<PayloadHandler>,
    action: Option<PayloadHandler>,
    namelist: Option<NameListHandler>,
}

impl Callbacks {
    fn dispatch(&mut self, events: Vec<GroupEvent>) {
        for event in events {
            match event {
                GroupEvent::InviteReceived { connection, blob } => {
                    if let Some(handler) = self.invite.as_mut() {
                        handler(connection, &blob);
                    }
                }
                GroupEvent::Message { group, peer, payload } => {
                    if let Some(handler) = self.message.as_mut() {
                        handler(group, peer, &payload);
                    }
                }
                GroupEvent::Action { group, peer, payload } => {
                    if let Some(handler) = self.action.as_mut() {
                        handler(group, peer, &payload);
                    }
                }
                GroupEvent::NameListChanged { group, peer, change } => {
                    if let Some(handler) = self.namelist.as_mut() {
                        handler(group, peer, change);
                    }
                }
            }
        }
    }
}

pub struct GroupChats<C: ConnectionLayer> {
    connections: C,
    config: GroupConfig,
    /// `None` marks a vacant group number.
    chats: Vec<Option<GroupSession>>,
    callbacks: Callbacks,
    nickname: Vec<u8>,
    /// Time of the latest tick. Every operation is stamped with it.
    now: u64,
}

impl<C: ConnectionLayer> GroupChats<C> {
    pub fn new(connections: C, config: GroupConfig) -> Self {
        Self {
            connections,
            config,
            chats: Vec::new(),
            callbacks: Callbacks::default(),
            nickname: Vec::new(),
            now: now_ms(),
        }
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    pub fn connections(&self) -> &C {
        &self.connections
    }

    pub fn connections_mut(&mut self) -> &mut C {
        &mut self.connections
    }

    fn session(&self, group: GroupNumber) -> Result<&GroupSession, GroupError> {
        self.chats
            .get(group)
            .and_then(|s| s.as_ref())
            .ok_or(GroupError::GroupNotFound(group))
    }

    fn session_mut(&mut self, group: GroupNumber) -> Result<&mut GroupSession, GroupError> {
        self.chats
            .get_mut(group)
            .and_then(|s| s.as_mut())
            .ok_or(GroupError::GroupNotFound(group))
    }

    fn find_by_identifier(&self, identifier: &GroupIdentifier) -> Option<GroupNumber> {
        self.chats
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.identifier() == identifier))
    }

    /// Lowest vacant group number, growing the table if needed.
    fn vacant_number(&mut self) -> Result<GroupNumber, GroupError> {
        if let Some(index) = self.chats.iter().position(|s| s.is_none()) {
            return Ok(index);
        }
        if self.chats.len() >= self.config.max_groups {
            return Err(GroupError::NoFreeGroupSlot {
                max: self.config.max_groups,
            });
        }
        self.chats.push(None);
        Ok(self.chats.len() - 1)
    }

    // ── Callbacks ────────────────────────────────────────────────────────

    pub fn on_invite(&mut self, handler: impl FnMut(ConnectionId, &[u8]) + 'static) {
        self.callbacks.invite = Some(Box::new(handler));
    }

    pub fn on_message(&mut self, handler: impl FnMut(GroupNumber, SlotId, &[u8]) + 'static) {
        self.callbacks.message = Some(Box::new(handler));
    }

    pub fn on_action(&mut self, handler: impl FnMut(GroupNumber, SlotId, &[u8]) + 'static) {
        self.callbacks.action = Some(Box::new(handler));
    }

    pub fn on_namelist_change(
        &mut self,
        handler: impl FnMut(GroupNumber, SlotId, NameListChange) + 'static,
    ) {
        self.callbacks.namelist = Some(Box::new(handler));
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Create a new room with only ourselves in it.
    pub fn add_groupchat(&mut self) -> Result<GroupNumber, GroupError> {
        let group = self.vacant_number()?;
        let identity = self.connections.local_identity();
        let session = GroupSession::create(group, identity, &self.nickname, self.now);
        info!("group {group}: created as peer {}", session.local_slot());
        self.chats[group] = Some(session);
        Ok(group)
    }

    /// Leave a room: announce departure, release every connection, free the number.
    pub fn del_groupchat(&mut self, group: GroupNumber) -> Result<(), GroupError> {
        let mut session = self
            .chats
            .get_mut(group)
            .and_then(|s| s.take())
            .ok_or(GroupError::GroupNotFound(group))?;
        session.teardown(&mut self.connections);
        while matches!(self.chats.last(), Some(None)) {
            self.chats.pop();
        }
        info!("group {group}: deleted");
        Ok(())
    }

    /// Delete every session and hand the connection layer back.
    pub fn kill_groupchats(mut self) -> C {
        for slot in self.chats.iter_mut() {
            if let Some(mut session) = slot.take() {
                session.teardown(&mut self.connections);
            }
        }
        self.connections
    }

    // ── Invite / join ────────────────────────────────────────────────────

    /// Send this room's invite blob to a friend.
    pub fn invite_friend(&mut self, friend: ConnectionId, group: GroupNumber) -> Result<(), GroupError> {
        let identifier = *self.session(group)?.identifier();
        let packet = GroupPacket::Invite {
            blob: InviteBlob::new(identifier).to_bytes().to_vec(),
        };
        let bytes = packet.to_bytes()?;
        self.connections.send(friend, &bytes)?;
        debug!("group {group}: invited {friend}");
        Ok(())
    }

    /// Join the room named by an invite blob received from `friend`.
    pub fn join_groupchat(&mut self, friend: ConnectionId, blob: &[u8]) -> Result<GroupNumber, GroupError> {
        let invite = InviteBlob::parse(blob)?;
        if self.find_by_identifier(&invite.identifier).is_some() {
            return Err(GroupError::AlreadyJoined);
        }
        let group = self.vacant_number()?;
        let identity = self.connections.local_identity();
        let mut session = GroupSession::joining(
            group,
            invite.identifier,
            identity,
            &self.nickname,
            friend,
            self.now,
        );
        session.start_join(&mut self.connections, self.now);
        info!("group {group}: joining through {friend}");
        self.chats[group] = Some(session);
        Ok(group)
    }

    // ── Sending ──────────────────────────────────────────────────────────

    pub fn group_message_send(&mut self, group: GroupNumber, payload: &[u8]) -> Result<(), GroupError> {
        self.send_payload(group, PayloadKind::Message, payload)
    }

    pub fn group_action_send(&mut self, group: GroupNumber, payload: &[u8]) -> Result<(), GroupError> {
        self.send_payload(group, PayloadKind::Action, payload)
    }

    fn send_payload(&mut self, group: GroupNumber, kind: PayloadKind, payload: &[u8]) -> Result<(), GroupError> {
        let session = self
            .chats
            .get_mut(group)
            .and_then(|s| s.as_mut())
            .ok_or(GroupError::GroupNotFound(group))?;
        session.send_payload(&mut self.connections, kind, payload)
    }

    /// Set our nickname for rooms created or joined from now on.
    pub fn set_name(&mut self, name: &[u8]) -> Result<(), GroupError> {
        validate_name(name)?;
        self.nickname = name.to_vec();
        Ok(())
    }

    /// Push the current nickname into every room.
    pub fn send_name_all_groups(&mut self) {
        let mut events = Vec::new();
        for session in self.chats.iter_mut().flatten() {
            match session.set_local_name(&mut self.connections, &self.nickname) {
                Ok(event) => events.extend(event),
                Err(e) => warn!("failed to send name: {e}"),
            }
        }
        self.callbacks.dispatch(events);
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// Copy a member's name into `out`. Returns the name length.
    pub fn group_peername(
        &self,
        group: GroupNumber,
        peer: SlotId,
        out: &mut [u8; MAX_NAME_LENGTH],
    ) -> Result<usize, GroupError> {
        let name = self.peer_name(group, peer)?;
        let len = name.len().min(MAX_NAME_LENGTH);
        out[..len].copy_from_slice(&name[..len]);
        Ok(name.len())
    }

    pub fn peer_name(&self, group: GroupNumber, peer: SlotId) -> Result<&[u8], GroupError> {
        self.session(group)?
            .peer(peer)
            .map(|p| p.nickname.as_slice())
            .ok_or(GroupError::PeerNotFound { group, peer })
    }

    /// Number of members, ourselves included.
    pub fn group_number_peers(&self, group: GroupNumber) -> Result<usize, GroupError> {
        Ok(self.session(group)?.member_count())
    }

    /// Copy member names into caller buffers. Copies as many as fit in the
    /// shorter of `names` and `lengths` and returns that count.
    pub fn group_names(
        &self,
        group: GroupNumber,
        names: &mut [[u8; MAX_NAME_LENGTH]],
        lengths: &mut [usize],
    ) -> Result<usize, GroupError> {
        let session = self.session(group)?;
        let mut copied = 0;
        for ((peer, name), length) in session.members().zip(names.iter_mut()).zip(lengths.iter_mut()) {
            let len = peer.nickname.len().min(MAX_NAME_LENGTH);
            name[..len].copy_from_slice(&peer.nickname[..len]);
            *length = len;
            copied += 1;
        }
        Ok(copied)
    }

    /// `(slot id, nickname)` of every member.
    pub fn peer_names(&self, group: GroupNumber) -> Result<Vec<(SlotId, Vec<u8>)>, GroupError> {
        Ok(self
            .session(group)?
            .members()
            .map(|p| (p.slot_id, p.nickname.clone()))
            .collect())
    }

    /// Whether `peer` is our own slot in `group`.
    pub fn group_peernumber_is_ours(&self, group: GroupNumber, peer: SlotId) -> Result<bool, GroupError> {
        Ok(self.session(group)?.local_slot() == peer)
    }

    pub fn group_status(&self, group: GroupNumber) -> GroupStatus {
        self.session(group).map(|s| s.status()).unwrap_or(GroupStatus::None)
    }

    pub fn group_identifier(&self, group: GroupNumber) -> Result<GroupIdentifier, GroupError> {
        Ok(*self.session(group)?.identifier())
    }

    /// Read and clear a room's membership-changed flag.
    pub fn take_changed(&mut self, group: GroupNumber) -> Result<bool, GroupError> {
        Ok(self.session_mut(group)?.take_changed())
    }

    pub fn count_chatlist(&self) -> usize {
        self.chats.iter().flatten().count()
    }

    /// Write valid group numbers into `out`, if given, up to its length.
    /// Returns the number written, or the total count when `out` is `None`.
    pub fn copy_chatlist(&self, out: Option<&mut [GroupNumber]>) -> usize {
        let valid = self
            .chats
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| i);
        match out {
            None => valid.count(),
            Some(out) => {
                let mut written = 0;
                for (slot, group) in out.iter_mut().zip(valid) {
                    *slot = group;
                    written += 1;
                }
                written
            }
        }
    }

    // ── Driving ──────────────────────────────────────────────────────────

    /// Process one packet received on `connection`.
    pub fn handle_packet(&mut self, connection: ConnectionId, data: &[u8]) {
        let packet = match GroupPacket::from_bytes(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("undecodable group packet on {connection}: {e}");
                return;
            }
        };

        let Some(identifier) = packet.identifier().copied() else {
            if let GroupPacket::Invite { blob } = packet {
                self.callbacks
                    .dispatch(vec![GroupEvent::InviteReceived { connection, blob }]);
            }
            return;
        };

        let Some(group) = self.find_by_identifier(&identifier) else {
            debug!("packet on {connection} for unknown room {identifier:?}, dropped");
            return;
        };
        let Some(session) = self.chats.get_mut(group).and_then(|s| s.as_mut()) else {
            return;
        };
        let events = session.handle_packet(
            &mut self.connections,
            &self.config,
            connection,
            packet,
            data,
            self.now,
        );
        self.callbacks.dispatch(events);
    }

    /// Run one maintenance tick at the current wall-clock time.
    pub fn do_groupchats(&mut self) {
        self.do_groupchats_at(now_ms());
    }

    /// Run one maintenance tick at `now` (Unix ms).
    pub fn do_groupchats_at(&mut self, now: u64) {
        self.now = now;
        let mut events = Vec::new();
        for session in self.chats.iter_mut().flatten() {
            events.extend(session.do_maintenance(&mut self.connections, &self.config, now));
        }
        self.callbacks.dispatch(events);
    }
}
