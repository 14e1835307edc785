/// Group wire format.
///
/// Every packet handed to the connection layer is a MessagePack-encoded
/// [`GroupPacket`]. The invite blob is the one exception: it is a fixed
/// 33-byte layout (identifier + discriminator) because applications carry
/// it around opaquely between the invite callback and `join_groupchat`.
use serde::{Deserialize, Serialize};

use crate::error::GroupError;
use crate::types::{GroupIdentifier, PublicKey, SlotId, GROUP_IDENTIFIER_LENGTH};

/// Discriminator for text chat rooms.
pub const GROUPCHAT_TYPE_TEXT: u8 = 0;

/// Size of a serialized invite blob.
pub const INVITE_BLOB_LENGTH: usize = GROUP_IDENTIFIER_LENGTH + 1;

// ── InviteBlob ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InviteBlob {
    pub identifier: GroupIdentifier,
    pub kind: u8,
}

impl InviteBlob {
    pub fn new(identifier: GroupIdentifier) -> Self {
        Self {
            identifier,
            kind: GROUPCHAT_TYPE_TEXT,
        }
    }

    pub fn to_bytes(&self) -> [u8; INVITE_BLOB_LENGTH] {
        let mut out = [0u8; INVITE_BLOB_LENGTH];
        out[..GROUP_IDENTIFIER_LENGTH].copy_from_slice(self.identifier.as_bytes());
        out[GROUP_IDENTIFIER_LENGTH] = self.kind;
        out
    }

    /// Validate length and discriminator.
    pub fn parse(data: &[u8]) -> Result<Self, GroupError> {
        if data.len() != INVITE_BLOB_LENGTH {
            return Err(GroupError::MalformedInvite {
                reason: format!("expected {INVITE_BLOB_LENGTH} bytes, got {}", data.len()),
            });
        }
        let kind = data[GROUP_IDENTIFIER_LENGTH];
        if kind != GROUPCHAT_TYPE_TEXT {
            return Err(GroupError::MalformedInvite {
                reason: format!("unknown group type {kind}"),
            });
        }
        let mut identifier = [0u8; GROUP_IDENTIFIER_LENGTH];
        identifier.copy_from_slice(&data[..GROUP_IDENTIFIER_LENGTH]);
        Ok(Self {
            identifier: GroupIdentifier(identifier),
            kind,
        })
    }
}

// ── Frames ───────────────────────────────────────────────────────────────

/// What a node tells others about a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub slot_id: SlotId,
    pub identity_key: PublicKey,
    pub session_key: PublicKey,
    #[serde(default)]
    pub nickname: Vec<u8>,
    /// Announcer's view of the member's latest sequence number.
    #[serde(default)]
    pub last_sequence: u32,
}

/// Body of a broadcast frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameBody {
    /// Keep-alive.
    Ping,
    /// A member was admitted by the sender.
    NewPeer(PeerAnnouncement),
    /// The sender is leaving the room.
    KillPeer,
    /// The sender changed nickname.
    Name(Vec<u8>),
    Message(Vec<u8>),
    Action(Vec<u8>),
}

/// A sequenced broadcast. Relayed byte-for-byte across the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupFrame {
    pub identifier: GroupIdentifier,
    pub sender: SlotId,
    /// Identity the sender slot must map to.
    pub sender_key: PublicKey,
    /// Per-origin, strictly increasing.
    pub sequence: u32,
    pub body: FrameBody,
}

// ── GroupPacket ──────────────────────────────────────────────────────────

/// Everything the group layer puts on a pairwise connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupPacket {
    /// Invitation over a friend connection (inviter → friend).
    Invite { blob: Vec<u8> },

    /// Friend accepted the invite and asks to be admitted (joiner → inviter).
    JoinRequest {
        identifier: GroupIdentifier,
        identity_key: PublicKey,
        session_key: PublicKey,
        /// Proposed slot id; the inviter may assign another.
        slot_id: SlotId,
        #[serde(default)]
        nickname: Vec<u8>,
    },

    /// Admission with the full roster (inviter → joiner).
    JoinAccept {
        identifier: GroupIdentifier,
        assigned_slot: SlotId,
        inviter_slot: SlotId,
        peers: Vec<PeerAnnouncement>,
    },

    /// A mesh connection we opened came up; tells the far end who we are.
    Online {
        identifier: GroupIdentifier,
        slot_id: SlotId,
        identity_key: PublicKey,
    },

    /// Ask a neighbour for its roster (sent when a frame names an unknown slot).
    PeerQuery { identifier: GroupIdentifier },

    PeerResponse {
        identifier: GroupIdentifier,
        peers: Vec<PeerAnnouncement>,
    },

    Broadcast(GroupFrame),
}

impl GroupPacket {
    pub fn to_bytes(&self) -> Result<Vec<u8>, GroupError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(data)
    }

    /// Room this packet belongs to. `None` for invites, which are
    /// addressed to the application rather than to a session.
    pub fn identifier(&self) -> Option<&GroupIdentifier> {
        match self {
            GroupPacket::Invite { .. } => None,
            GroupPacket::JoinRequest { identifier, .. }
            | GroupPacket::JoinAccept { identifier, .. }
            | GroupPacket::Online { identifier, .. }
            | GroupPacket::PeerQuery { identifier }
            | GroupPacket::PeerResponse { identifier, .. } => Some(identifier),
            GroupPacket::Broadcast(frame) => Some(&frame.identifier),
        }
    }
}
