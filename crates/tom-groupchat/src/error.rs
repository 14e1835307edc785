use crate::types::{ConnectionId, GroupNumber, SlotId};

/// Errors reported by the connection layer.
///
/// All of them are transient from the group layer's point of view:
/// the maintenance loop retries on the next tick.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("link {0} is down")]
    LinkDown(ConnectionId),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("no online connection in group")]
    NoOnlineConnections,
}

/// Group-level errors.
///
/// Not-found, capacity, malformed-input and transport failures. None of
/// them is fatal to the registry.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("group {0} not found")]
    GroupNotFound(GroupNumber),

    #[error("peer {peer} not found in group {group}")]
    PeerNotFound { group: GroupNumber, peer: SlotId },

    #[error("no free group slot (max {max})")]
    NoFreeGroupSlot { max: usize },

    #[error("malformed invite: {reason}")]
    MalformedInvite { reason: String },

    #[error("message too long: {len} bytes (max {max})")]
    MessageTooLong { len: usize, max: usize },

    #[error("name too long: {len} bytes (max {max})")]
    NameTooLong { len: usize, max: usize },

    #[error("already in the group this invite points to")]
    AlreadyJoined,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("encode error: {0}")]
    Encode(String),
}

impl From<rmp_serde::encode::Error> for GroupError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        GroupError::Encode(e.to_string())
    }
}
