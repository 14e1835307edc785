use crate::types::{ConnectionId, GroupNumber, SlotId};

/// Kind of membership change reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameListChange {
    Added,
    Removed,
    Renamed,
}

/// Lifecycle stage of a group number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupStatus {
    /// Slot unused.
    None,
    /// Room exists, no online mesh connection.
    Valid,
    /// At least one online mesh connection.
    Connected,
}

/// Application-visible group events.
///
/// Sessions return these; the registry hands them to the registered
/// callbacks once the session has finished mutating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    /// A friend invited us. `blob` goes unchanged to `join_groupchat`.
    InviteReceived {
        connection: ConnectionId,
        blob: Vec<u8>,
    },

    Message {
        group: GroupNumber,
        peer: SlotId,
        payload: Vec<u8>,
    },

    Action {
        group: GroupNumber,
        peer: SlotId,
        payload: Vec<u8>,
    },

    NameListChanged {
        group: GroupNumber,
        peer: SlotId,
        change: NameListChange,
    },
}
