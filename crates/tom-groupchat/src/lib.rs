//! ToM group chat layer.
//!
//! Multi-party rooms on top of pairwise links supplied by an external
//! connection layer (see [`ConnectionLayer`]). Tracks room membership,
//! keeps a bounded mesh of connections to the closest members and
//! sequences broadcast frames so relayed copies are delivered once.
//!
//! Wire format: MessagePack (compact binary).
//! Single-threaded and tick-driven: call [`GroupChats::do_groupchats`]
//! from your own loop.

pub mod config;
pub mod error;
pub mod group;
pub mod transport;
pub mod types;

pub use config::GroupConfig;
pub use error::{GroupError, TransportError};
pub use group::{
    FrameBody, GroupChats, GroupEvent, GroupFrame, GroupPacket, GroupStatus, InviteBlob,
    MeshSlots, NameListChange, PeerAnnouncement, PeerRecord, INVITE_BLOB_LENGTH,
};
pub use transport::ConnectionLayer;
pub use types::{
    now_ms, ConnectionId, GroupIdentifier, GroupNumber, PublicKey, SlotId,
    DESIRED_CLOSE_CONNECTIONS, MAX_GROUP_CONNECTIONS, MAX_GROUP_MESSAGE_LENGTH, MAX_NAME_LENGTH,
};
