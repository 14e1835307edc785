/// Group chat for ToM.
///
/// Full-mesh-ish overlay: every member keeps connections to the few peers
/// closest to it by XOR distance and relays broadcast frames to its other
/// neighbours. Sessions are state machines driven by the registry.
pub mod mesh;
pub mod peer;
pub mod registry;
pub mod session;
pub mod types;
pub mod wire;

pub use mesh::{ClosestCandidate, ConnectionKind, Distance, MeshConnection, MeshSlots};
pub use peer::{PeerDirectory, PeerRecord};
pub use registry::{GroupChats, InviteHandler, NameListHandler, PayloadHandler};
pub use session::{GroupSession, PayloadKind};
pub use types::{GroupEvent, GroupStatus, NameListChange};
pub use wire::{
    FrameBody, GroupFrame, GroupPacket, InviteBlob, PeerAnnouncement, GROUPCHAT_TYPE_TEXT,
    INVITE_BLOB_LENGTH,
};
