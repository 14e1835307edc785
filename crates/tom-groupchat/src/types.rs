use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a long-term or session public key.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Length of a room identifier.
pub const GROUP_IDENTIFIER_LENGTH: usize = 32;

/// Maximum nickname length in bytes.
pub const MAX_NAME_LENGTH: usize = 128;

/// Maximum payload of a group message or action in bytes.
pub const MAX_GROUP_MESSAGE_LENGTH: usize = 1_300;

/// Target number of closest peers each node keeps a connection to.
pub const DESIRED_CLOSE_CONNECTIONS: usize = 4;

/// Capacity of the per-session connection pool.
pub const MAX_GROUP_CONNECTIONS: usize = 16;

/// Index of a session in the registry. Reused after deletion.
pub type GroupNumber = usize;

/// Wire-visible peer reference, unique within one room.
pub type SlotId = u16;

/// Opaque handle of a connection owned by the external connection layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

// ── PublicKey ────────────────────────────────────────────────────────────

/// A 32-byte public key. Used both for stable identities and for
/// per-room session keys; the two are never interchanged.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    /// Generate a random key (session keys, tests).
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    /// Short hex prefix for logs.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

impl From<[u8; PUBLIC_KEY_LENGTH]> for PublicKey {
    fn from(bytes: [u8; PUBLIC_KEY_LENGTH]) -> Self {
        Self(bytes)
    }
}

// ── GroupIdentifier ──────────────────────────────────────────────────────

/// Random room identifier, generated once by the creator and shared
/// verbatim through invites.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupIdentifier(pub [u8; GROUP_IDENTIFIER_LENGTH]);

impl GroupIdentifier {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; GROUP_IDENTIFIER_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for GroupIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupIdentifier(")?;
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
