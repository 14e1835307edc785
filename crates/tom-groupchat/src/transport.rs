use crate::error::TransportError;
use crate::types::{ConnectionId, PublicKey};

/// Pairwise connection layer consumed by the group layer.
///
/// In production: implemented by the friend-connection layer, which owns
/// handshakes and encryption. In tests: `MockConnections` or an in-memory
/// network. Every call is non-blocking; delivery is the implementor's job.
///
/// `open` acquires a handle and every successful `open` is paired with one
/// `close`. Handles lent by the caller (friend connections, inbound links)
/// are never closed by the group layer.
pub trait ConnectionLayer {
    /// Our own long-term identity key.
    fn local_identity(&self) -> PublicKey;

    /// Open (or share) a connection to `identity`.
    fn open(&mut self, identity: &PublicKey) -> Result<ConnectionId, TransportError>;

    /// Release a handle obtained from `open`.
    fn close(&mut self, connection: ConnectionId);

    /// Send one framed packet. Fails if the link is down.
    fn send(&mut self, connection: ConnectionId, data: &[u8]) -> Result<(), TransportError>;

    /// Whether the link behind `connection` is currently up.
    fn is_online(&self, connection: ConnectionId) -> bool;
}

// ── MockConnections (tests) ─────────────────────────────────────────────
