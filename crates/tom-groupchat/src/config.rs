/// Configuration for a [`GroupChats`](crate::GroupChats) registry.
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use tom_groupchat::GroupConfig;
///
/// let config = GroupConfig::new()
///     .ping_interval_ms(5_000)
///     .peer_timeout_ms(20_000);
/// assert_eq!(config.peer_timeout(), 20_000);
/// ```
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Keep-alive interval for each session.
    pub(crate) ping_interval_ms: u64,
    /// Silence after which a peer record is evicted.
    pub(crate) peer_timeout_ms: u64,
    /// Silence on an online connection after which it is torn down.
    pub(crate) connection_timeout_ms: u64,
    /// Time a connection may stay in the connecting state.
    pub(crate) connect_timeout_ms: u64,
    /// How long a removed peer's slot id stays reserved.
    pub(crate) slot_tombstone_ms: u64,
    /// Maximum number of simultaneous sessions.
    pub(crate) max_groups: usize,
}

/// Keep-alive interval (20 seconds).
pub const GROUP_PING_INTERVAL_MS: u64 = 20_000;

/// Peer silence timeout: three missed pings plus slack (70 seconds).
pub const GROUP_TIMEOUT_MS: u64 = GROUP_PING_INTERVAL_MS * 3 + 10_000;

/// Time allowed for a mesh connection to come online (30 seconds).
pub const GROUP_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Default maximum number of sessions.
pub const DEFAULT_MAX_GROUPS: usize = 1024;

impl Default for GroupConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self {
            ping_interval_ms: GROUP_PING_INTERVAL_MS,
            peer_timeout_ms: GROUP_TIMEOUT_MS,
            connection_timeout_ms: GROUP_TIMEOUT_MS,
            connect_timeout_ms: GROUP_CONNECT_TIMEOUT_MS,
            slot_tombstone_ms: GROUP_TIMEOUT_MS,
            max_groups: DEFAULT_MAX_GROUPS,
        }
    }

    /// Set the keep-alive interval (default: 20s).
    pub fn ping_interval_ms(mut self, ms: u64) -> Self {
        self.ping_interval_ms = ms;
        self
    }

    /// Set the peer eviction timeout (default: 70s).
    pub fn peer_timeout_ms(mut self, ms: u64) -> Self {
        self.peer_timeout_ms = ms;
        self
    }

    /// Set the idle timeout for online mesh connections (default: 70s).
    pub fn connection_timeout_ms(mut self, ms: u64) -> Self {
        self.connection_timeout_ms = ms;
        self
    }

    /// Set the timeout for connections stuck in the connecting state (default: 30s).
    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Set how long removed slot ids stay reserved (default: 70s).
    pub fn slot_tombstone_ms(mut self, ms: u64) -> Self {
        self.slot_tombstone_ms = ms;
        self
    }

    /// Set the maximum number of sessions (default: 1024).
    pub fn max_groups(mut self, max: usize) -> Self {
        self.max_groups = max;
        self
    }

    pub fn ping_interval(&self) -> u64 {
        self.ping_interval_ms
    }

    pub fn peer_timeout(&self) -> u64 {
        self.peer_timeout_ms
    }

    pub fn max_group_count(&self) -> usize {
        self.max_groups
    }
}
