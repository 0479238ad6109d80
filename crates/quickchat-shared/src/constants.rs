/// Application name
pub const APP_NAME: &str = "QuickChat";

/// Push event carrying one persisted message
pub const EVENT_NEW_MESSAGE: &str = "newMessage";

/// Push event carrying the full online-user set
pub const EVENT_ONLINE_USERS: &str = "getOnlineUsers";

/// Default HTTP port (server)
pub const DEFAULT_HTTP_PORT: u16 = 5000;

/// Maximum REST request body in bytes (4 MiB, enough for an inline image reference)
pub const MAX_BODY_SIZE: usize = 4 * 1024 * 1024;

/// Outbound queue depth per connection
pub const CONNECTION_QUEUE_DEPTH: usize = 256;

/// Time allowed for a client to complete the connection handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

/// Write timeout for a single push to a connection
pub const DEFAULT_PUSH_TIMEOUT_MS: u64 = 2_000;
