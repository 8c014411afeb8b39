//! Connection configuration derived from a resolved connection string.

use std::fmt;
use std::time::Duration;

use crate::locator::{redact_connection_string, POSTGRES_SCHEME_PREFIX};

/// Connections the pool is sized for under normal load.
pub const DEFAULT_POOL_SIZE: u32 = 5;

/// Extra connections the pool may open beyond [`DEFAULT_POOL_SIZE`] under load.
pub const DEFAULT_MAX_OVERFLOW: u32 = 10;

/// Idle time after which a pooled connection is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Time allowed to establish a physical PostgreSQL connection.
pub const POSTGRES_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolved connection string plus pool parameters.
///
/// Built once at startup by [`build_connection_configuration`] and handed to
/// [`crate::Database::provision`].
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// The normalized connection string.
    pub connection_string: String,

    /// Number of connections the pool is sized for. Connections are opened
    /// on demand; none are kept open ahead of use.
    pub pool_size: u32,

    /// Additional connections allowed while the pool is saturated.
    pub max_overflow: u32,

    /// Validate each connection before handing it out.
    pub pre_ping: bool,

    /// Timeout for establishing a physical connection. Only set for
    /// PostgreSQL; SQLite has no such concept.
    pub connect_timeout: Option<Duration>,

    /// Idle time after which a connection is closed, so overflow
    /// connections do not outlive the load that opened them.
    pub idle_timeout: Duration,

    /// How long a caller waits for a free pooled connection. `None` keeps the
    /// pool library default.
    pub checkout_timeout: Option<Duration>,
}

impl ConnectionConfig {
    /// Upper bound on simultaneously open connections.
    pub fn max_connections(&self) -> u32 {
        self.pool_size + self.max_overflow
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field(
                "connection_string",
                &redact_connection_string(&self.connection_string),
            )
            .field("pool_size", &self.pool_size)
            .field("max_overflow", &self.max_overflow)
            .field("pre_ping", &self.pre_ping)
            .field("connect_timeout", &self.connect_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("checkout_timeout", &self.checkout_timeout)
            .finish()
    }
}

/// Builds the connection configuration for a resolved connection string.
///
/// Pool sizing is fixed: 5 pooled connections, 10 overflow, pre-ping on. A
/// 30 second connect timeout is attached when the string targets PostgreSQL.
pub fn build_connection_configuration(connection_string: impl Into<String>) -> ConnectionConfig {
    let connection_string = connection_string.into();
    let connect_timeout = connection_string
        .starts_with(POSTGRES_SCHEME_PREFIX)
        .then_some(POSTGRES_CONNECT_TIMEOUT);

    ConnectionConfig {
        connection_string,
        pool_size: DEFAULT_POOL_SIZE,
        max_overflow: DEFAULT_MAX_OVERFLOW,
        pre_ping: true,
        connect_timeout,
        idle_timeout: DEFAULT_IDLE_TIMEOUT,
        checkout_timeout: None,
    }
}
