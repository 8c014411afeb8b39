//! Scoped units of work over a pooled connection.
//!
//! A [`Session`] is one exclusive checkout from the pool. It goes back to the
//! pool when dropped, so every exit path (normal return, `?`, panic unwind)
//! releases it exactly once. [`crate::Database::with_session`] wraps the
//! acquire/use/release sequence in a single call.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use postgres_native_tls::MakeTlsConnector;
use r2d2::PooledConnection;
use r2d2_postgres::PostgresConnectionManager;
use r2d2_sqlite::SqliteConnectionManager;
use thiserror::Error;

pub(crate) type PostgresManager = PostgresConnectionManager<MakeTlsConnector>;

/// Which store a session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Local file-backed SQLite.
    Sqlite,
    /// Networked PostgreSQL.
    Postgres,
}

impl Backend {
    /// Returns the lowercase backend name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while acquiring or using a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No pooled connection became available before the checkout timeout.
    #[error("failed to check out a pooled connection: {0}")]
    Checkout(#[from] r2d2::Error),

    /// A SQLite statement failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A PostgreSQL statement failed.
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),
}

/// Counters shared by a [`crate::Database`] and every session it hands out.
#[derive(Debug, Default)]
pub struct SessionStats {
    acquired: AtomicU64,
    released: AtomicU64,
}

impl SessionStats {
    /// Sessions handed out so far.
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Sessions returned to the pool so far.
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    /// Sessions currently checked out.
    pub fn outstanding(&self) -> u64 {
        self.acquired().saturating_sub(self.released())
    }

    fn record_acquire(&self) -> u64 {
        self.acquired.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record_release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) enum Checkout {
    Sqlite(PooledConnection<SqliteConnectionManager>),
    Postgres(PooledConnection<PostgresManager>),
}

/// An exclusively owned checkout from the connection pool.
///
/// No transaction is opened implicitly. Callers that need one issue
/// `BEGIN`/`COMMIT` themselves or use the typed accessors.
pub struct Session {
    conn: Checkout,
    stats: Arc<SessionStats>,
    id: u64,
}

impl Session {
    pub(crate) fn new(conn: Checkout, stats: Arc<SessionStats>) -> Self {
        let id = stats.record_acquire();
        tracing::trace!(session = id, "session acquired");
        Self { conn, stats, id }
    }

    /// The backend this session is bound to.
    pub fn backend(&self) -> Backend {
        match self.conn {
            Checkout::Sqlite(_) => Backend::Sqlite,
            Checkout::Postgres(_) => Backend::Postgres,
        }
    }

    /// Executes one or more semicolon-separated statements without parameters.
    ///
    /// # Errors
    ///
    /// Returns the backend error if any statement fails.
    pub fn execute_batch(&mut self, sql: &str) -> Result<(), SessionError> {
        match &mut self.conn {
            Checkout::Sqlite(conn) => conn.execute_batch(sql)?,
            Checkout::Postgres(client) => client.batch_execute(sql)?,
        }
        Ok(())
    }

    /// Returns whether a table named `name` exists in the current schema.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the catalog query fails.
    pub fn table_exists(&mut self, name: &str) -> Result<bool, SessionError> {
        let exists: bool = match &mut self.conn {
            Checkout::Sqlite(conn) => conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                [name],
                |row| row.get(0),
            )?,
            Checkout::Postgres(client) => client
                .query_one(
                    "SELECT EXISTS(
                        SELECT 1 FROM information_schema.tables
                        WHERE table_schema = current_schema() AND table_name = $1
                    )",
                    &[&name],
                )?
                .get(0),
        };
        Ok(exists)
    }

    /// Round-trips a trivial query to confirm the connection is alive.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the store does not answer.
    pub fn ping(&mut self) -> Result<(), SessionError> {
        match &mut self.conn {
            Checkout::Sqlite(conn) => {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            }
            Checkout::Postgres(client) => {
                client.simple_query("SELECT 1")?;
            }
        }
        Ok(())
    }

    /// The underlying SQLite connection, if this session is bound to SQLite.
    pub fn sqlite(&self) -> Option<&rusqlite::Connection> {
        match &self.conn {
            Checkout::Sqlite(conn) => Some(&**conn),
            Checkout::Postgres(_) => None,
        }
    }

    /// The underlying PostgreSQL client, if this session is bound to PostgreSQL.
    pub fn postgres(&mut self) -> Option<&mut postgres::Client> {
        match &mut self.conn {
            Checkout::Sqlite(_) => None,
            Checkout::Postgres(client) => Some(&mut **client),
        }
    }

    /// Releases the session before the end of its scope.
    pub fn close(self) {
        drop(self);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("backend", &self.backend())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stats.record_release();
        tracing::trace!(session = self.id, "session released");
    }
}
