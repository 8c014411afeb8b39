//! Connection pool creation and configuration.

use std::str::FromStr;
use std::sync::Arc;

use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use r2d2::{Builder, ManageConnection, Pool, State};
use r2d2_postgres::PostgresConnectionManager;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;
use thiserror::Error;

use crate::config::{build_connection_configuration, ConnectionConfig};
use crate::locator::{
    redact_connection_string, resolve_from_env, Locator, SqliteTarget, UnsupportedSchemeError,
};
use crate::session::{Backend, Checkout, PostgresManager, Session, SessionError, SessionStats};

/// How long a SQLite connection waits on a locked database, in milliseconds.
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Errors that can occur when provisioning the database handle.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Connection string resolution produced nothing usable.
    #[error("no usable connection string: POSTGRES_URL is malformed or not a PostgreSQL URL")]
    UnusableConnectionString,

    /// The connection string names a store this crate cannot open.
    #[error(transparent)]
    UnsupportedScheme(#[from] UnsupportedSchemeError),

    /// The PostgreSQL connection string was rejected by the driver.
    #[error("invalid PostgreSQL connection string: {0}")]
    PostgresConfig(#[from] postgres::Error),

    /// The TLS connector could not be initialized.
    #[error("failed to initialize TLS: {0}")]
    Tls(#[from] native_tls::Error),

    /// The directory for the local database file could not be created.
    #[error("failed to create database directory: {0}")]
    LocalPath(#[from] std::io::Error),

    /// Failed to build the connection pool.
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),
}

#[derive(Clone)]
enum StorePool {
    Sqlite(Pool<SqliteConnectionManager>),
    Postgres(Pool<PostgresManager>),
}

/// The process-wide pooled connection handle.
///
/// Built once at startup and passed explicitly to whatever needs the store.
/// Clones share the same pool and the same [`SessionStats`].
#[derive(Clone)]
pub struct Database {
    pool: StorePool,
    config: Arc<ConnectionConfig>,
    stats: Arc<SessionStats>,
}

impl Database {
    /// Builds the pooled handle described by `config`.
    ///
    /// Connections are opened on demand, up to `pool_size + max_overflow`,
    /// and closed once idle for `idle_timeout`. With `pre_ping` set, each
    /// connection is validated before it is handed out.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] if the connection string cannot be used or
    /// the pool cannot be built.
    pub fn provision(config: ConnectionConfig) -> Result<Self, ProvisionError> {
        let locator = Locator::parse(&config.connection_string)?;

        tracing::info!(
            store = %redact_connection_string(&config.connection_string),
            pool_size = config.pool_size,
            max_overflow = config.max_overflow,
            pre_ping = config.pre_ping,
            connect_timeout_secs = config.connect_timeout.map(|t| t.as_secs()),
            "provisioning database pool"
        );

        let pool = match locator {
            Locator::Sqlite(target) => StorePool::Sqlite(sqlite_pool(&target, &config)?),
            Locator::Postgres(url) => StorePool::Postgres(postgres_pool(&url, &config)?),
        };

        Ok(Self {
            pool,
            config: Arc::new(config),
            stats: Arc::new(SessionStats::default()),
        })
    }

    /// Provisions from an already resolved connection string.
    ///
    /// `None` is what resolution returns for a malformed or non-PostgreSQL
    /// `POSTGRES_URL`; it is rejected here rather than handed to the driver.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::UnusableConnectionString`] for `None`, and
    /// otherwise whatever [`Database::provision`] returns.
    pub fn provision_resolved(connection_string: Option<String>) -> Result<Self, ProvisionError> {
        let connection_string = connection_string.ok_or_else(|| {
            tracing::error!("database URL could not be resolved, refusing to provision");
            ProvisionError::UnusableConnectionString
        })?;
        Self::provision(build_connection_configuration(connection_string))
    }

    /// Resolves `POSTGRES_URL`, builds the configuration and the pool.
    ///
    /// # Errors
    ///
    /// See [`Database::provision_resolved`].
    pub fn provision_from_env() -> Result<Self, ProvisionError> {
        Self::provision_resolved(resolve_from_env())
    }

    /// Checks a connection out of the pool as a new [`Session`].
    ///
    /// Blocks while the pool is exhausted, up to the checkout timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Checkout`] if no connection becomes available.
    pub fn acquire_session(&self) -> Result<Session, SessionError> {
        let conn = match &self.pool {
            StorePool::Sqlite(pool) => Checkout::Sqlite(pool.get()?),
            StorePool::Postgres(pool) => Checkout::Postgres(pool.get()?),
        };
        Ok(Session::new(conn, Arc::clone(&self.stats)))
    }

    /// Runs `f` with a freshly acquired session and releases it afterwards.
    ///
    /// The session is released whether `f` returns `Ok`, returns `Err`, or
    /// panics. No transaction is opened on the caller's behalf.
    ///
    /// # Errors
    ///
    /// Returns the checkout error converted into `E`, or whatever `f` returns.
    pub fn with_session<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Session) -> Result<T, E>,
        E: From<SessionError>,
    {
        let mut session = self.acquire_session()?;
        f(&mut session)
    }

    /// The backend this handle is connected to.
    pub fn backend(&self) -> Backend {
        match self.pool {
            StorePool::Sqlite(_) => Backend::Sqlite,
            StorePool::Postgres(_) => Backend::Postgres,
        }
    }

    /// The configuration the pool was built from.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Acquire/release counters for sessions handed out by this handle.
    pub fn session_stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Maximum number of simultaneously open connections.
    pub fn max_size(&self) -> u32 {
        match &self.pool {
            StorePool::Sqlite(pool) => pool.max_size(),
            StorePool::Postgres(pool) => pool.max_size(),
        }
    }

    /// Number of connections the pool keeps open while idle.
    pub fn min_idle(&self) -> Option<u32> {
        match &self.pool {
            StorePool::Sqlite(pool) => pool.min_idle(),
            StorePool::Postgres(pool) => pool.min_idle(),
        }
    }

    /// Open and idle connection counts.
    pub fn pool_state(&self) -> State {
        match &self.pool {
            StorePool::Sqlite(pool) => pool.state(),
            StorePool::Postgres(pool) => pool.state(),
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("backend", &self.backend())
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}

fn pool_builder<M: ManageConnection>(config: &ConnectionConfig) -> Builder<M> {
    let mut builder = Pool::builder()
        .max_size(config.max_connections())
        .min_idle(Some(0))
        .idle_timeout(Some(config.idle_timeout))
        .test_on_check_out(config.pre_ping);
    if let Some(timeout) = config.checkout_timeout {
        builder = builder.connection_timeout(timeout);
    }
    builder
}

fn sqlite_pool(
    target: &SqliteTarget,
    config: &ConnectionConfig,
) -> Result<Pool<SqliteConnectionManager>, ProvisionError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    let manager = match target {
        SqliteTarget::File(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                if !parent.exists() {
                    tracing::info!(path = %parent.display(), "creating database directory");
                    std::fs::create_dir_all(parent)?;
                }
            }
            SqliteConnectionManager::file(path)
        }
        SqliteTarget::Memory => SqliteConnectionManager::memory(),
    };

    let manager = manager.with_flags(flags).with_init(|conn| {
        // In-memory databases report "memory" which is expected and acceptable.
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
        if journal_mode != "wal" && journal_mode != "memory" {
            return Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                Some(format!(
                    "failed to set WAL journal mode, got: {}",
                    journal_mode
                )),
            ));
        }
        conn.execute_batch(&format!(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};",
            SQLITE_BUSY_TIMEOUT_MS
        ))
    });

    Ok(pool_builder(config).build(manager)?)
}

fn postgres_config(
    url: &str,
    config: &ConnectionConfig,
) -> Result<postgres::Config, ProvisionError> {
    let mut pg_config = postgres::Config::from_str(url)?;
    if let Some(timeout) = config.connect_timeout {
        pg_config.connect_timeout(timeout);
    }
    Ok(pg_config)
}

fn postgres_pool(
    url: &str,
    config: &ConnectionConfig,
) -> Result<Pool<PostgresManager>, ProvisionError> {
    let pg_config = postgres_config(url, config)?;

    // sslmode=require encrypts without verifying the server certificate, as libpq does.
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()?;
    let manager = PostgresConnectionManager::new(pg_config, MakeTlsConnector::new(connector));

    Ok(pool_builder(config).build(manager)?)
}
