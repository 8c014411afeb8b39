//! Database layer for the pricewatch application.
//!
//! Resolves where the price history lives, builds a pooled connection handle
//! for it, creates the schema if it is missing, and hands out scoped
//! sessions.
//!
//! # Store selection
//!
//! - **Managed PostgreSQL**: used when `POSTGRES_URL` is set. The URL is
//!   normalized (quotes stripped, `postgres://` rewritten to
//!   `postgresql://`, `sslmode=require` added when no query is present).
//! - **Local SQLite**: `sqlite:///data/price_history.db` when `POSTGRES_URL`
//!   is absent. The directory is created at provision, the file on first use.
//!
//! # Usage
//!
//! ```rust,ignore
//! use pricewatch_db::{ensure_schema, Database, PRICE_HISTORY};
//!
//! let db = Database::provision_from_env()?;
//! ensure_schema(&db, &PRICE_HISTORY)?;
//!
//! db.with_session(|session| session.ping())?;
//! ```
//!
//! # Design decisions
//!
//! - **Explicit handle**: [`Database`] is constructed once and passed to its
//!   users. There is no global engine.
//! - **`r2d2` connection pool**: one synchronous pool type per backend, sized
//!   5 connections plus 10 overflow, with each checkout validated first.
//!   Connections open on demand and close after sitting idle.
//! - **Drop-scoped sessions**: a [`Session`] returns its connection to the
//!   pool when dropped, so release happens exactly once on every exit path.

mod config;
mod locator;
mod pool;
mod schema;
mod session;

pub use config::{
    build_connection_configuration, ConnectionConfig, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_OVERFLOW,
    DEFAULT_POOL_SIZE, POSTGRES_CONNECT_TIMEOUT,
};
pub use locator::{
    redact_connection_string, resolve_connection_string, resolve_from_env, Locator,
    SqliteTarget, UnsupportedSchemeError, LOCAL_FALLBACK_LOCATOR, POSTGRES_SCHEME_PREFIX,
    POSTGRES_URL_ENV,
};
pub use pool::{Database, ProvisionError};
pub use schema::{ensure_schema, Schema, SchemaError, TableDef, PRICE_HISTORY};
pub use session::{Backend, Session, SessionError, SessionStats};
