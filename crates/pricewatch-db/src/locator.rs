//! Connection string resolution.
//!
//! The store is selected by the optional `POSTGRES_URL` environment variable.
//! When it is absent, the application falls back to a local SQLite file.
//! When it is present, it is normalized into a form the PostgreSQL driver
//! accepts: enclosing quotes removed, the legacy `postgres://` scheme
//! rewritten to `postgresql://`, and `sslmode=require` appended when the URL
//! carries no query string.
//!
//! Resolution never fails loudly. A malformed or non-PostgreSQL URL is logged
//! and reported as `None`; [`crate::Database::provision_resolved`] turns that into an
//! error at startup.

use std::fmt;
use std::path::{Path, PathBuf};

use url::Url;

/// Environment variable holding the managed PostgreSQL connection string.
pub const POSTGRES_URL_ENV: &str = "POSTGRES_URL";

/// Locator used when no `POSTGRES_URL` is configured.
pub const LOCAL_FALLBACK_LOCATOR: &str = "sqlite:///data/price_history.db";

/// Scheme prefix of a normalized PostgreSQL connection string.
pub const POSTGRES_SCHEME_PREFIX: &str = "postgresql://";

const LEGACY_POSTGRES_SCHEME_PREFIX: &str = "postgres://";
const SQLITE_SCHEME_PREFIX: &str = "sqlite://";
const REQUIRE_TLS_QUERY: &str = "?sslmode=require";

/// Resolves the connection string from a raw, untrusted value.
///
/// Returns [`LOCAL_FALLBACK_LOCATOR`] when `raw` is `None` or empty, the normalized
/// PostgreSQL URL when `raw` is a valid `postgres`/`postgresql` URL, and
/// `None` otherwise.
pub fn resolve_connection_string(raw: Option<&str>) -> Option<String> {
    let Some(raw) = raw.filter(|value| !value.is_empty()) else {
        tracing::debug!(
            locator = LOCAL_FALLBACK_LOCATOR,
            "{POSTGRES_URL_ENV} not set, using local store"
        );
        return Some(LOCAL_FALLBACK_LOCATOR.to_string());
    };

    let unquoted = raw.trim_matches('"').trim_matches('\'');

    let parsed = match Url::parse(unquoted) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::error!(error = %e, "error parsing database URL");
            return None;
        }
    };

    match parsed.scheme() {
        "postgres" | "postgresql" => {}
        other => {
            tracing::warn!(
                scheme = other,
                "database URL does not use a PostgreSQL scheme, ignoring it"
            );
            return None;
        }
    }

    let mut normalized =
        unquoted.replacen(LEGACY_POSTGRES_SCHEME_PREFIX, POSTGRES_SCHEME_PREFIX, 1);
    if !normalized.contains('?') {
        normalized.push_str(REQUIRE_TLS_QUERY);
    }

    Some(normalized)
}

/// Reads [`POSTGRES_URL_ENV`] and resolves it with
/// [`resolve_connection_string`].
///
/// A value that is present but not valid unicode is treated as malformed.
pub fn resolve_from_env() -> Option<String> {
    match std::env::var(POSTGRES_URL_ENV) {
        Ok(value) => resolve_connection_string(Some(&value)),
        Err(std::env::VarError::NotPresent) => resolve_connection_string(None),
        Err(e @ std::env::VarError::NotUnicode(_)) => {
            tracing::error!(error = %e, "error reading {POSTGRES_URL_ENV}");
            None
        }
    }
}

/// Returns the connection string with any password replaced by `***`.
///
/// Strings that do not parse as URLs are returned as their scheme only, so
/// credentials never reach the logs.
pub fn redact_connection_string(connection_string: &str) -> String {
    match Url::parse(connection_string) {
        Ok(mut url) => {
            if url.password().is_some() {
                // Only fails for cannot-be-a-base URLs, which carry no password.
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => match connection_string.split_once("://") {
            Some((scheme, _)) => format!("{scheme}://<redacted>"),
            None => "<redacted>".to_string(),
        },
    }
}

/// The SQLite target of a `sqlite://` locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteTarget {
    /// A database file, relative to the working directory unless absolute.
    File(PathBuf),
    /// A private in-memory database per connection.
    Memory,
}

/// The store a connection string points at.
#[derive(Clone, PartialEq, Eq)]
pub enum Locator {
    /// A networked PostgreSQL server.
    Postgres(String),
    /// A local file-backed (or in-memory) SQLite store.
    Sqlite(SqliteTarget),
}

/// Error returned when a connection string names no supported store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported connection string scheme: {scheme}")]
pub struct UnsupportedSchemeError {
    /// The scheme that was found, or the whole redacted string if it had none.
    pub scheme: String,
}

impl Locator {
    /// Classifies a resolved connection string.
    ///
    /// `sqlite:///relative/path` and `sqlite:////absolute/path` name files;
    /// `sqlite://` and `sqlite:///:memory:` name an in-memory store.
    ///
    /// # Errors
    ///
    /// Returns [`UnsupportedSchemeError`] for any other scheme.
    pub fn parse(connection_string: &str) -> Result<Self, UnsupportedSchemeError> {
        if connection_string.starts_with(POSTGRES_SCHEME_PREFIX)
            || connection_string.starts_with(LEGACY_POSTGRES_SCHEME_PREFIX)
        {
            return Ok(Self::Postgres(connection_string.to_string()));
        }

        if let Some(rest) = connection_string.strip_prefix(SQLITE_SCHEME_PREFIX) {
            let path = rest.strip_prefix('/').unwrap_or(rest);
            if path.is_empty() || path == ":memory:" {
                return Ok(Self::Sqlite(SqliteTarget::Memory));
            }
            return Ok(Self::Sqlite(SqliteTarget::File(Path::new(path).to_path_buf())));
        }

        let scheme = match connection_string.split_once("://") {
            Some((scheme, _)) => scheme.to_string(),
            None => redact_connection_string(connection_string),
        };
        Err(UnsupportedSchemeError { scheme })
    }
}

impl fmt::Debug for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postgres(url) => f
                .debug_tuple("Postgres")
                .field(&redact_connection_string(url))
                .finish(),
            Self::Sqlite(target) => f.debug_tuple("Sqlite").field(target).finish(),
        }
    }
}
