//! Schema declaration and create-if-missing.
//!
//! Table DDL lives in SQL files embedded at compile time, one file per table
//! and backend. [`ensure_schema`] creates whichever declared tables are
//! missing and leaves existing ones untouched, so it is safe to run on every
//! startup.

use thiserror::Error;

use crate::pool::Database;
use crate::session::{Backend, Session, SessionError};

/// A single declared table with its DDL for each backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDef {
    /// Table name as it appears in the catalog.
    pub name: &'static str,
    /// `CREATE ... IF NOT EXISTS` statements for SQLite.
    pub sqlite: &'static str,
    /// `CREATE ... IF NOT EXISTS` statements for PostgreSQL.
    pub postgres: &'static str,
}

impl TableDef {
    /// The DDL for `backend`.
    pub fn ddl(&self, backend: Backend) -> &'static str {
        match backend {
            Backend::Sqlite => self.sqlite,
            Backend::Postgres => self.postgres,
        }
    }
}

/// An ordered set of tables the store must contain.
///
/// Tables are created in declaration order, so referenced tables come first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schema {
    tables: &'static [TableDef],
}

impl Schema {
    /// Declares a schema from an ordered table list.
    pub const fn new(tables: &'static [TableDef]) -> Self {
        Self { tables }
    }

    /// The declared tables in creation order.
    pub fn tables(&self) -> &'static [TableDef] {
        self.tables
    }
}

/// The price-history application schema.
pub const PRICE_HISTORY: Schema = Schema::new(&[
    TableDef {
        name: "products",
        sqlite: include_str!("schema/sqlite/products.sql"),
        postgres: include_str!("schema/postgres/products.sql"),
    },
    TableDef {
        name: "price_records",
        sqlite: include_str!("schema/sqlite/price_records.sql"),
        postgres: include_str!("schema/postgres/price_records.sql"),
    },
]);

/// Errors that can occur while ensuring the schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Creating a table failed.
    #[error("failed to create table '{table}': {source}")]
    CreateFailed {
        /// The table whose DDL failed.
        table: String,
        /// The underlying store error.
        source: SessionError,
    },

    /// Failed to check whether a table exists.
    #[error("failed to inspect table '{table}': {source}")]
    StateQuery {
        /// The table being inspected.
        table: String,
        /// The underlying store error.
        source: SessionError,
    },

    /// No session could be acquired.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Creates every table in `schema` that does not yet exist.
///
/// Returns the number of tables created; a store that already has every
/// table yields `0`.
///
/// # Errors
///
/// Returns `SchemaError` if a session cannot be acquired or any DDL fails.
/// Startup is expected to abort on these.
pub fn ensure_schema(db: &Database, schema: &Schema) -> Result<usize, SchemaError> {
    db.with_session(|session| ensure_schema_in(session, schema))
}

fn ensure_schema_in(session: &mut Session, schema: &Schema) -> Result<usize, SchemaError> {
    let backend = session.backend();
    let mut created = 0;

    for table in schema.tables() {
        let exists = session
            .table_exists(table.name)
            .map_err(|source| SchemaError::StateQuery {
                table: table.name.to_string(),
                source,
            })?;

        if exists {
            tracing::debug!(table = table.name, "table already exists, skipping");
            continue;
        }

        tracing::info!(table = table.name, %backend, "creating table");

        session
            .execute_batch(table.ddl(backend))
            .map_err(|source| SchemaError::CreateFailed {
                table: table.name.to_string(),
                source,
            })?;

        created += 1;
    }

    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::build_connection_configuration;

    fn memory_db() -> Database {
        let mut config = build_connection_configuration("sqlite:///:memory:");
        config.pool_size = 1;
        config.max_overflow = 0;
        Database::provision(config).expect("pool creation should succeed")
    }

    #[test]
    fn creates_price_history_tables() {
        let db = memory_db();
        let created = ensure_schema(&db, &PRICE_HISTORY).expect("schema should be created");
        assert_eq!(created, 2);

        db.with_session(|session| -> Result<(), SessionError> {
            assert!(session.table_exists("products")?);
            assert!(session.table_exists("price_records")?);
            Ok(())
        })
        .expect("session should succeed");
    }

    #[test]
    fn ensure_schema_idempotent() {
        let db = memory_db();

        let first = ensure_schema(&db, &PRICE_HISTORY).expect("first run should succeed");
        assert_eq!(first, 2);

        let second = ensure_schema(&db, &PRICE_HISTORY).expect("second run should succeed");
        assert_eq!(second, 0, "no new tables to create");
    }

    #[test]
    fn failing_ddl_names_the_table() {
        const BROKEN: Schema = Schema::new(&[TableDef {
            name: "broken",
            sqlite: "CREATE TABLE broken (",
            postgres: "CREATE TABLE broken (",
        }]);

        let db = memory_db();
        let err = ensure_schema(&db, &BROKEN).expect_err("invalid DDL should fail");

        match err {
            SchemaError::CreateFailed { table, .. } => assert_eq!(table, "broken"),
            other => panic!("unexpected error type: {other:?}"),
        }
        assert_eq!(db.session_stats().outstanding(), 0);
    }

    #[test]
    fn price_records_reference_products() {
        let db = memory_db();
        ensure_schema(&db, &PRICE_HISTORY).expect("schema should be created");

        let session = db.acquire_session().expect("should get a session");
        let conn = session.sqlite().expect("session should be sqlite");

        let orphan = conn.execute(
            "INSERT INTO price_records (product_id, price) VALUES (?1, ?2)",
            rusqlite::params![999, 19.99],
        );
        assert!(orphan.is_err(), "foreign key should reject orphan price records");

        conn.execute(
            "INSERT INTO products (name, url) VALUES ('Kettle', 'https://shop.example.com/kettle')",
            [],
        )
        .expect("should insert product");
        let product_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO price_records (product_id, price) VALUES (?1, ?2)",
            rusqlite::params![product_id, 24.5],
        )
        .expect("should insert price record");
    }
}
