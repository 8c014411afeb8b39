//! pricewatch binary: prepares the price-history store.
//!
//! Loads `.env` and configuration, initializes structured logging, provisions
//! the database pool, creates any missing tables and confirms the store
//! answers. Any failure aborts startup.

mod config;

use pricewatch_db::{ensure_schema, resolve_connection_string, Database, PRICE_HISTORY};
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("PRICEWATCH_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

fn main() {
    let dotenv_loaded = dotenvy::dotenv().is_ok();

    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration: pricewatch cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        dotenv = dotenv_loaded,
        "resolved startup configuration path"
    );

    let connection_string = resolve_connection_string(config.database.postgres_url.as_deref());
    let db = Database::provision_resolved(connection_string)
        .expect("failed to provision database, check POSTGRES_URL");

    let created = ensure_schema(&db, &PRICE_HISTORY)
        .expect("failed to create database schema, check store permissions");
    if created > 0 {
        tracing::info!(count = created, "created database tables");
    }

    db.with_session(|session| session.ping())
        .expect("database did not answer a liveness check");

    tracing::info!(
        backend = %db.backend(),
        max_connections = db.max_size(),
        "price history store ready"
    );
}
