//! Resolves a `senpuki` connection string into a live [`StorageBackend`].
//!
//! Connection strings are dispatched on scheme prefix only — the full string
//! is handed to the chosen driver's own pool builder, which does the real
//! parsing. No `url` crate: this is exactly as much parsing as the CLI needs.

use senpuki::StorageBackend;
use std::env;
use std::sync::Arc;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://senpuki.db";
const ENV_VAR: &str = "SENPUKI_DATABASE_URL";

pub fn resolve_database_url(cli_override: Option<String>) -> String {
    cli_override
        .or_else(|| env::var(ENV_VAR).ok())
        .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string())
}

/// Connects to `database_url` and runs `init_db` so the CLI works against a
/// freshly created database with no separate migration step.
pub async fn connect(database_url: &str) -> anyhow::Result<Arc<dyn StorageBackend>> {
    if database_url.starts_with("sqlite://") || database_url.starts_with("sqlite::memory:") {
        let backend = senpuki_sqlite::SqliteBackend::connect(database_url).await?;
        backend.init_db().await?;
        Ok(Arc::new(backend))
    } else if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        let backend = senpuki_postgres::PostgresBackend::connect(database_url).await?;
        backend.init_db().await?;
        Ok(Arc::new(backend))
    } else {
        anyhow::bail!(
            "unrecognized {ENV_VAR} scheme (expected sqlite:// or postgres(ql)://): {database_url}"
        )
    }
}
