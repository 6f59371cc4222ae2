use crate::prelude::*;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

pub const CATALOG_TABLE: &str = "catalog_entries";

pub const CURRENT_CATALOG_VERSION: i32 = 2;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_CONNECTIONS: u32 = 8;

async fn create_catalog_table(pool: &SqlitePool) -> Result<()> {
    let query = format!(
        "CREATE TABLE IF NOT EXISTS {CATALOG_TABLE} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project TEXT NOT NULL,
            path TEXT NOT NULL,

            -- As last observed at the source.
            size INTEGER NOT NULL,
            fingerprint TEXT NOT NULL,
            source_modified_micros INTEGER NOT NULL,

            status TEXT NOT NULL,
            error_message TEXT,
            created_at_micros INTEGER NOT NULL,
            updated_at_micros INTEGER NOT NULL,

            UNIQUE (project, path)
        )"
    );
    sqlx::query(&query).execute(pool).await?;

    let query = format!(
        "CREATE INDEX IF NOT EXISTS {CATALOG_TABLE}_project_status
            ON {CATALOG_TABLE} (project, status)"
    );
    sqlx::query(&query).execute(pool).await?;
    Ok(())
}

async fn upgrade_catalog_table(pool: &SqlitePool, existing_version: i32) -> Result<()> {
    if existing_version < 1 {
        create_catalog_table(pool).await?;
    }
    if existing_version < 2 {
        // Set when the source object changed after an earlier copy; such entries overwrite
        // the destination instead of being skipped as already present.
        let query = format!(
            "ALTER TABLE {CATALOG_TABLE} ADD COLUMN source_changed INTEGER NOT NULL DEFAULT 0"
        );
        sqlx::query(&query).execute(pool).await?;
    }
    Ok(())
}

/// Brings the catalog schema of `pool` up to [`CURRENT_CATALOG_VERSION`].
pub async fn setup_catalog(pool: &SqlitePool) -> Result<()> {
    let existing_version: i32 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await
        .context("Failed to read catalog schema version")?;
    if existing_version > CURRENT_CATALOG_VERSION {
        bail!(
            "catalog schema version {existing_version} is newer than the supported version {CURRENT_CATALOG_VERSION}"
        );
    }
    if existing_version < CURRENT_CATALOG_VERSION {
        upgrade_catalog_table(pool, existing_version)
            .await
            .with_context(|| format!("Failed to upgrade catalog from version {existing_version}"))?;
        sqlx::query(&format!("PRAGMA user_version = {CURRENT_CATALOG_VERSION}"))
            .execute(pool)
            .await?;
        info!("catalog schema upgraded from version {existing_version} to {CURRENT_CATALOG_VERSION}");
    }
    Ok(())
}

/// Opens (creating if needed) the SQLite catalog at `path` and sets up its schema.
pub async fn open_catalog_pool(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create catalog directory `{}`", parent.display()))?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);
    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open catalog `{}`", path.display()))?;
    setup_catalog(&pool).await?;
    Ok(pool)
}
