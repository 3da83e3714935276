use fs2::FileExt;
use log::info;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::constants::EXPECTED_DB_VERSION;
use crate::error::{Result, SyncError};
use crate::queries::{ddl, metadata};

/// File name of the client-side database inside the data directory
pub const CLIENT_DB_FILE: &str = "client.sqlite";

/// File name of the server-side database inside the data directory
pub const SERVER_DB_FILE: &str = "server.sqlite";

/// Open a file-based database pool for production use
/// Enables WAL mode and foreign keys, creating the file if needed
pub async fn open_database(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    info!("SQLite database: {}", db_path.display());
    Ok(pool)
}

/// Open a database and make sure its schema is present and current
pub async fn open_and_init(db_path: &Path) -> Result<SqlitePool> {
    let pool = open_database(db_path).await?;
    init_database_schema(&pool).await?;
    Ok(pool)
}

/// Create tables and indexes, then stamp or verify the schema version
pub async fn init_database_schema(pool: &SqlitePool) -> Result<()> {
    for sql in ddl::all_statements() {
        sqlx::query(&sql).execute(pool).await?;
    }

    sqlx::query(&metadata::insert_or_ignore("version", EXPECTED_DB_VERSION))
        .execute(pool)
        .await?;

    let version: Option<String> = sqlx::query_scalar(&metadata::select_by_key("version"))
        .fetch_optional(pool)
        .await?;
    match version.as_deref() {
        Some(EXPECTED_DB_VERSION) => Ok(()),
        Some(other) => Err(SyncError::StorageAccess(format!(
            "database has unsupported schema version '{}' (expected '{}')",
            other, EXPECTED_DB_VERSION
        ))),
        None => Err(SyncError::StorageAccess(
            "database is missing its schema version".to_string(),
        )),
    }
}

/// Take an exclusive advisory lock on `<data_dir>/.lock`
///
/// Recovery and capture for a data directory must not run in two processes at
/// once. The lock is released when the returned file is dropped.
pub fn lock_data_dir(data_dir: &Path) -> Result<File> {
    std::fs::create_dir_all(data_dir)?;
    let lock_path = data_dir.join(".lock");
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    file.try_lock_exclusive().map_err(|e| {
        SyncError::StorageAccess(format!(
            "data directory {} is in use by another process: {}",
            data_dir.display(),
            e
        ))
    })?;
    Ok(file)
}

/// Create a schema-initialized database in a temporary directory for testing
/// Keep the returned guard alive for as long as the pool is used
pub async fn create_test_connection_in_temporary_file() -> Result<(SqlitePool, tempfile::TempDir)> {
    let dir = tempfile::tempdir()?;
    let pool = open_and_init(&dir.path().join("test.sqlite")).await?;
    Ok((pool, dir))
}
