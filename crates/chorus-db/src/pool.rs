//! The SQLite pool behind the conversation event log.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Pool size and lock-wait settings, from the `[database]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a connection waits on a locked database before failing.
    pub busy_timeout_ms: u64,
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to open event log database: {0}")]
    PoolInit(#[from] r2d2::Error),
}

/// Opens the event log database at `db_path`.
///
/// Each recorder writes on one connection while the event API reads on
/// others, so file databases run in WAL mode. `:memory:` works, but every
/// pooled connection then sees its own empty database.
///
/// # Errors
///
/// Returns `PoolError::PoolInit` if no connection can be opened or
/// configured.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(move |conn| configure(conn, settings.busy_timeout_ms));

    Ok(Pool::builder()
        .max_size(settings.pool_max_size)
        .build(manager)?)
}

fn configure(conn: &mut Connection, busy_timeout_ms: u64) -> rusqlite::Result<()> {
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    if mode != "wal" && mode != "memory" {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("event log needs WAL journaling, got {mode}")),
        ));
    }
    conn.execute_batch(&format!(
        "PRAGMA synchronous = NORMAL; PRAGMA busy_timeout = {busy_timeout_ms};"
    ))
}
