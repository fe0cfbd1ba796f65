//! Database layer for the Chorus voice bridge.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! and embedded SQL migrations. The conversation event log is the only
//! durable state the bridge owns; everything else lives for one session.
//!
//! - **SQLite with WAL mode**: readers (export, event queries) never block
//!   the single recorder writer of a live session.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!` so the schema ships with the server.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
