//! Sqlite-backed repositories.
//!
//! Each database is held behind a single-writer `Arc<Mutex<Connection>>`;
//! concurrent reads go through the same lock, which is cheap at pipeline
//! call rates and makes write serialization trivial.

pub mod ingestion;
pub mod prices;
pub mod tokens;

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::error::Result;

pub use ingestion::{IngestionStore, LoadFilter, StoredRecord};
pub use prices::PriceStore;
pub use tokens::TokenStore;

pub type Db = Arc<Mutex<Connection>>;

/// Open a connection with the shared pragmas. Callers migrate before
/// wrapping the connection in its mutex.
pub(crate) fn open_conn(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

pub(crate) fn open_conn_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}
