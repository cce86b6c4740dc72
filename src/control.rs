//! Live flag lookup.
//!
//! The preview UI owns a `capture` table with one row per camera and a `live`
//! column. This daemon only ever reads it. Any failure to read the flag is
//! treated as "not live" so a broken control store cannot start a stream.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

const LIVE_QUERY: &str = "SELECT live FROM capture WHERE id = ?1";

/// Source of the "streaming enabled" flag.
pub trait ControlOracle {
    /// Current value of the flag. Must fail closed.
    fn is_enabled(&mut self) -> bool;
}

/// Control store backed by the UI's SQLite database.
pub struct SqliteControlStore {
    conn: Connection,
    camera_id: i64,
}

impl SqliteControlStore {
    pub fn open(db_path: &str, camera_id: i64) -> Result<Self> {
        let conn = open_db_connection(db_path)
            .with_context(|| format!("failed to open control store {}", db_path))?;
        Ok(Self::from_connection(conn, camera_id))
    }

    pub fn from_connection(conn: Connection, camera_id: i64) -> Self {
        Self { conn, camera_id }
    }

    fn query_live(&self) -> Result<bool> {
        let mut stmt = self.conn.prepare_cached(LIVE_QUERY)?;
        let live: Option<i64> = stmt
            .query_row(params![self.camera_id], |row| row.get(0))
            .optional()?;
        Ok(live.unwrap_or(0) != 0)
    }
}

impl ControlOracle for SqliteControlStore {
    fn is_enabled(&mut self) -> bool {
        match self.query_live() {
            Ok(live) => live,
            Err(e) => {
                log::warn!(
                    "control store query failed for camera {}: {}",
                    self.camera_id,
                    e
                );
                false
            }
        }
    }
}

fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}
