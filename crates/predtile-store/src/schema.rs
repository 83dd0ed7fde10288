// SPDX-License-Identifier: Apache-2.0

use crate::StoreError;
use rusqlite::Connection;

pub const SQLITE_SCHEMA_VERSION: i64 = 1;

pub fn apply_connection_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        PRAGMA busy_timeout=5000;
        PRAGMA temp_store=MEMORY;
        PRAGMA cache_size=-32000;
        ",
    )?;
    Ok(())
}

pub fn create_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS projects (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL,
          source TEXT NOT NULL,
          archived INTEGER NOT NULL DEFAULT 0,
          tags TEXT NOT NULL,
          created INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS imagery (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
          name TEXT NOT NULL,
          fmt TEXT NOT NULL,
          url TEXT NOT NULL,
          chips TEXT
        );
        CREATE TABLE IF NOT EXISTS predictions (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
          created INTEGER NOT NULL,
          hint TEXT NOT NULL,
          version TEXT NOT NULL,
          tile_zoom INTEGER NOT NULL,
          inf_list TEXT NOT NULL,
          inf_type TEXT NOT NULL,
          inf_binary INTEGER NOT NULL,
          inf_supertile INTEGER NOT NULL,
          imagery_id INTEGER
        );
        CREATE TABLE IF NOT EXISTS prediction_tiles (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          prediction_id INTEGER NOT NULL REFERENCES predictions(id) ON DELETE CASCADE,
          quadkey TEXT,
          geom TEXT NOT NULL,
          predictions TEXT NOT NULL,
          validity TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_predictions_project
          ON predictions(project_id);
        CREATE INDEX IF NOT EXISTS idx_tiles_prediction
          ON prediction_tiles(prediction_id);
        CREATE INDEX IF NOT EXISTS idx_tiles_quadkey
          ON prediction_tiles(prediction_id, quadkey);
        CREATE VIRTUAL TABLE IF NOT EXISTS prediction_tiles_rtree USING rtree(
          tile_rowid,
          min_lon, max_lon,
          min_lat, max_lat
        );
        ",
    )?;
    conn.execute_batch(&format!("PRAGMA user_version={SQLITE_SCHEMA_VERSION};"))?;
    Ok(())
}

/// Reads and validates the stored schema version. Returns it so callers
/// can skip the DDL (and its write lock) on an already-initialized
/// database; only a fresh file reports 0.
pub fn schema_version(conn: &Connection) -> Result<i64, StoreError> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version != 0 && version != SQLITE_SCHEMA_VERSION {
        return Err(StoreError::SchemaMismatch(format!(
            "database schema version {version}, expected {SQLITE_SCHEMA_VERSION}"
        )));
    }
    Ok(version)
}
