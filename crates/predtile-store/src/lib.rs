// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

mod aggregate;
mod schema;

pub use schema::SQLITE_SCHEMA_VERSION;

use geo::BoundingRect;
use predtile_model::{
    parse_chip_list_csv, polygon_from_geojson, polygon_to_geojson, Chip, Hint, ImageryDraft,
    ImageryFormat, ImagerySpec, ModelError, Prediction, PredictionDraft, PredictionTile, Project,
    ProjectDraft, TileInput, ValidityPatch,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

pub const CRATE_NAME: &str = "predtile-store";

/// Rows fetched per cursor step. Keeps export memory bounded regardless of
/// how many tiles a prediction owns.
pub const CURSOR_BATCH: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    /// Tile rows that do not conform to the owning prediction's inference
    /// schema, or an on-disk database from a different schema version.
    SchemaMismatch(String),
    NotFound(String),
    EmptyResult(&'static str),
    InvalidRequest(String),
    Decode(String),
    Sql(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SchemaMismatch(msg) => write!(f, "schema mismatch: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::EmptyResult(what) => write!(f, "no rows: {what}"),
            Self::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            Self::Decode(msg) => write!(f, "corrupt row: {msg}"),
            Self::Sql(msg) => write!(f, "sqlite error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sql(e.to_string())
    }
}

impl From<ModelError> for StoreError {
    fn from(e: ModelError) -> Self {
        Self::InvalidRequest(e.to_string())
    }
}

/// One SQLite connection plus the schema contract. Writers take `&mut self`
/// so a batch transaction cannot interleave with another write on the same
/// handle; readers may open further `Store`s against the same path (WAL).
#[derive(Debug)]
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        schema::apply_connection_pragmas(&conn)?;
        // Only a fresh database runs the DDL; opening an initialized one
        // must not take the write lock.
        if schema::schema_version(&conn)? == 0 {
            schema::create_schema(&conn)?;
        }
        Ok(Self { conn })
    }

    pub fn create_project(&self, draft: &ProjectDraft) -> Result<Project, StoreError> {
        draft.validate()?;
        let created = unix_now();
        let tags = serde_json::to_string(&draft.tags)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        self.conn.execute(
            "INSERT INTO projects (name, source, archived, tags, created)
             VALUES (?1, ?2, 0, ?3, ?4)",
            params![draft.name, draft.source, tags, created],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(project_id = id, name = %draft.name, "created project");
        Ok(Project {
            id,
            name: draft.name.clone(),
            source: draft.source.clone(),
            archived: false,
            tags: draft.tags.clone(),
            created,
        })
    }

    pub fn get_project(&self, id: i64) -> Result<Project, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, source, archived, tags, created FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;
        let (id, name, source, archived, tags, created) =
            row.ok_or_else(|| StoreError::NotFound(format!("project {id}")))?;
        let tags: Vec<String> =
            serde_json::from_str(&tags).map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(Project {
            id,
            name,
            source,
            archived,
            tags,
            created,
        })
    }

    pub fn create_imagery(
        &self,
        project_id: i64,
        draft: &ImageryDraft,
    ) -> Result<ImagerySpec, StoreError> {
        draft.validate()?;
        self.get_project(project_id)?;
        self.conn.execute(
            "INSERT INTO imagery (project_id, name, fmt, url, chips)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                project_id,
                draft.name,
                draft.fmt.as_str(),
                draft.url,
                draft.chips
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(imagery_id = id, project_id, fmt = draft.fmt.as_str(), "registered imagery");
        Ok(ImagerySpec {
            id,
            project_id,
            name: draft.name.clone(),
            fmt: draft.fmt,
            url: draft.url.clone(),
        })
    }

    pub fn get_imagery(&self, id: i64) -> Result<ImagerySpec, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, project_id, name, fmt, url FROM imagery WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        let (id, project_id, name, fmt, url) =
            row.ok_or_else(|| StoreError::NotFound(format!("imagery {id}")))?;
        let fmt = ImageryFormat::parse(&fmt).map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(ImagerySpec {
            id,
            project_id,
            name,
            fmt,
            url,
        })
    }

    pub fn list_imagery(&self, project_id: i64) -> Result<Vec<ImagerySpec>, StoreError> {
        self.get_project(project_id)?;
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, name, fmt, url FROM imagery
             WHERE project_id = ?1 ORDER BY id",
        )?;
        let raw = stmt.query_map(params![project_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in raw {
            let (id, project_id, name, fmt, url) = row?;
            let fmt =
                ImageryFormat::parse(&fmt).map_err(|e| StoreError::Decode(e.to_string()))?;
            out.push(ImagerySpec {
                id,
                project_id,
                name,
                fmt,
                url,
            });
        }
        Ok(out)
    }

    /// Parsed chip manifest for list-format imagery; `None` for wms.
    pub fn imagery_chips(&self, id: i64) -> Result<Option<Vec<Chip>>, StoreError> {
        self.get_imagery(id)?;
        let chips = self.conn.query_row(
            "SELECT chips FROM imagery WHERE id = ?1",
            params![id],
            |row| row.get::<_, Option<String>>(0),
        )?;
        match chips {
            Some(raw) => {
                let chips = parse_chip_list_csv(raw.as_bytes())
                    .map_err(|e| StoreError::Decode(e.to_string()))?;
                Ok(Some(chips))
            }
            None => Ok(None),
        }
    }

    pub fn create_prediction(
        &self,
        project_id: i64,
        draft: &PredictionDraft,
    ) -> Result<Prediction, StoreError> {
        draft.validate()?;
        self.get_project(project_id)?;
        if let Some(imagery_id) = draft.imagery_id {
            self.get_imagery(imagery_id)?;
        }
        let created = unix_now();
        self.conn.execute(
            "INSERT INTO predictions (
               project_id, created, hint, version, tile_zoom, inf_list,
               inf_type, inf_binary, inf_supertile, imagery_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                project_id,
                created,
                draft.hint.as_str(),
                draft.version,
                i64::from(draft.tile_zoom),
                draft.inf_list.join(","),
                draft.inf_type,
                draft.inf_binary,
                draft.inf_supertile,
                draft.imagery_id,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(prediction_id = id, project_id, version = %draft.version, "created prediction");
        Ok(Prediction {
            id,
            project_id,
            created,
            hint: draft.hint,
            version: draft.version.clone(),
            tile_zoom: draft.tile_zoom,
            inf_list: draft.inf_list.clone(),
            inf_type: draft.inf_type.clone(),
            inf_binary: draft.inf_binary,
            inf_supertile: draft.inf_supertile,
            imagery_id: draft.imagery_id,
        })
    }

    pub fn get_prediction(&self, id: i64) -> Result<Prediction, StoreError> {
        let mut rows = self.prediction_rows("WHERE id = ?1", params![id])?;
        rows.pop()
            .ok_or_else(|| StoreError::NotFound(format!("prediction {id}")))
    }

    pub fn list_predictions(&self, project_id: i64) -> Result<Vec<Prediction>, StoreError> {
        self.get_project(project_id)?;
        self.prediction_rows("WHERE project_id = ?1 ORDER BY id", params![project_id])
    }

    fn prediction_rows(
        &self,
        where_clause: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<Prediction>, StoreError> {
        let sql = format!(
            "SELECT id, project_id, created, hint, version, tile_zoom, inf_list,
                    inf_type, inf_binary, inf_supertile, imagery_id
             FROM predictions {where_clause}"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let raw = stmt.query_map(args, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, bool>(8)?,
                row.get::<_, bool>(9)?,
                row.get::<_, Option<i64>>(10)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in raw {
            let (id, project_id, created, hint, version, tile_zoom, inf_list, inf_type, inf_binary, inf_supertile, imagery_id) =
                row?;
            let hint = Hint::parse(&hint).map_err(|e| StoreError::Decode(e.to_string()))?;
            let tile_zoom = u8::try_from(tile_zoom)
                .map_err(|_| StoreError::Decode(format!("tile_zoom {tile_zoom} out of range")))?;
            out.push(Prediction {
                id,
                project_id,
                created,
                hint,
                version,
                tile_zoom,
                inf_list: inf_list.split(',').map(str::to_string).collect(),
                inf_type,
                inf_binary,
                inf_supertile,
                imagery_id,
            });
        }
        Ok(out)
    }

    /// Persists a batch of tile rows in one transaction. Every row must use
    /// only inference names the owning prediction declares; one bad row
    /// rejects the whole batch.
    pub fn create_tile_batch(
        &mut self,
        prediction_id: i64,
        rows: &[TileInput],
    ) -> Result<Vec<i64>, StoreError> {
        if rows.is_empty() {
            return Err(StoreError::InvalidRequest("empty tile batch".to_string()));
        }
        let prediction = self.get_prediction(prediction_id)?;
        let mut decoded = Vec::with_capacity(rows.len());
        for input in rows {
            for name in input.predictions.keys() {
                if !prediction.declares_inference(name) {
                    return Err(StoreError::SchemaMismatch(format!(
                        "inference {name:?} is not declared by prediction {prediction_id}"
                    )));
                }
            }
            decoded.push(input.decode()?);
        }

        let tx = self.conn.transaction()?;
        let mut ids = Vec::with_capacity(rows.len());
        {
            let mut tile_stmt = tx.prepare(
                "INSERT INTO prediction_tiles (prediction_id, quadkey, geom, predictions, validity)
                 VALUES (?1, ?2, ?3, ?4, NULL)",
            )?;
            let mut rtree_stmt = tx.prepare(
                "INSERT INTO prediction_tiles_rtree (tile_rowid, min_lon, max_lon, min_lat, max_lat)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (input, (quadkey, polygon)) in rows.iter().zip(&decoded) {
                let geom = polygon_to_geojson(polygon).to_string();
                let predictions = serde_json::to_string(&input.predictions)
                    .map_err(|e| StoreError::Decode(e.to_string()))?;
                tile_stmt.execute(params![prediction_id, quadkey, geom, predictions])?;
                let id = tx.last_insert_rowid();
                let rect = polygon.bounding_rect().ok_or_else(|| {
                    StoreError::InvalidRequest("geometry has no extent".to_string())
                })?;
                rtree_stmt.execute(params![
                    id,
                    rect.min().x,
                    rect.max().x,
                    rect.min().y,
                    rect.max().y
                ])?;
                ids.push(id);
            }
        }
        tx.commit()?;
        info!(prediction_id, rows = ids.len(), "ingested tile batch");
        Ok(ids)
    }

    /// Merges a validity patch into one tile. Keys the tile's stored score
    /// map lacks are dropped without error, so validity always stays a
    /// subset of the row's prediction keys; per-key last write wins.
    pub fn update_validity(
        &self,
        prediction_id: i64,
        patch: &ValidityPatch,
    ) -> Result<BTreeMap<String, bool>, StoreError> {
        let (scored, existing) = self
            .conn
            .query_row(
                "SELECT predictions, validity FROM prediction_tiles
                 WHERE id = ?1 AND prediction_id = ?2",
                params![patch.id, prediction_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "tile {} in prediction {prediction_id}",
                    patch.id
                ))
            })?;
        let scored: BTreeMap<String, f64> =
            serde_json::from_str(&scored).map_err(|e| StoreError::Decode(e.to_string()))?;
        let mut merged: BTreeMap<String, bool> = match existing {
            Some(raw) => {
                serde_json::from_str(&raw).map_err(|e| StoreError::Decode(e.to_string()))?
            }
            None => BTreeMap::new(),
        };
        for (name, value) in &patch.validity {
            if scored.contains_key(name) {
                merged.insert(name.clone(), *value);
            }
        }
        let raw =
            serde_json::to_string(&merged).map_err(|e| StoreError::Decode(e.to_string()))?;
        self.conn.execute(
            "UPDATE prediction_tiles SET validity = ?1 WHERE id = ?2",
            params![raw, patch.id],
        )?;
        Ok(merged)
    }

    pub fn count_tiles(&self, prediction_id: i64) -> Result<u64, StoreError> {
        self.get_prediction(prediction_id)?;
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM prediction_tiles WHERE prediction_id = ?1",
            params![prediction_id],
            |row| row.get(0),
        )?;
        Ok(count.unsigned_abs())
    }

    /// Lon/lat bounding box over every stored tile of a prediction.
    pub fn tile_extent(&self, prediction_id: i64) -> Result<(f64, f64, f64, f64), StoreError> {
        self.get_prediction(prediction_id)?;
        let bounds = self.conn.query_row(
            "SELECT MIN(r.min_lon), MIN(r.min_lat), MAX(r.max_lon), MAX(r.max_lat)
             FROM prediction_tiles_rtree r
             JOIN prediction_tiles t ON t.id = r.tile_rowid
             WHERE t.prediction_id = ?1",
            params![prediction_id],
            |row| {
                Ok((
                    row.get::<_, Option<f64>>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                ))
            },
        )?;
        match bounds {
            (Some(min_lon), Some(min_lat), Some(max_lon), Some(max_lat)) => {
                Ok((min_lon, min_lat, max_lon, max_lat))
            }
            _ => Err(StoreError::EmptyResult("prediction has no tiles")),
        }
    }

    /// Min/max quadkey zoom over stored rows, for TileJSON metadata.
    pub fn quadkey_zoom_range(&self, prediction_id: i64) -> Result<(u8, u8), StoreError> {
        self.get_prediction(prediction_id)?;
        let range = self.conn.query_row(
            "SELECT MIN(LENGTH(quadkey)), MAX(LENGTH(quadkey))
             FROM prediction_tiles
             WHERE prediction_id = ?1 AND quadkey IS NOT NULL",
            params![prediction_id],
            |row| {
                Ok((
                    row.get::<_, Option<i64>>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                ))
            },
        )?;
        match range {
            (Some(min), Some(max)) => {
                let min = u8::try_from(min)
                    .map_err(|_| StoreError::Decode(format!("quadkey length {min}")))?;
                let max = u8::try_from(max)
                    .map_err(|_| StoreError::Decode(format!("quadkey length {max}")))?;
                Ok((min, max))
            }
            _ => Err(StoreError::EmptyResult("prediction has no quadkeyed tiles")),
        }
    }

    /// Distinct inference names present across a prediction's stored rows.
    pub fn inference_names(&self, prediction_id: i64) -> Result<Vec<String>, StoreError> {
        self.get_prediction(prediction_id)?;
        let mut stmt = self.conn.prepare(
            "SELECT predictions FROM prediction_tiles WHERE prediction_id = ?1",
        )?;
        let raw = stmt.query_map(params![prediction_id], |row| row.get::<_, String>(0))?;
        let mut names = std::collections::BTreeSet::new();
        for row in raw {
            let map: BTreeMap<String, f64> =
                serde_json::from_str(&row?).map_err(|e| StoreError::Decode(e.to_string()))?;
            names.extend(map.into_keys());
        }
        Ok(names.into_iter().collect())
    }

    /// Tiles whose stored bounds intersect the given lon/lat bbox, through
    /// the R-tree index. `bounds` is `(min_lon, min_lat, max_lon, max_lat)`.
    pub fn tiles_intersecting(
        &self,
        prediction_id: i64,
        bounds: (f64, f64, f64, f64),
    ) -> Result<Vec<PredictionTile>, StoreError> {
        self.get_prediction(prediction_id)?;
        let (min_lon, min_lat, max_lon, max_lat) = bounds;
        let mut stmt = self.conn.prepare(
            "SELECT t.id, t.prediction_id, t.quadkey, t.geom, t.predictions, t.validity
             FROM prediction_tiles t
             JOIN prediction_tiles_rtree r ON r.tile_rowid = t.id
             WHERE t.prediction_id = ?1
               AND r.max_lon >= ?2 AND r.min_lon <= ?3
               AND r.max_lat >= ?4 AND r.min_lat <= ?5
             ORDER BY t.id",
        )?;
        let raw = stmt.query_map(
            params![prediction_id, min_lon, max_lon, min_lat, max_lat],
            raw_tile_row,
        )?;
        let mut tiles = Vec::new();
        for row in raw {
            tiles.push(decode_tile_row(row?)?);
        }
        Ok(tiles)
    }

    pub fn cursor(&self, prediction_id: i64) -> Result<TileCursor<'_>, StoreError> {
        self.get_prediction(prediction_id)?;
        Ok(TileCursor {
            store: self,
            prediction_id,
            last_id: 0,
            done: false,
        })
    }
}

/// Forward-only keyset reader over one prediction's tiles, `CURSOR_BATCH`
/// rows per step. An empty batch means the cursor is exhausted.
#[derive(Debug)]
pub struct TileCursor<'a> {
    store: &'a Store,
    prediction_id: i64,
    last_id: i64,
    done: bool,
}

impl TileCursor<'_> {
    pub fn next_batch(&mut self) -> Result<Vec<PredictionTile>, StoreError> {
        if self.done {
            return Ok(Vec::new());
        }
        let mut stmt = self.store.conn.prepare(
            "SELECT id, prediction_id, quadkey, geom, predictions, validity
             FROM prediction_tiles
             WHERE prediction_id = ?1 AND id > ?2
             ORDER BY id
             LIMIT ?3",
        )?;
        let raw = stmt.query_map(
            params![self.prediction_id, self.last_id, CURSOR_BATCH as i64],
            raw_tile_row,
        )?;
        let mut tiles = Vec::new();
        for row in raw {
            tiles.push(decode_tile_row(row?)?);
        }
        match tiles.last() {
            Some(tile) => self.last_id = tile.id,
            None => self.done = true,
        }
        Ok(tiles)
    }
}

type RawTileRow = (i64, i64, Option<String>, String, String, Option<String>);

fn raw_tile_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTileRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_tile_row(raw: RawTileRow) -> Result<PredictionTile, StoreError> {
    let (id, prediction_id, quadkey, geom, predictions, validity) = raw;
    let geom_value: serde_json::Value =
        serde_json::from_str(&geom).map_err(|e| StoreError::Decode(e.to_string()))?;
    let geom = polygon_from_geojson(&geom_value)
        .map_err(|e| StoreError::Decode(format!("tile {id}: {e}")))?;
    let predictions: BTreeMap<String, f64> =
        serde_json::from_str(&predictions).map_err(|e| StoreError::Decode(e.to_string()))?;
    let validity = match validity {
        Some(raw) => {
            Some(serde_json::from_str(&raw).map_err(|e| StoreError::Decode(e.to_string()))?)
        }
        None => None,
    };
    Ok(PredictionTile {
        id,
        prediction_id,
        quadkey,
        geom,
        predictions,
        validity,
    })
}

fn unix_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX),
        Err(_) => 0,
    }
}
