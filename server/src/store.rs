use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use strata_shared::{LngLatBounds, StoredCoord, tile_range};
use tracing::{info, warn};

use crate::store_migrations;

const POOL_CONNECTIONS: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_millis(10_000);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("failed to create {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected generated flag {0}")]
    BadGenerated(i64),
}

/// Provenance flag stored with every tile row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generated {
    /// Fetched from upstream as-is.
    Origin,
    /// Composed from children by the reconstructor.
    Reconstructed,
    /// Stale parent awaiting regeneration; bytes are the previous content
    /// or an empty placeholder.
    Candidate,
}

impl Generated {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Origin => 0,
            Self::Reconstructed => 1,
            Self::Candidate => 2,
        }
    }

    pub fn from_i64(value: i64) -> Result<Self, StoreError> {
        match value {
            0 => Ok(Self::Origin),
            1 => Ok(Self::Reconstructed),
            2 => Ok(Self::Candidate),
            other => Err(StoreError::BadGenerated(other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TileRecord {
    pub data: Vec<u8>,
    pub generated: Generated,
}

#[derive(Debug, Clone)]
pub struct MissRecord {
    pub ts: i64,
    pub reason: String,
    pub details: String,
    pub status: i64,
    pub response_body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Waiting,
    Active,
    Completed,
    Stopped,
    Error,
    SourceUnavailable,
    CriticalError,
}

impl ScanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::SourceUnavailable => "source_unavailable",
            Self::CriticalError => "critical_error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(Self::Waiting),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "stopped" => Some(Self::Stopped),
            "error" => Some(Self::Error),
            "source_unavailable" => Some(Self::SourceUnavailable),
            "critical_error" => Some(Self::CriticalError),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanProgress {
    pub source: String,
    pub zoom: u8,
    pub last_x: i64,
    pub last_y: i64,
    pub tiles_today: i64,
    pub last_scan_date: String,
    pub status: ScanStatus,
}

impl ScanProgress {
    pub fn fresh(source: &str, zoom: u8) -> Self {
        Self {
            source: source.to_string(),
            zoom,
            last_x: 0,
            last_y: 0,
            tiles_today: 0,
            last_scan_date: String::new(),
            status: ScanStatus::Waiting,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum CheckpointMode {
    Passive,
    Restart,
    Truncate,
}

impl CheckpointMode {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Passive => "PRAGMA wal_checkpoint(PASSIVE)",
            Self::Restart => "PRAGMA wal_checkpoint(RESTART)",
            Self::Truncate => "PRAGMA wal_checkpoint(TRUNCATE)",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CheckpointResult {
    /// True when a reader/writer blocked the checkpoint from completing.
    pub busy: bool,
    pub wal_frames: i64,
    pub checkpointed_frames: i64,
}

impl CheckpointResult {
    pub fn fully_reclaimed(&self) -> bool {
        !self.busy && self.wal_frames == self.checkpointed_frames
    }
}

/// One MBTiles-compatible SQLite file per source.
#[derive(Debug, Clone)]
pub struct TileStore {
    pool: SqlitePool,
}

impl TileStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .locking_mode(SqliteLockingMode::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .page_size(4096)
            .pragma("temp_store", "MEMORY")
            .pragma("cache_size", "-131072")
            .pragma("mmap_size", "536870912")
            .pragma("wal_autocheckpoint", "1000");

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_CONNECTIONS)
            .connect_with(options)
            .await?;

        store_migrations::run(&pool).await?;

        let store = Self { pool };
        // Integrate any WAL left behind by a previous process.
        store.checkpoint(CheckpointMode::Restart).await?;
        store.checkpoint(CheckpointMode::Truncate).await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn get_tile(&self, coord: StoredCoord) -> Result<Option<TileRecord>, StoreError> {
        let row: Option<(Vec<u8>, i64)> = sqlx::query_as(
            "SELECT tile_data, generated FROM tiles
             WHERE zoom_level = ? AND tile_column = ? AND tile_row = ?",
        )
        .bind(coord.z as i64)
        .bind(coord.x as i64)
        .bind(coord.row as i64)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some((data, generated)) => Ok(Some(TileRecord {
                data,
                generated: Generated::from_i64(generated)?,
            })),
            None => Ok(None),
        }
    }

    /// Upsert a tile and clear any miss at the same key in one transaction.
    pub async fn put_tile(
        &self,
        coord: StoredCoord,
        data: &[u8],
        generated: Generated,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO tiles (zoom_level, tile_column, tile_row, tile_data, generated, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (zoom_level, tile_column, tile_row) DO UPDATE SET
                 tile_data = excluded.tile_data,
                 generated = excluded.generated,
                 updated_at = excluded.updated_at",
        )
        .bind(coord.z as i64)
        .bind(coord.x as i64)
        .bind(coord.row as i64)
        .bind(data)
        .bind(generated.as_i64())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM misses WHERE zoom_level = ? AND tile_column = ? AND tile_row = ?")
            .bind(coord.z as i64)
            .bind(coord.x as i64)
            .bind(coord.row as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_miss(&self, coord: StoredCoord) -> Result<Option<MissRecord>, StoreError> {
        let row: Option<(i64, String, String, i64, Option<Vec<u8>>)> = sqlx::query_as(
            "SELECT ts, reason, details, status, response_body FROM misses
             WHERE zoom_level = ? AND tile_column = ? AND tile_row = ?",
        )
        .bind(coord.z as i64)
        .bind(coord.x as i64)
        .bind(coord.row as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(ts, reason, details, status, response_body)| MissRecord {
            ts,
            reason,
            details,
            status,
            response_body,
        }))
    }

    /// Delete-then-insert by key, then trim the oldest 20% once the table
    /// exceeds `max_records`.
    pub async fn record_miss(
        &self,
        coord: StoredCoord,
        reason: &str,
        details: &str,
        status: i64,
        response_body: Option<&[u8]>,
        max_records: i64,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM misses WHERE zoom_level = ? AND tile_column = ? AND tile_row = ?")
            .bind(coord.z as i64)
            .bind(coord.x as i64)
            .bind(coord.row as i64)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO misses (zoom_level, tile_column, tile_row, ts, reason, details, status, response_body)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(coord.z as i64)
        .bind(coord.x as i64)
        .bind(coord.row as i64)
        .bind(Utc::now().timestamp())
        .bind(reason)
        .bind(details)
        .bind(status)
        .bind(response_body)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if max_records > 0 {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM misses")
                .fetch_one(&self.pool)
                .await?;
            if count > max_records {
                let keep = count * 4 / 5;
                let trimmed = sqlx::query(
                    "DELETE FROM misses WHERE rowid IN
                         (SELECT rowid FROM misses ORDER BY ts ASC LIMIT ?)",
                )
                .bind(count - keep)
                .execute(&self.pool)
                .await?;
                info!(
                    trimmed = trimmed.rows_affected(),
                    remaining = keep,
                    "trimmed miss table past its record cap"
                );
            }
        }
        Ok(())
    }

    pub async fn delete_miss(&self, coord: StoredCoord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM misses WHERE zoom_level = ? AND tile_column = ? AND tile_row = ?",
        )
        .bind(coord.z as i64)
        .bind(coord.x as i64)
        .bind(coord.row as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_tiles(&self, zoom: u8) -> Result<i64, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM tiles WHERE zoom_level = ?")
                .bind(zoom as i64)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    pub async fn count_misses(&self, zoom: u8) -> Result<i64, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM misses WHERE zoom_level = ?")
                .bind(zoom as i64)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    pub async fn count_tiles_total(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM tiles")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn count_misses_total(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM misses")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn sum_tile_bytes(&self) -> Result<i64, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT COALESCE(SUM(LENGTH(tile_data)), 0) FROM tiles")
                .fetch_one(&self.pool)
                .await?,
        )
    }

    pub async fn tiles_per_zoom(&self) -> Result<Vec<(u8, i64)>, StoreError> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT zoom_level, COUNT(*) FROM tiles GROUP BY zoom_level ORDER BY zoom_level",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(zoom, count)| (zoom as u8, count))
            .collect())
    }

    pub async fn set_metadata(&self, name: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO metadata (name, value) VALUES (?, ?)
             ON CONFLICT (name) DO UPDATE SET value = excluded.value",
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_metadata(&self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT value FROM metadata WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn get_scan_progress(
        &self,
        source: &str,
        zoom: u8,
    ) -> Result<Option<ScanProgress>, StoreError> {
        let row: Option<(i64, i64, i64, String, String)> = sqlx::query_as(
            "SELECT last_x, last_y, tiles_today, last_scan_date, status
             FROM scan_progress WHERE source = ? AND zoom_level = ?",
        )
        .bind(source)
        .bind(zoom as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(
            |(last_x, last_y, tiles_today, last_scan_date, status)| ScanProgress {
                source: source.to_string(),
                zoom,
                last_x,
                last_y,
                tiles_today,
                last_scan_date,
                status: ScanStatus::parse(&status).unwrap_or(ScanStatus::Waiting),
            },
        ))
    }

    pub async fn upsert_scan_progress(&self, progress: &ScanProgress) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO scan_progress
                 (source, zoom_level, last_x, last_y, tiles_today, last_scan_date, status)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (source, zoom_level) DO UPDATE SET
                 last_x = excluded.last_x,
                 last_y = excluded.last_y,
                 tiles_today = excluded.tiles_today,
                 last_scan_date = excluded.last_scan_date,
                 status = excluded.status",
        )
        .bind(&progress.source)
        .bind(progress.zoom as i64)
        .bind(progress.last_x)
        .bind(progress.last_y)
        .bind(progress.tiles_today)
        .bind(&progress.last_scan_date)
        .bind(progress.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_status(
        &self,
        source: &str,
        zooms: &[u8],
        status: ScanStatus,
    ) -> Result<(), StoreError> {
        if zooms.is_empty() {
            return Ok(());
        }
        let mut builder = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
            "UPDATE scan_progress SET status = ",
        );
        builder.push_bind(status.as_str());
        builder.push(" WHERE source = ");
        builder.push_bind(source);
        builder.push(" AND zoom_level IN (");
        let mut separated = builder.separated(", ");
        for zoom in zooms {
            separated.push_bind(*zoom as i64);
        }
        builder.push(")");
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    pub async fn list_scan_progress(&self, source: &str) -> Result<Vec<ScanProgress>, StoreError> {
        let rows: Vec<(i64, i64, i64, i64, String, String)> = sqlx::query_as(
            "SELECT zoom_level, last_x, last_y, tiles_today, last_scan_date, status
             FROM scan_progress WHERE source = ? ORDER BY zoom_level",
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(
                |(zoom, last_x, last_y, tiles_today, last_scan_date, status)| ScanProgress {
                    source: source.to_string(),
                    zoom: zoom as u8,
                    last_x,
                    last_y,
                    tiles_today,
                    last_scan_date,
                    status: ScanStatus::parse(&status).unwrap_or(ScanStatus::Waiting),
                },
            )
            .collect())
    }

    /// Startup reset: zooms that ended in an error state go back to waiting.
    pub async fn reset_interrupted_scans(&self, source: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE scan_progress SET status = 'waiting'
             WHERE source = ? AND status IN ('active', 'error', 'critical_error', 'source_unavailable')",
        )
        .bind(source)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Insert an empty `generated=2` placeholder, or demote a reconstructed
    /// parent back to candidate. Origin rows and existing candidates are
    /// left untouched. Returns true when a row was created or changed.
    pub async fn mark_parent_candidate(&self, parent: StoredCoord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO tiles (zoom_level, tile_column, tile_row, tile_data, generated, updated_at)
             VALUES (?, ?, ?, X'', 2, ?)
             ON CONFLICT (zoom_level, tile_column, tile_row) DO UPDATE SET
                 generated = 2,
                 updated_at = excluded.updated_at
             WHERE tiles.generated = 1",
        )
        .bind(parent.z as i64)
        .bind(parent.x as i64)
        .bind(parent.row as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn candidates_at_zoom(&self, zoom: u8) -> Result<Vec<StoredCoord>, StoreError> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT tile_column, tile_row FROM tiles
             WHERE zoom_level = ? AND generated = 2
             ORDER BY tile_column, tile_row",
        )
        .bind(zoom as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(x, row)| StoredCoord::new(zoom, x as u32, row as u32))
            .collect())
    }

    pub async fn misses_at_zoom(&self, zoom: u8) -> Result<Vec<StoredCoord>, StoreError> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT tile_column, tile_row FROM misses
             WHERE zoom_level = ? ORDER BY tile_column, tile_row",
        )
        .bind(zoom as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(x, row)| StoredCoord::new(zoom, x as u32, row as u32))
            .collect())
    }

    /// Distinct parents at `zoom - 1` that have at least one child at `zoom`
    /// but no row of their own.
    pub async fn orphan_parents(&self, zoom: u8) -> Result<Vec<StoredCoord>, StoreError> {
        if zoom == 0 {
            return Ok(Vec::new());
        }
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT DISTINCT tile_column / 2, tile_row / 2 FROM tiles AS child
             WHERE zoom_level = ?
               AND NOT EXISTS (
                   SELECT 1 FROM tiles AS parent
                   WHERE parent.zoom_level = ? - 1
                     AND parent.tile_column = child.tile_column / 2
                     AND parent.tile_row = child.tile_row / 2
               )",
        )
        .bind(zoom as i64)
        .bind(zoom as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(x, row)| StoredCoord::new(zoom - 1, x as u32, row as u32))
            .collect())
    }

    /// Child payloads for a parent, image order `[TL, TR, BL, BR]`.
    /// Empty placeholder rows count as absent.
    pub async fn children_data(
        &self,
        parent: StoredCoord,
    ) -> Result<[Option<Vec<u8>>; 4], StoreError> {
        let mut out: [Option<Vec<u8>>; 4] = [None, None, None, None];
        for (slot, child) in parent.children().into_iter().enumerate() {
            let data: Option<Vec<u8>> = sqlx::query_scalar(
                "SELECT tile_data FROM tiles
                 WHERE zoom_level = ? AND tile_column = ? AND tile_row = ?
                   AND LENGTH(tile_data) > 0",
            )
            .bind(child.z as i64)
            .bind(child.x as i64)
            .bind(child.row as i64)
            .fetch_optional(&self.pool)
            .await?;
            out[slot] = data;
        }
        Ok(out)
    }

    /// One-shot cleanup: drop tiles outside the configured bounds. Gated by
    /// a metadata flag so it runs at most once per store.
    pub async fn cleanup_out_of_bounds(
        &self,
        bounds: &LngLatBounds,
        minzoom: u8,
        maxzoom: u8,
    ) -> Result<u64, StoreError> {
        const FLAG: &str = "bounds_cleanup_done";
        if self.get_metadata(FLAG).await?.is_some() {
            return Ok(0);
        }
        let mut deleted = 0u64;
        for zoom in minzoom..=maxzoom {
            let range = tile_range(bounds, zoom);
            let min_row = strata_shared::tms_row(zoom, range.max_y) as i64;
            let max_row = strata_shared::tms_row(zoom, range.min_y) as i64;
            let result = sqlx::query(
                "DELETE FROM tiles WHERE zoom_level = ?
                   AND (tile_column < ? OR tile_column > ?
                        OR tile_row < ? OR tile_row > ?)",
            )
            .bind(zoom as i64)
            .bind(range.min_x as i64)
            .bind(range.max_x as i64)
            .bind(min_row)
            .bind(max_row)
            .execute(&self.pool)
            .await?;
            deleted += result.rows_affected();
        }
        self.set_metadata(FLAG, &Utc::now().to_rfc3339()).await?;
        if deleted > 0 {
            warn!(deleted, "removed tiles outside the configured bounds");
        }
        Ok(deleted)
    }

    pub async fn vacuum(&self) -> Result<(), StoreError> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointResult, StoreError> {
        let (busy, wal_frames, checkpointed_frames): (i64, i64, i64) =
            sqlx::query_as(mode.as_sql()).fetch_one(&self.pool).await?;
        Ok(CheckpointResult {
            busy: busy != 0,
            wal_frames,
            checkpointed_frames,
        })
    }
}
