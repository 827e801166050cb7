use sqlx::SqlitePool;

/// Ordered schema migrations tracked in `schema_info`.
///
/// MBTiles tooling expects exactly the `tiles`/`metadata` tables, so versions
/// are tracked in our own table instead of a framework-owned one.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE IF NOT EXISTS tiles (
             zoom_level INTEGER NOT NULL,
             tile_column INTEGER NOT NULL,
             tile_row INTEGER NOT NULL,
             tile_data BLOB NOT NULL
         );
         CREATE UNIQUE INDEX IF NOT EXISTS tile_index
             ON tiles (zoom_level, tile_column, tile_row);
         CREATE TABLE IF NOT EXISTS metadata (
             name TEXT UNIQUE NOT NULL,
             value TEXT NOT NULL
         );",
    ),
    (
        2,
        "ALTER TABLE tiles ADD COLUMN generated INTEGER NOT NULL DEFAULT 0;
         ALTER TABLE tiles ADD COLUMN updated_at TEXT;
         CREATE INDEX IF NOT EXISTS tiles_zoom ON tiles (zoom_level);
         CREATE INDEX IF NOT EXISTS tiles_zoom_size
             ON tiles (zoom_level, length(tile_data));
         CREATE INDEX IF NOT EXISTS tiles_zoom_updated
             ON tiles (zoom_level, updated_at);
         CREATE INDEX IF NOT EXISTS tiles_zoom_generated
             ON tiles (zoom_level, generated);",
    ),
    (
        3,
        "CREATE TABLE IF NOT EXISTS misses (
             zoom_level INTEGER NOT NULL,
             tile_column INTEGER NOT NULL,
             tile_row INTEGER NOT NULL,
             ts INTEGER NOT NULL,
             reason TEXT NOT NULL,
             details TEXT NOT NULL DEFAULT '',
             status INTEGER NOT NULL,
             response_body BLOB,
             PRIMARY KEY (zoom_level, tile_column, tile_row)
         );
         CREATE INDEX IF NOT EXISTS misses_zoom_status
             ON misses (zoom_level, status);
         CREATE INDEX IF NOT EXISTS misses_ts ON misses (ts);",
    ),
    (
        4,
        "CREATE TABLE IF NOT EXISTS scan_progress (
             source TEXT NOT NULL,
             zoom_level INTEGER NOT NULL,
             last_x INTEGER NOT NULL DEFAULT 0,
             last_y INTEGER NOT NULL DEFAULT 0,
             tiles_today INTEGER NOT NULL DEFAULT 0,
             last_scan_date TEXT NOT NULL DEFAULT '',
             status TEXT NOT NULL DEFAULT 'waiting',
             PRIMARY KEY (source, zoom_level)
         );",
    ),
];

pub async fn run(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_info (version INTEGER NOT NULL)")
        .execute(pool)
        .await?;

    let applied: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_info")
        .fetch_one(pool)
        .await?;
    let applied = applied.unwrap_or(0);

    for (version, sql) in MIGRATIONS {
        if *version <= applied {
            continue;
        }
        let mut tx = pool.begin().await?;
        for statement in sql.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT INTO schema_info (version) VALUES (?)")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }
    Ok(())
}

pub async fn current_version(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_info")
        .fetch_one(pool)
        .await?;
    Ok(version.unwrap_or(0))
}
