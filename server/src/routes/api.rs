use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use strata_shared::tile_range;
use tracing::warn;

use crate::config::is_valid_source_name;
use crate::services::reconstructor;
use crate::state::{AppState, Source};

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "sources": state.sources.len(),
        "uptime_secs": (chrono::Utc::now() - state.started_at).num_seconds(),
    }))
}

/// Per-source tile/miss counts, cache size and zoom coverage.
pub async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut route_stats = serde_json::Map::new();
    let mut total_tiles = 0i64;
    let mut total_misses = 0i64;
    let mut total_size = 0i64;

    for (name, source) in state.sources.iter() {
        let stats = source_stats(source).await;
        total_tiles += stats.tiles;
        total_misses += stats.misses;
        total_size += stats.cache_size;
        route_stats.insert(
            name.clone(),
            serde_json::json!({
                "tiles_count": stats.tiles,
                "misses_count": stats.misses,
                "cache_size": stats.cache_size,
                "coverage_data": stats.coverage_data,
                "coverage_percentage": stats.coverage_percentage,
            }),
        );
    }

    Json(serde_json::json!({
        "route_stats": route_stats,
        "totals": {
            "tiles": total_tiles,
            "misses": total_misses,
            "cache_size": total_size,
        }
    }))
}

struct SourceStats {
    tiles: i64,
    misses: i64,
    cache_size: i64,
    coverage_data: serde_json::Value,
    coverage_percentage: f64,
}

async fn source_stats(source: &Source) -> SourceStats {
    let tiles = source.store.count_tiles_total().await.unwrap_or_else(|e| {
        warn!(source = %source.name, error = %e, "tile count failed");
        0
    });
    let misses = source.store.count_misses_total().await.unwrap_or_else(|e| {
        warn!(source = %source.name, error = %e, "miss count failed");
        0
    });
    let cache_size = source.store.sum_tile_bytes().await.unwrap_or_else(|e| {
        warn!(source = %source.name, error = %e, "cache size failed");
        0
    });

    let bounds = source.config.scan_bounds();
    let mut coverage = serde_json::Map::new();
    let mut covered = 0u64;
    let mut expected_total = 0u64;
    for zoom in source.config.minzoom..=source.config.maxzoom {
        let expected = tile_range(&bounds, zoom).count();
        let have = source.store.count_tiles(zoom).await.unwrap_or(0) as u64;
        let have = have.min(expected);
        covered += have;
        expected_total += expected;
        coverage.insert(
            zoom.to_string(),
            serde_json::json!({
                "tiles": have,
                "expected": expected,
                "percentage": percentage(have, expected),
            }),
        );
    }

    SourceStats {
        tiles,
        misses,
        cache_size,
        coverage_data: serde_json::Value::Object(coverage),
        coverage_percentage: percentage(covered, expected_total),
    }
}

fn percentage(have: u64, expected: u64) -> f64 {
    if expected == 0 {
        return 0.0;
    }
    (have as f64 / expected as f64 * 10_000.0).round() / 100.0
}

/// Exclusive maintenance: VACUUM every source store.
pub async fn vacuum(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut vacuumed = 0usize;
    let mut failed = Vec::new();
    for (name, source) in state.sources.iter() {
        match source.store.vacuum().await {
            Ok(()) => vacuumed += 1,
            Err(e) => {
                warn!(source = %name, error = %e, "vacuum failed");
                failed.push(name.clone());
            }
        }
    }
    if failed.is_empty() {
        Json(serde_json::json!({
            "status": "ok",
            "message": format!("vacuumed {vacuumed} source stores"),
        }))
    } else {
        Json(serde_json::json!({
            "status": "error",
            "message": format!("vacuum failed for: {}", failed.join(", ")),
        }))
    }
}

fn lookup_source(state: &AppState, name: &str) -> Result<std::sync::Arc<Source>, StatusCode> {
    if !is_valid_source_name(name) {
        return Err(StatusCode::BAD_REQUEST);
    }
    state.source(name).ok_or(StatusCode::NOT_FOUND)
}

/// Scanner visibility: per-zoom progress rows, including the halt states
/// (`critical_error`, `source_unavailable`) that never surface on the tile
/// path.
pub async fn scan_status(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let source = match lookup_source(&state, &name) {
        Ok(source) => source,
        Err(status) => return status.into_response(),
    };
    let rows = match source.store.list_scan_progress(&name).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(source = %name, error = %e, "scan progress listing failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let zooms: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            serde_json::json!({
                "zoom": row.zoom,
                "status": row.status.as_str(),
                "last_x": row.last_x,
                "last_y": row.last_y,
                "tiles_today": row.tiles_today,
                "last_scan_date": row.last_scan_date,
            })
        })
        .collect();
    Json(serde_json::json!({
        "source": name,
        "autoscan_enabled": source.config.autoscan.enabled,
        "daily_limit": source.config.autoscan.daily_limit,
        "zooms": zooms,
    }))
    .into_response()
}

pub async fn reconstructor_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    let source = match lookup_source(&state, &name) {
        Ok(source) => source,
        Err(status) => return status.into_response(),
    };
    let (hour, minute) =
        reconstructor::parse_schedule(&source.config.gap_filling.schedule.time).unwrap_or((0, 0));
    let last_run = *source.reconstructor.last_run.read().await;
    Json(serde_json::json!({
        "running": source.reconstructor.running.load(std::sync::atomic::Ordering::SeqCst),
        "last_run": last_run.map(|t| t.to_rfc3339()),
        "schedule_time": {"hour": hour, "minute": minute},
    }))
    .into_response()
}

pub async fn reconstructor_start(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    let source = match lookup_source(&state, &name) {
        Ok(source) => source,
        Err(status) => return status.into_response(),
    };
    if reconstructor::try_start(source) {
        Json(serde_json::json!({"success": true})).into_response()
    } else {
        (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"success": false, "error": "already running"})),
        )
            .into_response()
    }
}

pub async fn dashboard() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

const DASHBOARD_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Strata tile proxy</title>
<style>
  body { font-family: system-ui, sans-serif; margin: 2rem; color: #222; }
  table { border-collapse: collapse; margin-top: 1rem; }
  th, td { border: 1px solid #ccc; padding: 0.4rem 0.8rem; text-align: right; }
  th:first-child, td:first-child { text-align: left; }
  caption { text-align: left; font-weight: 600; margin-bottom: 0.5rem; }
</style>
</head>
<body>
<h1>Strata tile proxy</h1>
<table id="stats">
  <caption>Source stores</caption>
  <thead>
    <tr><th>Source</th><th>Tiles</th><th>Misses</th><th>Size (MiB)</th><th>Coverage</th></tr>
  </thead>
  <tbody></tbody>
</table>
<p id="totals"></p>
<script>
async function refresh() {
  const res = await fetch('/api/stats');
  const data = await res.json();
  const tbody = document.querySelector('#stats tbody');
  tbody.innerHTML = '';
  for (const [name, s] of Object.entries(data.route_stats)) {
    const row = document.createElement('tr');
    row.innerHTML = `<td>${name}</td>` +
      `<td>${s.tiles_count}</td><td>${s.misses_count}</td>` +
      `<td>${(s.cache_size / 1048576).toFixed(1)}</td>` +
      `<td>${s.coverage_percentage.toFixed(2)}%</td>`;
    tbody.appendChild(row);
  }
  const t = data.totals;
  document.querySelector('#totals').textContent =
    `${t.tiles} tiles, ${t.misses} misses, ${(t.cache_size / 1048576).toFixed(1)} MiB total`;
}
refresh();
setInterval(refresh, 10000);
</script>
</body>
</html>
"#;
