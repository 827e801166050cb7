use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng as _;
use reqwest::header::HeaderMap;
use strata_shared::{StoredCoord, TileCoord, tile_range};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{SCAN_BACKOFF_CAP_SECS, SCAN_MAX_RETRIES, SCAN_PROGRESS_FLUSH_EVERY};
use crate::engine::{self, FetchError, FetchFailure, MissReason};
use crate::state::Source;
use crate::store::{ScanProgress, ScanStatus};

/// Per-tile result buckets driving the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Permanent,
    Transient,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ZoomOutcome {
    Completed,
    Cancelled,
    Critical,
    Unavailable,
    StoreFailed,
}

/// Resumable grid walk warming one source inside its daily budget.
pub async fn run(source: Arc<Source>, cancel: CancellationToken) {
    let minzoom = source.config.scan_minzoom();
    let maxzoom = source.config.max_scan_zoom();
    if minzoom > maxzoom {
        warn!(source = %source.name, "scan zoom range is empty, scanner disabled");
        return;
    }
    info!(
        source = %source.name,
        minzoom,
        maxzoom,
        daily_limit = source.config.autoscan.daily_limit,
        "scanner started"
    );

    if let Err(e) = startup_reset(&source).await {
        warn!(source = %source.name, error = %e, "scan progress reset failed");
    }

    let zooms: Vec<u8> = (minzoom..=maxzoom).collect();
    // Make every zoom visible in scan_progress before the walk starts, so
    // status updates (critical stop included) reach zooms not yet scanned.
    for &zoom in &zooms {
        match source.store.get_scan_progress(&source.name, zoom).await {
            Ok(None) => {
                let fresh = ScanProgress::fresh(&source.name, zoom);
                if let Err(e) = source.store.upsert_scan_progress(&fresh).await {
                    warn!(source = %source.name, zoom, error = %e, "failed to seed scan progress");
                }
            }
            Ok(Some(_)) => {}
            Err(e) => {
                warn!(source = %source.name, zoom, error = %e, "failed to read scan progress");
            }
        }
    }
    for &zoom in &zooms {
        if cancel.is_cancelled() {
            return;
        }
        match scan_zoom(&source, zoom, &cancel).await {
            ZoomOutcome::Completed => {}
            ZoomOutcome::Cancelled => {
                info!(source = %source.name, zoom, "scan cancelled");
                return;
            }
            ZoomOutcome::Critical => {
                warn!(source = %source.name, zoom, "access denied by upstream, stopping source");
                if let Err(e) = source
                    .store
                    .update_status(&source.name, &zooms, ScanStatus::CriticalError)
                    .await
                {
                    warn!(source = %source.name, error = %e, "failed to record critical stop");
                }
                return;
            }
            ZoomOutcome::Unavailable => {
                warn!(source = %source.name, zoom, "retries exhausted, source unavailable");
                return;
            }
            ZoomOutcome::StoreFailed => {
                // Leave the zoom in error state; the next run retries it.
                continue;
            }
        }
    }
    info!(source = %source.name, "scan complete for all zooms");
}

/// Zooms that ended in an error state, plus completed zooms whose tile
/// counts regressed, go back to waiting.
async fn startup_reset(source: &Source) -> Result<(), crate::store::StoreError> {
    source.store.reset_interrupted_scans(&source.name).await?;
    let bounds = source.config.scan_bounds();
    for progress in source.store.list_scan_progress(&source.name).await? {
        if progress.status != ScanStatus::Completed {
            continue;
        }
        let expected = tile_range(&bounds, progress.zoom).count() as i64;
        let have = source.store.count_tiles(progress.zoom).await?
            + source.store.count_misses(progress.zoom).await?;
        if have < expected {
            let mut reset = progress;
            reset.status = ScanStatus::Waiting;
            source.store.upsert_scan_progress(&reset).await?;
        }
    }
    Ok(())
}

async fn scan_zoom(source: &Arc<Source>, zoom: u8, cancel: &CancellationToken) -> ZoomOutcome {
    let range = tile_range(&source.config.scan_bounds(), zoom);
    let expected = range.count() as i64;
    let daily_limit = source.config.autoscan.daily_limit.max(1);

    let mut progress = match source.store.get_scan_progress(&source.name, zoom).await {
        Ok(progress) => progress.unwrap_or_else(|| ScanProgress::fresh(&source.name, zoom)),
        Err(e) => {
            warn!(source = %source.name, zoom, error = %e, "failed to load scan progress");
            return ZoomOutcome::StoreFailed;
        }
    };

    match zoom_complete(source, zoom, expected).await {
        Ok(true) if progress.status == ScanStatus::Completed => return ZoomOutcome::Completed,
        Ok(_) => {}
        Err(e) => {
            warn!(source = %source.name, zoom, error = %e, "failed to count zoom coverage");
            return ZoomOutcome::StoreFailed;
        }
    }

    progress.status = ScanStatus::Active;
    roll_day(&mut progress);
    if let Err(e) = source.store.upsert_scan_progress(&progress).await {
        warn!(source = %source.name, zoom, error = %e, "failed to persist scan progress");
        return ZoomOutcome::StoreFailed;
    }
    info!(
        source = %source.name,
        zoom,
        tiles = expected,
        resume_x = progress.last_x,
        resume_y = progress.last_y,
        "scanning zoom"
    );

    let resume = (progress.last_x, progress.last_y);
    let mut since_flush = 0u64;

    for x in range.min_x..=range.max_x {
        for y in range.min_y..=range.max_y {
            // Resume strictly after the last persisted position; the last
            // tile itself is re-checked and skipped via the store.
            if (x as i64) < resume.0 || (x as i64 == resume.0 && (y as i64) < resume.1) {
                continue;
            }
            if cancel.is_cancelled() {
                progress.status = ScanStatus::Stopped;
                flush(source, &progress).await;
                return ZoomOutcome::Cancelled;
            }

            roll_day(&mut progress);
            if progress.tiles_today >= daily_limit as i64 {
                info!(
                    source = %source.name,
                    zoom,
                    tiles_today = progress.tiles_today,
                    "daily budget reached, waiting for the next UTC day"
                );
                flush(source, &progress).await;
                if !wait_for_next_day(cancel).await {
                    progress.status = ScanStatus::Stopped;
                    flush(source, &progress).await;
                    return ZoomOutcome::Cancelled;
                }
                roll_day(&mut progress);
            }

            let coord = TileCoord::new(zoom, x, y);
            match process_tile(source, coord, cancel).await {
                TileResult::Fetched => {
                    progress.tiles_today += 1;
                    let pace = jittered(pace_interval(daily_limit));
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            progress.last_x = x as i64;
                            progress.last_y = y as i64;
                            progress.status = ScanStatus::Stopped;
                            flush(source, &progress).await;
                            return ZoomOutcome::Cancelled;
                        }
                        _ = tokio::time::sleep(pace) => {}
                    }
                }
                TileResult::Skipped | TileResult::Missed => {}
                TileResult::Cancelled => {
                    progress.status = ScanStatus::Stopped;
                    flush(source, &progress).await;
                    return ZoomOutcome::Cancelled;
                }
                TileResult::Critical => {
                    flush(source, &progress).await;
                    return ZoomOutcome::Critical;
                }
                TileResult::Exhausted => {
                    progress.status = ScanStatus::SourceUnavailable;
                    flush(source, &progress).await;
                    return ZoomOutcome::Unavailable;
                }
                TileResult::StoreFailed => {
                    progress.status = ScanStatus::Error;
                    flush(source, &progress).await;
                    return ZoomOutcome::StoreFailed;
                }
            }

            progress.last_x = x as i64;
            progress.last_y = y as i64;
            since_flush += 1;
            if since_flush >= SCAN_PROGRESS_FLUSH_EVERY {
                since_flush = 0;
                flush(source, &progress).await;
            }
        }
    }

    progress.status = ScanStatus::Completed;
    progress.last_x = 0;
    progress.last_y = 0;
    flush(source, &progress).await;
    info!(source = %source.name, zoom, "zoom completed");
    ZoomOutcome::Completed
}

enum TileResult {
    /// Fetched and stored; counts toward the daily budget.
    Fetched,
    /// Already in the store or negatively cached.
    Skipped,
    /// Recorded as a permanent miss.
    Missed,
    Cancelled,
    Critical,
    Exhausted,
    StoreFailed,
}

async fn process_tile(
    source: &Arc<Source>,
    coord: TileCoord,
    cancel: &CancellationToken,
) -> TileResult {
    let stored = StoredCoord::from_xyz(coord);
    match source.store.get_tile(stored).await {
        Ok(Some(record)) if !record.data.is_empty() => return TileResult::Skipped,
        Ok(_) => {}
        Err(e) => {
            warn!(source = %source.name, tile = %coord, error = %e, "tile read failed");
            return TileResult::StoreFailed;
        }
    }
    match source.store.get_miss(stored).await {
        Ok(Some(_)) => return TileResult::Skipped,
        Ok(None) => {}
        Err(e) => {
            warn!(source = %source.name, tile = %coord, error = %e, "miss read failed");
            return TileResult::StoreFailed;
        }
    }

    let mut attempt = 1u32;
    loop {
        match engine::fetch_transcode_store(source, coord, &HeaderMap::new()).await {
            Ok(_) => return TileResult::Fetched,
            Err(FetchError::Store(e)) => {
                warn!(source = %source.name, tile = %coord, error = %e, "tile write failed");
                return TileResult::StoreFailed;
            }
            Err(FetchError::Miss(failure)) => match classify(&failure) {
                Outcome::Critical => {
                    engine::record_miss(source, stored, &failure).await;
                    return TileResult::Critical;
                }
                Outcome::Permanent => {
                    engine::record_miss(source, stored, &failure).await;
                    return TileResult::Missed;
                }
                Outcome::Transient => {
                    if failure.status == 429 {
                        warn!(
                            source = %source.name,
                            "upstream rate limit hit; daily_limit is likely set too high"
                        );
                    }
                    if attempt >= SCAN_MAX_RETRIES {
                        engine::record_miss(source, stored, &failure).await;
                        return TileResult::Exhausted;
                    }
                    attempt += 1;
                    let delay = jittered(backoff_delay(attempt));
                    warn!(
                        source = %source.name,
                        tile = %coord,
                        attempt,
                        delay_secs = delay.as_secs_f64(),
                        reason = failure.reason.as_str(),
                        "transient error, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return TileResult::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            },
        }
    }
}

async fn zoom_complete(
    source: &Source,
    zoom: u8,
    expected: i64,
) -> Result<bool, crate::store::StoreError> {
    let have =
        source.store.count_tiles(zoom).await? + source.store.count_misses(zoom).await?;
    Ok(have >= expected)
}

async fn flush(source: &Source, progress: &ScanProgress) {
    if let Err(e) = source.store.upsert_scan_progress(progress).await {
        warn!(source = %source.name, zoom = progress.zoom, error = %e, "progress flush failed");
    }
}

fn roll_day(progress: &mut ScanProgress) {
    let today = Utc::now().format("%Y-%m-%d").to_string();
    if progress.last_scan_date != today {
        progress.last_scan_date = today;
        progress.tiles_today = 0;
    }
}

/// True when a new UTC day arrived, false when cancelled while waiting.
async fn wait_for_next_day(cancel: &CancellationToken) -> bool {
    let now = Utc::now();
    let wait = (now + chrono::Duration::days(1))
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc() - now)
        .and_then(|d| d.to_std().ok())
        .unwrap_or(Duration::from_secs(3600));
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}

fn classify(failure: &FetchFailure) -> Outcome {
    match failure.reason {
        MissReason::FetchError => {
            let text = failure.details.to_ascii_lowercase();
            if text.contains("network") || text.contains("timeout") || text.contains("refused") {
                Outcome::Transient
            } else {
                Outcome::Permanent
            }
        }
        MissReason::HttpError => classify_status(failure.status),
        _ => Outcome::Permanent,
    }
}

fn classify_status(status: i64) -> Outcome {
    match status {
        401 | 403 => Outcome::Critical,
        204 | 400 | 404 => Outcome::Permanent,
        429 | 500 | 502 | 503 | 504 => Outcome::Transient,
        _ => Outcome::Permanent,
    }
}

/// Target spacing between successful fetches for the daily rate budget.
fn pace_interval(daily_limit: u64) -> Duration {
    Duration::from_secs_f64(86_400.0 / daily_limit.max(1) as f64)
}

/// `2.5^(attempt-2)` seconds, capped at four hours.
fn backoff_delay(attempt: u32) -> Duration {
    let secs = 2.5f64
        .powi(attempt as i32 - 2)
        .min(SCAN_BACKOFF_CAP_SECS);
    Duration::from_secs_f64(secs)
}

fn jittered(base: Duration) -> Duration {
    let factor = rand::rng().random_range(0.8..1.2);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::store::TileStore;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn status_classification_buckets() {
        assert_eq!(classify_status(401), Outcome::Critical);
        assert_eq!(classify_status(403), Outcome::Critical);
        for status in [204, 400, 404] {
            assert_eq!(classify_status(status), Outcome::Permanent);
        }
        for status in [429, 500, 502, 503, 504] {
            assert_eq!(classify_status(status), Outcome::Transient);
        }
        // Anything else is permanent.
        assert_eq!(classify_status(418), Outcome::Permanent);
        assert_eq!(classify_status(301), Outcome::Permanent);
    }

    #[test]
    fn network_errors_classify_by_message_text() {
        let failure = |details: &str| FetchFailure {
            reason: MissReason::FetchError,
            details: details.to_string(),
            status: 500,
            capture: None,
        };
        assert_eq!(classify(&failure("connection timeout")), Outcome::Transient);
        assert_eq!(classify(&failure("Connection REFUSED")), Outcome::Transient);
        assert_eq!(classify(&failure("network unreachable")), Outcome::Transient);
        assert_eq!(classify(&failure("tls handshake broken")), Outcome::Permanent);
    }

    #[test]
    fn codec_failures_never_retry() {
        for reason in [
            MissReason::LercDecodeError,
            MissReason::ImageProcessingError,
            MissReason::WebpConversionError,
            MissReason::InvalidContentType,
            MissReason::ArcgisNodata,
            MissReason::ArcgisHtmlError,
        ] {
            let failure = FetchFailure {
                reason,
                details: String::new(),
                status: 500,
                capture: None,
            };
            assert_eq!(classify(&failure), Outcome::Permanent);
        }
    }

    #[test]
    fn backoff_grows_geometrically_and_caps_at_four_hours() {
        assert!((backoff_delay(2).as_secs_f64() - 1.0).abs() < 1e-9);
        assert!((backoff_delay(3).as_secs_f64() - 2.5).abs() < 1e-9);
        assert!((backoff_delay(4).as_secs_f64() - 6.25).abs() < 1e-9);
        assert_eq!(backoff_delay(100).as_secs_f64(), SCAN_BACKOFF_CAP_SECS);
    }

    #[test]
    fn pace_interval_matches_the_daily_budget() {
        assert_eq!(pace_interval(86_400), Duration::from_secs(1));
        assert_eq!(pace_interval(8_640_000), Duration::from_millis(10));
        // A zero limit must not divide by zero.
        assert_eq!(pace_interval(0), Duration::from_secs(86_400));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let j = jittered(base).as_secs_f64();
            assert!((8.0..12.0).contains(&j), "jittered to {j}");
        }
    }

    type UpstreamFn = Arc<dyn Fn(u64) -> (u16, &'static str, Vec<u8>) + Send + Sync + 'static>;

    async fn spawn_upstream(
        behavior: UpstreamFn,
    ) -> (SocketAddr, Arc<AtomicUsize>, tokio::task::JoinHandle<()>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_inner = hits.clone();
        let app = axum::Router::new().route(
            "/tiles/{z}/{x}/{y}",
            axum::routing::get(move || {
                let behavior = behavior.clone();
                let hits = hits_inner.clone();
                async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst) as u64;
                    let (status, content_type, body) = behavior(n);
                    axum::response::Response::builder()
                        .status(status)
                        .header("content-type", content_type)
                        .body(axum::body::Body::from(body))
                        .expect("response")
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        (addr, hits, handle)
    }

    /// One tile per zoom: a pinpoint bounds rectangle.
    async fn make_source(addr: SocketAddr, extra_yaml: &str) -> (tempfile::TempDir, Arc<Source>) {
        let yaml = format!(
            r#"
path: /t/:z/:x/:y
target: "http://{addr}/tiles/{{z}}/{{x}}/{{y}}"
minzoom: 2
maxzoom: 3
autoscan:
  enabled: true
  daily_limit: 8640000
  bounds: "13.37,52.51,13.38,52.52"
{extra_yaml}
"#
        );
        let config: SourceConfig = serde_yaml::from_str(&yaml).expect("config");
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TileStore::open(&dir.path().join("t.mbtiles"))
            .await
            .expect("open");
        let source = Arc::new(Source::new("scan-test", config, store).expect("source"));
        (dir, source)
    }

    #[tokio::test]
    async fn full_walk_stores_tiles_and_completes_each_zoom() {
        let (addr, hits, server) =
            spawn_upstream(Arc::new(|_| (200, "image/png", b"TILE".to_vec()))).await;
        let (_dir, source) = make_source(addr, "").await;

        run(source.clone(), CancellationToken::new()).await;

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(source.store.count_tiles(2).await.expect("count"), 1);
        assert_eq!(source.store.count_tiles(3).await.expect("count"), 1);
        for zoom in [2u8, 3] {
            let progress = source
                .store
                .get_scan_progress("scan-test", zoom)
                .await
                .expect("get")
                .expect("present");
            assert_eq!(progress.status, ScanStatus::Completed);
            assert_eq!(progress.tiles_today, 1);
        }
        server.abort();
    }

    #[tokio::test]
    async fn rerun_skips_already_scanned_tiles() {
        let (addr, hits, server) =
            spawn_upstream(Arc::new(|_| (200, "image/png", b"TILE".to_vec()))).await;
        let (_dir, source) = make_source(addr, "").await;

        run(source.clone(), CancellationToken::new()).await;
        run(source.clone(), CancellationToken::new()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        server.abort();
    }

    #[tokio::test]
    async fn forbidden_upstream_stops_every_zoom() {
        let (addr, hits, server) =
            spawn_upstream(Arc::new(|_| (403, "text/plain", b"denied".to_vec()))).await;
        let (_dir, source) = make_source(addr, "").await;

        run(source.clone(), CancellationToken::new()).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        for zoom in [2u8, 3] {
            let progress = source
                .store
                .get_scan_progress("scan-test", zoom)
                .await
                .expect("get");
            // Zoom 2 was active when the 403 arrived; both end critical.
            assert_eq!(
                progress.expect("present").status,
                ScanStatus::CriticalError,
                "zoom {zoom}"
            );
        }

        // A restart resets critical zooms back to waiting.
        startup_reset(&source).await.expect("reset");
        let progress = source
            .store
            .get_scan_progress("scan-test", 2)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(progress.status, ScanStatus::Waiting);
        server.abort();
    }

    #[tokio::test]
    async fn not_found_counts_toward_completion() {
        let (addr, _hits, server) =
            spawn_upstream(Arc::new(|_| (404, "text/plain", b"nope".to_vec()))).await;
        let (_dir, source) = make_source(addr, "").await;

        run(source.clone(), CancellationToken::new()).await;

        assert_eq!(source.store.count_tiles(2).await.expect("count"), 0);
        assert_eq!(source.store.count_misses(2).await.expect("count"), 1);
        let progress = source
            .store
            .get_scan_progress("scan-test", 2)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(progress.status, ScanStatus::Completed);
        server.abort();
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let (addr, hits, server) = spawn_upstream(Arc::new(|n| {
            if n == 0 {
                (503, "text/plain", b"busy".to_vec())
            } else {
                (200, "image/png", b"TILE".to_vec())
            }
        }))
        .await;
        let (_dir, source) = make_source(addr, "").await;

        run(source.clone(), CancellationToken::new()).await;

        // First fetch got a 503 and was retried after one backoff step.
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(source.store.count_tiles(2).await.expect("count"), 1);
        assert_eq!(source.store.count_tiles(3).await.expect("count"), 1);
        server.abort();
    }

    #[tokio::test]
    async fn completed_zoom_with_regressed_counts_resets_to_waiting() {
        let (addr, _hits, server) =
            spawn_upstream(Arc::new(|_| (200, "image/png", b"TILE".to_vec()))).await;
        let (_dir, source) = make_source(addr, "").await;

        run(source.clone(), CancellationToken::new()).await;

        // Simulate external data loss.
        sqlx::query("DELETE FROM tiles WHERE zoom_level = 2")
            .execute(source.store.pool())
            .await
            .expect("delete");
        startup_reset(&source).await.expect("reset");

        let progress = source
            .store
            .get_scan_progress("scan-test", 2)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(progress.status, ScanStatus::Waiting);
        let progress = source
            .store
            .get_scan_progress("scan-test", 3)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(progress.status, ScanStatus::Completed);
        server.abort();
    }

    #[tokio::test]
    async fn pre_cancelled_token_stops_immediately() {
        let (addr, hits, server) =
            spawn_upstream(Arc::new(|_| (200, "image/png", b"TILE".to_vec()))).await;
        let (_dir, source) = make_source(addr, "").await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        run(source.clone(), cancel).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        server.abort();
    }
}
