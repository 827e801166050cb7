use std::io::Read as _;

use bytes::Bytes;
use chrono::Utc;
use reqwest::header::HeaderMap;
use strata_shared::{StoredCoord, TileCoord};
use tracing::{debug, warn};

use crate::codec::lerc::{self, Decoded};
use crate::codec::{raster, terrain, webp};
use crate::config::{DownsampleMethod, RasterMethod, SourceConfig, SourceFormat};
use crate::state::Source;
use crate::store::{Generated, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Gen,
    Regen,
    Miss,
    Error,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Gen => "GEN",
            Self::Regen => "REGEN",
            Self::Miss => "MISS",
            Self::Error => "ERROR",
        }
    }

    fn from_generated(generated: Generated) -> Self {
        match generated {
            Generated::Origin => Self::Hit,
            Generated::Reconstructed => Self::Gen,
            Generated::Candidate => Self::Regen,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    HttpError,
    InvalidContentType,
    ArcgisHtmlError,
    ArcgisNodata,
    LercDecodeError,
    ImageProcessingError,
    WebpConversionError,
    FetchError,
}

impl MissReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HttpError => "http_error",
            Self::InvalidContentType => "invalid_content_type",
            Self::ArcgisHtmlError => "arcgis_html_error",
            Self::ArcgisNodata => "arcgis_nodata",
            Self::LercDecodeError => "lerc_decode_error",
            Self::ImageProcessingError => "image_processing_error",
            Self::WebpConversionError => "webp_conversion_error",
            Self::FetchError => "fetch_error",
        }
    }
}

/// Synthetic status recorded when there is no upstream HTTP code to keep.
pub const SYNTHETIC_STATUS: i64 = 500;

/// A failed fetch in miss-taxonomy terms: what to record and, for forensic
/// inspection, the upstream body when it is worth keeping.
#[derive(Debug)]
pub struct FetchFailure {
    pub reason: MissReason,
    pub details: String,
    pub status: i64,
    pub capture: Option<Bytes>,
}

/// Errors out of the shared fetch path. Store failures are logged rather
/// than recorded as misses; the next scan or request retries them.
#[derive(Debug)]
pub enum FetchError {
    Miss(FetchFailure),
    Store(StoreError),
}

#[derive(Debug)]
pub struct TileReply {
    pub cache_status: CacheStatus,
    /// `None` is a negative outcome: 204 or the debug error tile.
    pub body: Option<Bytes>,
    pub content_type: &'static str,
}

impl TileReply {
    fn negative() -> Self {
        Self {
            cache_status: CacheStatus::Error,
            body: None,
            content_type: "",
        }
    }

    fn cached(status: CacheStatus, body: Vec<u8>, content_type: &'static str) -> Self {
        Self {
            cache_status: status,
            body: Some(Bytes::from(body)),
            content_type,
        }
    }
}

/// The on-demand read path: store read, negative-cache check, per-key
/// single-flight, upstream fetch, transcode, store write.
pub async fn serve(source: &Source, coord: TileCoord, passthrough: &HeaderMap) -> TileReply {
    let stored = StoredCoord::from_xyz(coord);
    let content_type = source.config.content_type();

    match source.store.get_tile(stored).await {
        Ok(Some(record)) if !record.data.is_empty() => {
            return TileReply::cached(
                CacheStatus::from_generated(record.generated),
                record.data,
                content_type,
            );
        }
        Ok(_) => {}
        Err(e) => {
            warn!(source = %source.name, tile = %coord, error = %e, "tile read failed");
            return TileReply::negative();
        }
    }

    // Zooms below the upstream's real coverage are reconstructor-only.
    if let Some(real_minzoom) = source.config.gap_filling.source_real_minzoom {
        if coord.z < real_minzoom {
            return TileReply::negative();
        }
    }

    if check_fresh_miss(source, stored).await {
        return TileReply::negative();
    }

    let lock = source.tile_lock(&coord.to_string());
    let _guard = lock.lock().await;

    // Double-checked: the winner of the lock race has already filled the
    // store (or recorded a fresh miss) for everyone queued behind it.
    match source.store.get_tile(stored).await {
        Ok(Some(record)) if !record.data.is_empty() => {
            return TileReply::cached(
                CacheStatus::from_generated(record.generated),
                record.data,
                content_type,
            );
        }
        Ok(_) => {}
        Err(e) => {
            warn!(source = %source.name, tile = %coord, error = %e, "tile re-read failed");
            return TileReply::negative();
        }
    }
    if check_fresh_miss(source, stored).await {
        return TileReply::negative();
    }

    match fetch_transcode_store(source, coord, passthrough).await {
        Ok(body) => {
            debug!(source = %source.name, tile = %coord, bytes = body.len(), "fetched and stored");
            TileReply {
                cache_status: CacheStatus::Miss,
                body: Some(Bytes::from(body)),
                content_type,
            }
        }
        Err(FetchError::Miss(failure)) => {
            record_miss(source, stored, &failure).await;
            TileReply::negative()
        }
        Err(FetchError::Store(e)) => {
            warn!(source = %source.name, tile = %coord, error = %e, "tile write failed");
            TileReply::negative()
        }
    }
}

/// Fetch one tile from upstream, run the transcoding pipeline, store the
/// result with `generated=0` and mark the parent. Shared by the engine and
/// the background scanner; miss recording is the caller's policy.
pub async fn fetch_transcode_store(
    source: &Source,
    coord: TileCoord,
    passthrough: &HeaderMap,
) -> Result<Vec<u8>, FetchError> {
    let stored = StoredCoord::from_xyz(coord);

    let response = match source.upstream.get(coord, passthrough).await {
        Ok(response) => response,
        Err(e) => {
            return Err(FetchError::Miss(FetchFailure {
                reason: MissReason::FetchError,
                details: e.to_string(),
                status: SYNTHETIC_STATUS,
                capture: None,
            }));
        }
    };

    if !response.is_success() {
        return Err(FetchError::Miss(FetchFailure {
            reason: MissReason::HttpError,
            details: format!("upstream returned {}", response.status),
            status: response.status as i64,
            capture: Some(response.body.clone()),
        }));
    }

    let body = validate_and_transcode(source, &response).map_err(FetchError::Miss)?;

    source
        .store
        .put_tile(stored, &body, Generated::Origin)
        .await
        .map_err(FetchError::Store)?;
    notify_child_written(source, stored).await;
    Ok(body)
}

/// True when a miss exists and is still inside `miss_timeout`. Stale rows
/// are deleted inline so the fetch below can retry.
async fn check_fresh_miss(source: &Source, stored: StoredCoord) -> bool {
    match source.store.get_miss(stored).await {
        Ok(Some(miss)) => {
            let cutoff = Utc::now() - source.config.miss_timeout();
            if miss.ts > cutoff.timestamp() {
                true
            } else {
                if let Err(e) = source.store.delete_miss(stored).await {
                    warn!(source = %source.name, error = %e, "failed to drop stale miss");
                }
                false
            }
        }
        Ok(None) => false,
        Err(e) => {
            warn!(source = %source.name, error = %e, "miss read failed");
            false
        }
    }
}

pub async fn record_miss(source: &Source, stored: StoredCoord, failure: &FetchFailure) {
    debug!(
        source = %source.name,
        z = stored.z,
        x = stored.x,
        row = stored.row,
        reason = failure.reason.as_str(),
        status = failure.status,
        "recording miss"
    );
    if let Err(e) = source
        .store
        .record_miss(
            stored,
            failure.reason.as_str(),
            &failure.details,
            failure.status,
            failure.capture.as_deref(),
            source.config.miss_max_records,
        )
        .await
    {
        warn!(source = %source.name, error = %e, "failed to record miss");
    }
}

/// Mark the parent as a regeneration candidate after a new child landed.
pub async fn notify_child_written(source: &Source, stored: StoredCoord) {
    if !source.config.gap_filling.enabled {
        return;
    }
    if let Some(parent) = stored.parent() {
        if let Err(e) = source.store.mark_parent_candidate(parent).await {
            warn!(source = %source.name, error = %e, "failed to mark parent candidate");
        }
    }
}

/// Content validation plus the configured transcoding pipeline.
fn validate_and_transcode(
    source: &Source,
    response: &crate::upstream::UpstreamResponse,
) -> Result<Vec<u8>, FetchFailure> {
    let config = &source.config;
    let upstream_status = response.status as i64;

    let mut body: Vec<u8>;
    if config.source_format == SourceFormat::Lerc {
        if response.is_html() {
            return Err(FetchFailure {
                reason: MissReason::ArcgisHtmlError,
                details: "upstream answered with an HTML page".into(),
                status: upstream_status,
                capture: Some(response.body.clone()),
            });
        }
        let grid = match source.lerc.decode(&response.body) {
            Ok(Decoded::Grid(grid)) => grid,
            Ok(Decoded::Empty) => {
                return Err(FetchFailure {
                    reason: MissReason::ArcgisNodata,
                    details: "blob reports zero valid pixels".into(),
                    status: upstream_status,
                    capture: None,
                });
            }
            Err(e) => {
                return Err(FetchFailure {
                    reason: MissReason::LercDecodeError,
                    details: e.to_string(),
                    status: SYNTHETIC_STATUS,
                    capture: None,
                });
            }
        };
        body = lerc::terrain_rgb_png(&grid).map_err(|e| FetchFailure {
            reason: MissReason::LercDecodeError,
            details: e.to_string(),
            status: SYNTHETIC_STATUS,
            capture: None,
        })?;
    } else {
        if !response.is_image() {
            return Err(FetchFailure {
                reason: MissReason::InvalidContentType,
                details: format!(
                    "expected image/*, got {}",
                    response.content_type.as_deref().unwrap_or("none")
                ),
                status: upstream_status,
                capture: Some(response.body.clone()),
            });
        }
        body = response.body.to_vec();
    }

    if body.starts_with(&[0x1f, 0x8b]) {
        let mut inflated = Vec::new();
        let mut decoder = flate2::read::GzDecoder::new(body.as_slice());
        decoder
            .read_to_end(&mut inflated)
            .map_err(|e| FetchFailure {
                reason: MissReason::ImageProcessingError,
                details: format!("gzip inflate failed: {e}"),
                status: SYNTHETIC_STATUS,
                capture: None,
            })?;
        body = inflated;
    }

    if config.downsample_config.enabled {
        body = downsample_body(config, body)?;
    }

    if let Some(webp_config) = &config.webp_config {
        if !webp::is_webp(&body) {
            let img = raster::decode(&body).map_err(|e| FetchFailure {
                reason: MissReason::WebpConversionError,
                details: e.to_string(),
                status: SYNTHETIC_STATUS,
                capture: None,
            })?;
            body = webp::encode(
                &img,
                webp_config.lossless,
                webp_config.quality,
                webp_config.effort,
            )
            .map_err(|e| FetchFailure {
                reason: MissReason::WebpConversionError,
                details: e.to_string(),
                status: SYNTHETIC_STATUS,
                capture: None,
            })?;
        }
    }

    Ok(body)
}

fn downsample_body(config: &SourceConfig, body: Vec<u8>) -> Result<Vec<u8>, FetchFailure> {
    let was_webp = webp::is_webp(&body);
    let img = raster::decode(&body).map_err(|e| FetchFailure {
        reason: MissReason::ImageProcessingError,
        details: e.to_string(),
        status: SYNTHETIC_STATUS,
        capture: None,
    })?;

    let target = config.downsample_config.target_size;
    let reduced = match config.terrain_encoding() {
        Some(encoding) => {
            match terrain::downsample(&img, encoding, config.downsample_config.method, target) {
                Some(reduced) => reduced,
                None => return Ok(body),
            }
        }
        None => {
            if target == 0 || target >= img.width() {
                return Ok(body);
            }
            let method = match config.downsample_config.method {
                DownsampleMethod::Nearest => RasterMethod::Nearest,
                DownsampleMethod::Average | DownsampleMethod::Maximum => RasterMethod::Linear,
            };
            raster::resize(&img, target, target, method)
        }
    };

    // The codec works in PNG space; re-encode WebP only when the upstream
    // payload was WebP and no explicit conversion step follows.
    if was_webp && config.webp_config.is_none() {
        webp::encode(&reduced, true, 100.0, crate::config::DEFAULT_WEBP_EFFORT).map_err(|e| {
            FetchFailure {
                reason: MissReason::WebpConversionError,
                details: e.to_string(),
                status: SYNTHETIC_STATUS,
                capture: None,
            }
        })
    } else {
        raster::encode_png(&reduced).map_err(|e| FetchFailure {
            reason: MissReason::ImageProcessingError,
            details: e.to_string(),
            status: SYNTHETIC_STATUS,
            capture: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::lerc::encode_test_blob;
    use crate::config::SourceConfig;
    use crate::state::Source;
    use crate::store::TileStore;
    use image::{Rgba, RgbaImage};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strata_shared::TerrainEncoding;

    type UpstreamFn = Arc<dyn Fn() -> (u16, &'static str, Vec<u8>) + Send + Sync + 'static>;

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
                    hits.fetch_add(1, Ordering::SeqCst);
                    // Small delay widens the single-flight race window.
                    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                    let (status, content_type, body) = behavior();
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

    async fn make_source(addr: SocketAddr, extra_yaml: &str) -> (tempfile::TempDir, Arc<Source>) {
        let yaml = format!(
            r#"
path: /t/:z/:x/:y
target: "http://{addr}/tiles/{{z}}/{{x}}/{{y}}"
{extra_yaml}
"#
        );
        let config: SourceConfig = serde_yaml::from_str(&yaml).expect("config");
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TileStore::open(&dir.path().join("t.mbtiles"))
            .await
            .expect("open");
        let source = Arc::new(Source::new("demo", config, store).expect("source"));
        (dir, source)
    }

    fn png_bytes(size: u32, rgba: [u8; 4]) -> Vec<u8> {
        raster::encode_png(&RgbaImage::from_pixel(size, size, Rgba(rgba))).expect("png")
    }

    #[tokio::test]
    async fn miss_then_hit_stores_the_tile_under_its_tms_row() {
        let (addr, hits, server) =
            spawn_upstream(Arc::new(|| (200, "image/png", b"AAAA".to_vec()))).await;
        let (_dir, source) = make_source(addr, "").await;
        let coord = TileCoord::new(5, 10, 20);

        let reply = serve(&source, coord, &HeaderMap::new()).await;
        assert_eq!(reply.cache_status, CacheStatus::Miss);
        assert_eq!(reply.body.as_deref(), Some(b"AAAA".as_slice()));

        let reply = serve(&source, coord, &HeaderMap::new()).await;
        assert_eq!(reply.cache_status, CacheStatus::Hit);
        assert_eq!(reply.body.as_deref(), Some(b"AAAA".as_slice()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let record = source
            .store
            .get_tile(StoredCoord::new(5, 10, 11))
            .await
            .expect("get")
            .expect("stored");
        assert_eq!(record.data, b"AAAA");
        assert_eq!(record.generated, Generated::Origin);
        server.abort();
    }

    #[tokio::test]
    async fn negative_cache_short_circuits_until_it_expires() {
        let (addr, hits, server) =
            spawn_upstream(Arc::new(|| (404, "text/plain", b"gone".to_vec()))).await;
        let (_dir, source) = make_source(addr, "miss_timeout: 300").await;
        let coord = TileCoord::new(5, 10, 20);
        let stored = StoredCoord::from_xyz(coord);

        let reply = serve(&source, coord, &HeaderMap::new()).await;
        assert_eq!(reply.cache_status, CacheStatus::Error);
        assert!(reply.body.is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let miss = source
            .store
            .get_miss(stored)
            .await
            .expect("get")
            .expect("recorded");
        assert_eq!(miss.reason, "http_error");
        assert_eq!(miss.status, 404);
        assert_eq!(miss.response_body.as_deref(), Some(b"gone".as_slice()));

        // Fresh miss: upstream is not consulted again.
        let reply = serve(&source, coord, &HeaderMap::new()).await;
        assert_eq!(reply.cache_status, CacheStatus::Error);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Expire the miss and the engine retries upstream.
        sqlx::query("UPDATE misses SET ts = ts - 301")
            .execute(source.store.pool())
            .await
            .expect("backdate");
        let reply = serve(&source, coord, &HeaderMap::new()).await;
        assert_eq!(reply.cache_status, CacheStatus::Error);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        server.abort();
    }

    #[tokio::test]
    async fn concurrent_requests_coalesce_into_one_fetch() {
        let (addr, hits, server) =
            spawn_upstream(Arc::new(|| (200, "image/png", b"PIXELS".to_vec()))).await;
        let (_dir, source) = make_source(addr, "").await;
        let coord = TileCoord::new(7, 3, 4);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let source = source.clone();
            tasks.push(tokio::spawn(async move {
                serve(&source, coord, &HeaderMap::new()).await
            }));
        }
        for task in tasks {
            let reply = task.await.expect("join");
            assert_eq!(reply.body.as_deref(), Some(b"PIXELS".as_slice()));
            assert!(matches!(
                reply.cache_status,
                CacheStatus::Miss | CacheStatus::Hit
            ));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        server.abort();
    }

    #[tokio::test]
    async fn zooms_below_real_minzoom_never_reach_upstream() {
        let (addr, hits, server) =
            spawn_upstream(Arc::new(|| (200, "image/png", b"X".to_vec()))).await;
        let (_dir, source) = make_source(
            addr,
            "gap_filling:\n  enabled: true\n  source_real_minzoom: 8",
        )
        .await;

        let reply = serve(&source, TileCoord::new(5, 1, 1), &HeaderMap::new()).await;
        assert_eq!(reply.cache_status, CacheStatus::Error);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let reply = serve(&source, TileCoord::new(8, 1, 1), &HeaderMap::new()).await;
        assert_eq!(reply.cache_status, CacheStatus::Miss);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        server.abort();
    }

    #[tokio::test]
    async fn non_image_content_records_invalid_content_type() {
        let (addr, _hits, server) =
            spawn_upstream(Arc::new(|| (200, "text/plain", b"oops".to_vec()))).await;
        let (_dir, source) = make_source(addr, "").await;
        let coord = TileCoord::new(4, 2, 3);

        let reply = serve(&source, coord, &HeaderMap::new()).await;
        assert_eq!(reply.cache_status, CacheStatus::Error);
        let miss = source
            .store
            .get_miss(StoredCoord::from_xyz(coord))
            .await
            .expect("get")
            .expect("recorded");
        assert_eq!(miss.reason, "invalid_content_type");
        assert_eq!(miss.status, 200);
        server.abort();
    }

    #[tokio::test]
    async fn lerc_source_stores_terrain_rgb_png() {
        let blob = encode_test_blob(4, 4, 16, 6, &[123.4; 16]);
        let (addr, _hits, server) = spawn_upstream(Arc::new(move || {
            (200, "application/octet-stream", blob.clone())
        }))
        .await;
        let (_dir, source) = make_source(addr, "source_format: lerc").await;
        let coord = TileCoord::new(9, 100, 200);

        let reply = serve(&source, coord, &HeaderMap::new()).await;
        assert_eq!(reply.cache_status, CacheStatus::Miss);
        let img = raster::decode(reply.body.as_ref().expect("body")).expect("png");
        let p = img.get_pixel(2, 2);
        let decoded = TerrainEncoding::Mapbox.decode(p.0[0], p.0[1], p.0[2]);
        assert!((decoded - 123.4).abs() <= 0.05, "decoded {decoded}");
        server.abort();
    }

    #[tokio::test]
    async fn lerc_empty_and_html_map_to_their_miss_reasons() {
        let blob = encode_test_blob(4, 4, 0, 6, &[]);
        let (addr, _hits, server) = spawn_upstream(Arc::new(move || {
            (200, "application/octet-stream", blob.clone())
        }))
        .await;
        let (_dir, source) = make_source(addr, "source_format: lerc").await;
        let coord = TileCoord::new(9, 1, 1);
        serve(&source, coord, &HeaderMap::new()).await;
        let miss = source
            .store
            .get_miss(StoredCoord::from_xyz(coord))
            .await
            .expect("get")
            .expect("recorded");
        assert_eq!(miss.reason, "arcgis_nodata");
        server.abort();

        let (addr, _hits, server) = spawn_upstream(Arc::new(|| {
            (200, "text/html", b"<html>quota exceeded</html>".to_vec())
        }))
        .await;
        let (_dir, source) = make_source(addr, "source_format: lerc").await;
        let coord = TileCoord::new(9, 2, 2);
        serve(&source, coord, &HeaderMap::new()).await;
        let miss = source
            .store
            .get_miss(StoredCoord::from_xyz(coord))
            .await
            .expect("get")
            .expect("recorded");
        assert_eq!(miss.reason, "arcgis_html_error");
        assert!(miss.response_body.is_some());
        server.abort();
    }

    #[tokio::test]
    async fn malformed_lerc_records_decode_error() {
        let (addr, _hits, server) = spawn_upstream(Arc::new(|| {
            (200, "application/octet-stream", b"not lerc at all".to_vec())
        }))
        .await;
        let (_dir, source) = make_source(addr, "source_format: lerc").await;
        let coord = TileCoord::new(9, 3, 3);
        serve(&source, coord, &HeaderMap::new()).await;
        let miss = source
            .store
            .get_miss(StoredCoord::from_xyz(coord))
            .await
            .expect("get")
            .expect("recorded");
        assert_eq!(miss.reason, "lerc_decode_error");
        assert_eq!(miss.status, 500);
        server.abort();
    }

    #[tokio::test]
    async fn webp_conversion_rewrites_the_stored_payload() {
        let png = png_bytes(8, [10, 20, 30, 255]);
        let (addr, _hits, server) =
            spawn_upstream(Arc::new(move || (200, "image/png", png.clone()))).await;
        let (_dir, source) = make_source(
            addr,
            "webp_config:\n  lossless: true\nmetadata:\n  format: webp",
        )
        .await;
        let coord = TileCoord::new(6, 5, 5);

        let reply = serve(&source, coord, &HeaderMap::new()).await;
        assert_eq!(reply.cache_status, CacheStatus::Miss);
        assert_eq!(reply.content_type, "image/webp");
        let body = reply.body.expect("body");
        assert!(webp::is_webp(&body));

        let record = source
            .store
            .get_tile(StoredCoord::from_xyz(coord))
            .await
            .expect("get")
            .expect("stored");
        assert!(webp::is_webp(&record.data));
        server.abort();
    }

    #[tokio::test]
    async fn terrain_downsample_shrinks_the_fetched_tile() {
        let encoding = TerrainEncoding::Mapbox;
        let (r, g, b) = encoding.encode(500.0);
        let big = raster::encode_png(&RgbaImage::from_pixel(512, 512, Rgba([r, g, b, 255])))
            .expect("png");
        let (addr, _hits, server) =
            spawn_upstream(Arc::new(move || (200, "image/png", big.clone()))).await;
        let (_dir, source) = make_source(
            addr,
            "metadata:\n  encoding: mapbox\ndownsample_config:\n  enabled: true\n  target_size: 256\n  method: average",
        )
        .await;

        let reply = serve(&source, TileCoord::new(10, 0, 0), &HeaderMap::new()).await;
        assert_eq!(reply.cache_status, CacheStatus::Miss);
        let img = raster::decode(reply.body.as_ref().expect("body")).expect("png");
        assert_eq!(img.dimensions(), (256, 256));
        let p = img.get_pixel(100, 100);
        let decoded = encoding.decode(p.0[0], p.0[1], p.0[2]);
        assert!((decoded - 500.0).abs() <= 0.1, "decoded {decoded}");
        server.abort();
    }

    #[tokio::test]
    async fn fetch_failure_records_fetch_error() {
        // Point the source at a port nothing listens on.
        let addr: SocketAddr = "127.0.0.1:1".parse().expect("addr");
        let (_dir, source) = make_source(addr, "").await;
        let coord = TileCoord::new(3, 1, 1);

        let reply = serve(&source, coord, &HeaderMap::new()).await;
        assert_eq!(reply.cache_status, CacheStatus::Error);
        let miss = source
            .store
            .get_miss(StoredCoord::from_xyz(coord))
            .await
            .expect("get")
            .expect("recorded");
        assert_eq!(miss.reason, "fetch_error");
        assert_eq!(miss.status, 500);
    }

    #[tokio::test]
    async fn child_write_marks_the_parent_when_gap_filling_is_on() {
        let (addr, _hits, server) =
            spawn_upstream(Arc::new(|| (200, "image/png", b"CHILD".to_vec()))).await;
        let (_dir, source) = make_source(addr, "gap_filling:\n  enabled: true").await;
        let coord = TileCoord::new(6, 20, 24);
        let stored = StoredCoord::from_xyz(coord);

        serve(&source, coord, &HeaderMap::new()).await;
        let parent = stored.parent().expect("parent");
        let record = source
            .store
            .get_tile(parent)
            .await
            .expect("get")
            .expect("placeholder");
        assert_eq!(record.generated, Generated::Candidate);
        assert!(record.data.is_empty());
        server.abort();
    }
}
