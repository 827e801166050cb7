use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use image::RgbaImage;
use strata_shared::StoredCoord;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec::{raster, terrain, webp};
use crate::config::OutputFormatType;
use crate::state::Source;
use crate::store::Generated;

const SCHEDULE_POLL: Duration = Duration::from_secs(60);

/// Daily scheduler: once a minute, compare the UTC clock against the
/// configured `HH:MM` slot and run at most one pass per UTC day.
pub async fn run(source: Arc<Source>, cancel: CancellationToken) {
    let Some(schedule) = parse_schedule(&source.config.gap_filling.schedule.time) else {
        warn!(
            source = %source.name,
            time = %source.config.gap_filling.schedule.time,
            "invalid gap-filling schedule, reconstructor disabled"
        );
        return;
    };
    info!(
        source = %source.name,
        hour = schedule.0,
        minute = schedule.1,
        "reconstructor scheduled"
    );

    let mut ticker = tokio::time::interval(SCHEDULE_POLL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let last_run = *source.reconstructor.last_run.read().await;
        if !due(Utc::now(), schedule, last_run) {
            continue;
        }
        if source
            .reconstructor
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            continue;
        }
        *source.reconstructor.last_run.write().await = Some(Utc::now());
        run_pass(&source, &cancel).await;
        source.reconstructor.running.store(false, Ordering::SeqCst);
    }
}

/// Manual start from the admin surface. Returns false when a pass is
/// already in flight.
pub fn try_start(source: Arc<Source>) -> bool {
    if source
        .reconstructor
        .running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return false;
    }
    tokio::spawn(async move {
        *source.reconstructor.last_run.write().await = Some(Utc::now());
        run_pass(&source, &CancellationToken::new()).await;
        source.reconstructor.running.store(false, Ordering::SeqCst);
    });
    true
}

pub fn parse_schedule(time: &str) -> Option<(u32, u32)> {
    let (hour, minute) = time.split_once(':')?;
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;
    (hour < 24 && minute < 60).then_some((hour, minute))
}

fn due(now: DateTime<Utc>, schedule: (u32, u32), last_run: Option<DateTime<Utc>>) -> bool {
    if now.hour() != schedule.0 || now.minute() != schedule.1 {
        return false;
    }
    last_run.is_none_or(|t| t.date_naive() < now.date_naive())
}

/// One full pass, top of the pyramid last. Safe to re-enter after a crash
/// because candidates and misses are persisted rows.
pub async fn run_pass(source: &Source, cancel: &CancellationToken) {
    let minzoom = source.config.minzoom;
    let maxzoom = source.config.maxzoom;
    if maxzoom == 0 || minzoom >= maxzoom {
        return;
    }
    info!(source = %source.name, "reconstructor pass started");
    let mut regenerated = 0u64;
    let mut converted = 0u64;
    let mut placeholders = 0u64;

    for zoom in (minzoom..maxzoom).rev() {
        if cancel.is_cancelled() {
            break;
        }

        // Stale parents first.
        match source.store.candidates_at_zoom(zoom).await {
            Ok(candidates) => {
                for parent in candidates {
                    if cancel.is_cancelled() {
                        break;
                    }
                    match compose_parent(source, parent).await {
                        Ok(true) => regenerated += 1,
                        Ok(false) => {}
                        Err(e) => {
                            warn!(source = %source.name, zoom, error = %e, "candidate regeneration failed")
                        }
                    }
                }
            }
            Err(e) => warn!(source = %source.name, zoom, error = %e, "candidate listing failed"),
        }

        // Misses become generated tiles whenever at least one child exists,
        // whatever the recorded failure was.
        match source.store.misses_at_zoom(zoom).await {
            Ok(misses) => {
                for parent in misses {
                    if cancel.is_cancelled() {
                        break;
                    }
                    match compose_parent(source, parent).await {
                        Ok(true) => converted += 1,
                        Ok(false) => {}
                        Err(e) => {
                            warn!(source = %source.name, zoom, error = %e, "miss conversion failed")
                        }
                    }
                }
            }
            Err(e) => warn!(source = %source.name, zoom, error = %e, "miss listing failed"),
        }

        // Seed the next level down with placeholders for child clusters
        // whose parent row does not exist yet.
        match source.store.orphan_parents(zoom).await {
            Ok(orphans) => {
                for parent in orphans {
                    if parent.z < minzoom {
                        continue;
                    }
                    match source.store.mark_parent_candidate(parent).await {
                        Ok(true) => placeholders += 1,
                        Ok(false) => {}
                        Err(e) => {
                            warn!(source = %source.name, zoom, error = %e, "placeholder insert failed")
                        }
                    }
                }
            }
            Err(e) => warn!(source = %source.name, zoom, error = %e, "orphan listing failed"),
        }
    }

    info!(
        source = %source.name,
        regenerated,
        converted,
        placeholders,
        "reconstructor pass finished"
    );
}

/// Compose a parent from its four children. Returns Ok(false) when no child
/// provides data; the parent stays as it was.
async fn compose_parent(
    source: &Source,
    parent: StoredCoord,
) -> Result<bool, crate::store::StoreError> {
    let children = source.store.children_data(parent).await?;
    let decoded: [Option<RgbaImage>; 4] = children.map(|slot| {
        slot.and_then(|data| match raster::decode(&data) {
            Ok(img) => Some(img),
            Err(e) => {
                warn!(source = %source.name, error = %e, "undecodable child, using transparent fill");
                None
            }
        })
    });
    if decoded.iter().all(Option::is_none) {
        return Ok(false);
    }

    let canvas = match raster::combine(&decoded) {
        Ok(canvas) => canvas,
        Err(_) => return Ok(false),
    };
    let gap = &source.config.gap_filling;
    let (child_w, child_h) = (canvas.width() / 2, canvas.height() / 2);
    let parent_img = match source.config.terrain_encoding() {
        Some(encoding) => {
            terrain::downsample(&canvas, encoding, gap.terrain_method, child_w).unwrap_or_else(
                || raster::resize(&canvas, child_w, child_h, gap.raster_method),
            )
        }
        None => raster::resize(&canvas, child_w, child_h, gap.raster_method),
    };

    let bytes = match gap.output_format.format {
        OutputFormatType::Png => match raster::encode_png(&parent_img) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(source = %source.name, error = %e, "parent encode failed");
                return Ok(false);
            }
        },
        OutputFormatType::Webp => {
            match webp::encode(&parent_img, true, 100.0, gap.output_format.effort) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(source = %source.name, error = %e, "parent encode failed");
                    return Ok(false);
                }
            }
        }
    };

    source
        .store
        .put_tile(parent, &bytes, Generated::Reconstructed)
        .await?;
    if let Some(grandparent) = parent.parent() {
        source.store.mark_parent_candidate(grandparent).await?;
    }
    Ok(true)
}
