use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};

use crate::codec::lerc::{BaselineDecoder, LercDecoder};
use crate::codec::{CodecError, raster};
use crate::config::SourceConfig;
use crate::store::TileStore;
use crate::upstream::{UpstreamClient, UpstreamError};

#[derive(Debug, thiserror::Error)]
pub enum SourceInitError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("failed to bake error tile: {0}")]
    ErrorTile(#[from] CodecError),
}

/// Reconstructor bookkeeping shared between the scheduler task and the
/// admin endpoints.
#[derive(Debug, Default)]
pub struct ReconstructorState {
    pub running: AtomicBool,
    pub last_run: RwLock<Option<DateTime<Utc>>>,
}

/// Everything one configured source owns: its store, its upstream client,
/// its single-flight lock table and its reconstructor state. Held behind a
/// registry keyed by source name; there are no process-wide singletons
/// beyond the logger.
pub struct Source {
    pub name: String,
    pub config: SourceConfig,
    pub store: TileStore,
    pub upstream: UpstreamClient,
    pub lerc: Arc<dyn LercDecoder>,
    pub error_tile: Bytes,
    pub reconstructor: ReconstructorState,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Source {
    pub fn new(
        name: &str,
        config: SourceConfig,
        store: TileStore,
    ) -> Result<Self, SourceInitError> {
        let upstream = UpstreamClient::new(&config)?;
        let error_tile = Bytes::from(raster::error_tile(config.metadata.tile_size)?);
        Ok(Self {
            name: name.to_string(),
            config,
            store,
            upstream,
            lerc: Arc::new(BaselineDecoder),
            error_tile,
            reconstructor: ReconstructorState::default(),
            locks: DashMap::new(),
        })
    }

    /// Per-key single-flight primitive. Entries are lazily created and kept
    /// for the process lifetime; the table is bounded by the working set.
    pub fn tile_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    pub fn lock_table_len(&self) -> usize {
        self.locks.len()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub sources: Arc<HashMap<String, Arc<Source>>>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(sources: HashMap<String, Arc<Source>>) -> Self {
        Self {
            sources: Arc::new(sources),
            started_at: Utc::now(),
        }
    }

    pub fn source(&self, name: &str) -> Option<Arc<Source>> {
        self.sources.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_source() -> SourceConfig {
        serde_yaml::from_str(
            r#"
path: /t/:z/:x/:y
target: https://up.example/{z}/{x}/{y}.png
"#,
        )
        .expect("source config")
    }

    #[tokio::test]
    async fn tile_locks_are_shared_per_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TileStore::open(&dir.path().join("s.mbtiles"))
            .await
            .expect("open");
        let source = Source::new("demo", minimal_source(), store).expect("source");

        let a = source.tile_lock("3/1/2");
        let b = source.tile_lock("3/1/2");
        let c = source.tile_lock("3/1/3");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(source.lock_table_len(), 2);
    }

    #[tokio::test]
    async fn error_tile_is_prebaked_png() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TileStore::open(&dir.path().join("s.mbtiles"))
            .await
            .expect("open");
        let source = Source::new("demo", minimal_source(), store).expect("source");
        let img = raster::decode(&source.error_tile).expect("decode");
        assert_eq!(img.dimensions(), (256, 256));
    }
}
