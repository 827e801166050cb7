use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_SERVER_PORT: u16 = 7000;
pub const PROD_CONFIG_DIR: &str = "/configs";
pub const DEV_CONFIG_DIR: &str = "./configs-dev";

pub const DEFAULT_MISS_TIMEOUT_SECS: i64 = 300;
pub const DEFAULT_MISS_MAX_RECORDS: i64 = 10_000;
pub const DEFAULT_TILE_SIZE: u32 = 256;
pub const DEFAULT_MAXZOOM: u8 = 14;
pub const MAX_SUPPORTED_ZOOM: u8 = 30;
pub const DEFAULT_CACHE_MAX_AGE_HIT_SECS: u64 = 86_400;
pub const DEFAULT_CACHE_MAX_AGE_MISS_SECS: u64 = 300;
pub const DEFAULT_DAILY_LIMIT: u64 = 10_000;
pub const DEFAULT_WEBP_EFFORT: u8 = 4;
pub const DEFAULT_WEBP_QUALITY: f32 = 80.0;
pub const DEFAULT_DOWNSAMPLE_TARGET: u32 = 256;
pub const DEFAULT_GAP_SCHEDULE: &str = "03:00";

pub const UPSTREAM_POOL_SIZE: usize = 10;
pub const UPSTREAM_IDLE_TIMEOUT_SECS: u64 = 60;
pub const UPSTREAM_REQUEST_TIMEOUT_SECS: u64 = 15;
pub const UPSTREAM_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const UPSTREAM_RETRIES: u32 = 2;
pub const UPSTREAM_RETRY_INITIAL: Duration = Duration::from_millis(200);

pub const CHECKPOINT_INTERVAL_SECS: u64 = 15;
pub const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
pub const SCAN_PROGRESS_FLUSH_EVERY: u64 = 10;
pub const SCAN_MAX_RETRIES: u32 = 15;
pub const SCAN_BACKOFF_CAP_SECS: f64 = 4.0 * 3600.0;

pub fn server_port() -> u16 {
    std::env::var("PORT")
        .ok()
        .or_else(|| std::env::args().nth(1))
        .and_then(|value| value.parse::<u16>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_SERVER_PORT)
}

/// Config location: `CONFIG_PATH` wins, otherwise the `STRATA_ENV` mode
/// selects the production folder or the in-repo dev folder.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("CONFIG_PATH") {
        return PathBuf::from(path);
    }
    let env = std::env::var("STRATA_ENV").unwrap_or_default();
    if env.trim().eq_ignore_ascii_case("production") {
        PathBuf::from(PROD_CONFIG_DIR)
    } else {
        PathBuf::from(DEV_CONFIG_DIR)
    }
}

pub fn data_dir() -> PathBuf {
    std::env::var("DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    #[default]
    Png,
    Jpg,
    Webp,
    Lerc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownsampleMethod {
    #[default]
    Average,
    Nearest,
    Maximum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RasterMethod {
    Nearest,
    Linear,
    #[default]
    Cubic,
    Mitchell,
    Lanczos2,
    Lanczos3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormatType {
    #[default]
    Png,
    Webp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    #[serde(default)]
    pub bounds: Option<String>,
    #[serde(default)]
    pub center: Option<String>,
    #[serde(rename = "type", default = "default_layer_type")]
    pub layer_type: String,
    /// "" (plain raster), "mapbox" or "terrarium" (DEM).
    #[serde(default)]
    pub encoding: String,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(rename = "tileSize", default = "default_tile_size")]
    pub tile_size: u32,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            bounds: None,
            center: None,
            layer_type: default_layer_type(),
            encoding: String::new(),
            format: default_format(),
            tile_size: DEFAULT_TILE_SIZE,
        }
    }
}

fn default_layer_type() -> String {
    "baselayer".to_string()
}

fn default_format() -> String {
    "png".to_string()
}

fn default_tile_size() -> u32 {
    DEFAULT_TILE_SIZE
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaxAgeConfig {
    #[serde(default = "default_max_age_hit")]
    pub hit: u64,
    #[serde(default = "default_max_age_miss")]
    pub miss: u64,
}

impl Default for MaxAgeConfig {
    fn default() -> Self {
        Self {
            hit: DEFAULT_CACHE_MAX_AGE_HIT_SECS,
            miss: DEFAULT_CACHE_MAX_AGE_MISS_SECS,
        }
    }
}

fn default_max_age_hit() -> u64 {
    DEFAULT_CACHE_MAX_AGE_HIT_SECS
}

fn default_max_age_miss() -> u64 {
    DEFAULT_CACHE_MAX_AGE_MISS_SECS
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CacheControlConfig {
    #[serde(rename = "max-age", default)]
    pub max_age: MaxAgeConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ResponseHeadersConfig {
    #[serde(rename = "Cache-Control", default)]
    pub cache_control: CacheControlConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HeadersConfig {
    #[serde(default)]
    pub request: BTreeMap<String, String>,
    #[serde(default)]
    pub response: ResponseHeadersConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoscanConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u64,
    #[serde(default)]
    pub max_scan_zoom: Option<u8>,
    /// Scan bounds override, `"W,S,E,N"`; falls back to `metadata.bounds`.
    #[serde(default)]
    pub bounds: Option<String>,
}

impl Default for AutoscanConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            daily_limit: DEFAULT_DAILY_LIMIT,
            max_scan_zoom: None,
            bounds: None,
        }
    }
}

fn default_daily_limit() -> u64 {
    DEFAULT_DAILY_LIMIT
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebpConfig {
    #[serde(default)]
    pub lossless: bool,
    #[serde(default = "default_webp_effort")]
    pub effort: u8,
    #[serde(default = "default_webp_quality")]
    pub quality: f32,
}

fn default_webp_effort() -> u8 {
    DEFAULT_WEBP_EFFORT
}

fn default_webp_quality() -> f32 {
    DEFAULT_WEBP_QUALITY
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownsampleConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_downsample_target")]
    pub target_size: u32,
    #[serde(default)]
    pub method: DownsampleMethod,
}

impl Default for DownsampleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_size: DEFAULT_DOWNSAMPLE_TARGET,
            method: DownsampleMethod::default(),
        }
    }
}

fn default_downsample_target() -> u32 {
    DEFAULT_DOWNSAMPLE_TARGET
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputFormatConfig {
    #[serde(rename = "type", default)]
    pub format: OutputFormatType,
    #[serde(default = "default_webp_effort")]
    pub effort: u8,
}

impl Default for OutputFormatConfig {
    fn default() -> Self {
        Self {
            format: OutputFormatType::default(),
            effort: DEFAULT_WEBP_EFFORT,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_gap_schedule")]
    pub time: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            time: default_gap_schedule(),
        }
    }
}

fn default_gap_schedule() -> String {
    DEFAULT_GAP_SCHEDULE.to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GapFillingConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Zooms below this exist only as reconstructed tiles; the engine never
    /// fetches them from upstream.
    #[serde(default)]
    pub source_real_minzoom: Option<u8>,
    #[serde(default)]
    pub raster_method: RasterMethod,
    #[serde(default)]
    pub terrain_method: DownsampleMethod,
    #[serde(default)]
    pub output_format: OutputFormatConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Express-style route template, e.g. `/dem/:z/:x/:y`.
    pub path: String,
    /// Upstream URL template with `{z}`/`{x}`/`{y}` placeholders.
    pub target: String,
    #[serde(default)]
    pub minzoom: u8,
    #[serde(default = "default_maxzoom")]
    pub maxzoom: u8,
    #[serde(default)]
    pub mbtiles_file: Option<PathBuf>,
    #[serde(default = "default_miss_timeout")]
    pub miss_timeout: i64,
    #[serde(default = "default_miss_max_records")]
    pub miss_max_records: i64,
    #[serde(default)]
    pub source_format: SourceFormat,
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub headers: HeadersConfig,
    #[serde(default)]
    pub autoscan: AutoscanConfig,
    #[serde(default)]
    pub webp_config: Option<WebpConfig>,
    #[serde(default)]
    pub downsample_config: DownsampleConfig,
    #[serde(default)]
    pub gap_filling: GapFillingConfig,
    /// One-shot migration: delete tiles outside `metadata.bounds` on open.
    #[serde(default)]
    pub cleanup_out_of_bounds: bool,
}

fn default_maxzoom() -> u8 {
    DEFAULT_MAXZOOM
}

fn default_miss_timeout() -> i64 {
    DEFAULT_MISS_TIMEOUT_SECS
}

fn default_miss_max_records() -> i64 {
    DEFAULT_MISS_MAX_RECORDS
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("source {name:?}: {reason}")]
    InvalidSource { name: String, reason: String },
    #[error("duplicate source {name:?} in {path:?}")]
    DuplicateSource { name: String, path: PathBuf },
}

impl Config {
    /// Load from a single YAML file or merge every `*.yml`/`*.yaml` in a folder.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let mut merged = Config::default();
        if path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(path)
                .map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .filter(|path| {
                    matches!(
                        path.extension().and_then(|ext| ext.to_str()),
                        Some("yml") | Some("yaml")
                    )
                })
                .collect();
            files.sort();
            for file in files {
                merged.merge_file(&file)?;
            }
        } else {
            merged.merge_file(path)?;
        }
        merged.validate()?;
        Ok(merged)
    }

    fn merge_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed: Config = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        for (name, source) in parsed.sources {
            if self.sources.contains_key(&name) {
                return Err(ConfigError::DuplicateSource {
                    name,
                    path: path.to_path_buf(),
                });
            }
            self.sources.insert(name, source);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen_paths = std::collections::BTreeSet::new();
        for (name, source) in &self.sources {
            if !seen_paths.insert(source.path.as_str()) {
                return Err(ConfigError::InvalidSource {
                    name: name.clone(),
                    reason: format!("path {:?} is already used by another source", source.path),
                });
            }
            if !is_valid_source_name(name) {
                return Err(ConfigError::InvalidSource {
                    name: name.clone(),
                    reason: "name must be alphanumeric, underscore or hyphen".into(),
                });
            }
            if source.minzoom > source.maxzoom {
                return Err(ConfigError::InvalidSource {
                    name: name.clone(),
                    reason: format!(
                        "minzoom {} exceeds maxzoom {}",
                        source.minzoom, source.maxzoom
                    ),
                });
            }
            if source.maxzoom > MAX_SUPPORTED_ZOOM
                || source.max_scan_zoom() > MAX_SUPPORTED_ZOOM
            {
                return Err(ConfigError::InvalidSource {
                    name: name.clone(),
                    reason: format!("zoom levels above {MAX_SUPPORTED_ZOOM} are not supported"),
                });
            }
            let path = &source.path;
            if !path.starts_with('/')
                || !path.contains(":z")
                || !path.contains(":x")
                || !path.contains(":y")
            {
                return Err(ConfigError::InvalidSource {
                    name: name.clone(),
                    reason: format!("path {path:?} must start with '/' and contain :z/:x/:y"),
                });
            }
            for placeholder in ["{z}", "{x}", "{y}"] {
                if !source.target.contains(placeholder) {
                    return Err(ConfigError::InvalidSource {
                        name: name.clone(),
                        reason: format!("target is missing the {placeholder} placeholder"),
                    });
                }
            }
        }
        Ok(())
    }
}

pub fn is_valid_source_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl SourceConfig {
    /// Route prefix with the `/:z/:x/:y` tail removed; serves the style JSON.
    pub fn base_path(&self) -> &str {
        self.path
            .find("/:")
            .map(|idx| &self.path[..idx])
            .unwrap_or(&self.path)
    }

    /// The Express template rewritten with axum `{param}` captures.
    pub fn axum_path(&self) -> String {
        self.path
            .split('/')
            .map(|segment| match segment.strip_prefix(':') {
                Some(name) => format!("{{{name}}}"),
                None => segment.to_string(),
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn mbtiles_path(&self, name: &str, data_dir: &Path) -> PathBuf {
        match &self.mbtiles_file {
            Some(path) => path.clone(),
            None => data_dir.join(format!("{name}.mbtiles")),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self.metadata.format.as_str() {
            "jpg" | "jpeg" => "image/jpeg",
            "webp" => "image/webp",
            _ => "image/png",
        }
    }

    pub fn terrain_encoding(&self) -> Option<strata_shared::TerrainEncoding> {
        strata_shared::TerrainEncoding::from_metadata(&self.metadata.encoding)
    }

    pub fn scan_bounds(&self) -> strata_shared::LngLatBounds {
        self.autoscan
            .bounds
            .as_deref()
            .or(self.metadata.bounds.as_deref())
            .and_then(strata_shared::LngLatBounds::parse)
            .unwrap_or(strata_shared::LngLatBounds::WORLD)
    }

    pub fn max_scan_zoom(&self) -> u8 {
        self.autoscan.max_scan_zoom.unwrap_or(self.maxzoom)
    }

    pub fn scan_minzoom(&self) -> u8 {
        match self.gap_filling.source_real_minzoom {
            Some(real) => self.minzoom.max(real),
            None => self.minzoom,
        }
    }

    pub fn miss_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.miss_timeout.max(0))
    }
}
