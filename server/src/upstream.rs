use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use strata_shared::TileCoord;
use tracing::warn;

use crate::config::{
    SourceConfig, UPSTREAM_CONNECT_TIMEOUT_SECS, UPSTREAM_IDLE_TIMEOUT_SECS, UPSTREAM_POOL_SIZE,
    UPSTREAM_REQUEST_TIMEOUT_SECS, UPSTREAM_RETRIES, UPSTREAM_RETRY_INITIAL,
};

/// Browser-like defaults sent with every upstream request; per-source
/// `headers.request` and client pass-through headers overlay these.
const DEFAULT_HEADERS: &[(&str, &str)] = &[
    ("Accept", "image/webp,image/apng,image/*,*/*;q=0.8"),
    ("Accept-Language", "en-US,en;q=0.9"),
    ("Accept-Encoding", "gzip"),
    ("DNT", "1"),
    ("Connection", "keep-alive"),
    ("Sec-Fetch-Dest", "image"),
    ("Sec-Fetch-Mode", "no-cors"),
    ("Sec-Fetch-Site", "cross-site"),
    ("Cache-Control", "no-cache"),
    ("Pragma", "no-cache"),
];

/// Hop-by-hop and caching headers never forwarded from the client.
const BLOCKED_PASSTHROUGH: &[&str] = &[
    "host",
    "connection",
    "proxy-connection",
    "content-length",
    "if-none-match",
    "if-modified-since",
];

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("failed to build upstream client: {0}")]
    Build(reqwest::Error),
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl UpstreamError {
    pub fn is_timeout_or_connect(&self) -> bool {
        match self {
            Self::Request(e) => e.is_timeout() || e.is_connect(),
            Self::Build(_) => false,
        }
    }
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        self.status < 400
    }

    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("html"))
    }

    pub fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("image/"))
    }
}

/// One pooled HTTP client per source.
pub struct UpstreamClient {
    client: reqwest::Client,
    target: String,
    query_suffix: String,
    source_headers: Vec<(HeaderName, HeaderValue)>,
}

impl UpstreamClient {
    pub fn new(config: &SourceConfig) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .pool_max_idle_per_host(UPSTREAM_POOL_SIZE)
            .pool_idle_timeout(Duration::from_secs(UPSTREAM_IDLE_TIMEOUT_SECS))
            .timeout(Duration::from_secs(UPSTREAM_REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(UPSTREAM_CONNECT_TIMEOUT_SECS))
            .gzip(true)
            .build()
            .map_err(UpstreamError::Build)?;

        let mut query_suffix = String::new();
        for (key, value) in &config.query_params {
            query_suffix.push(if query_suffix.is_empty() && !config.target.contains('?') {
                '?'
            } else {
                '&'
            });
            query_suffix.push_str(key);
            query_suffix.push('=');
            query_suffix.push_str(value);
        }

        let source_headers = config
            .headers
            .request
            .iter()
            .filter_map(|(name, value)| {
                match (
                    HeaderName::try_from(name.as_str()),
                    HeaderValue::try_from(value.as_str()),
                ) {
                    (Ok(name), Ok(value)) => Some((name, value)),
                    _ => {
                        warn!(header = %name, "skipping invalid request header from config");
                        None
                    }
                }
            })
            .collect();

        Ok(Self {
            client,
            target: config.target.clone(),
            query_suffix,
            source_headers,
        })
    }

    pub fn url_for(&self, coord: TileCoord) -> String {
        let mut url = self
            .target
            .replace("{z}", &coord.z.to_string())
            .replace("{x}", &coord.x.to_string())
            .replace("{y}", &coord.y.to_string());
        url.push_str(&self.query_suffix);
        url
    }

    fn merged_headers(&self, passthrough: &HeaderMap) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in DEFAULT_HEADERS {
            if let (Ok(name), Ok(value)) =
                (HeaderName::try_from(*name), HeaderValue::try_from(*value))
            {
                headers.insert(name, value);
            }
        }
        for (name, value) in &self.source_headers {
            headers.insert(name.clone(), value.clone());
        }
        for (name, value) in passthrough {
            if BLOCKED_PASSTHROUGH.contains(&name.as_str()) {
                continue;
            }
            headers.insert(name.clone(), value.clone());
        }
        headers
    }

    /// GET with two automatic retries on connect/timeout failures.
    pub async fn get(
        &self,
        coord: TileCoord,
        passthrough: &HeaderMap,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let url = self.url_for(coord);
        let headers = self.merged_headers(passthrough);
        let mut backoff = UPSTREAM_RETRY_INITIAL;
        let mut attempt = 0u32;
        loop {
            let result = self
                .client
                .get(&url)
                .headers(headers.clone())
                .send()
                .await;
            match result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let content_type = response
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    // reqwest leaves decoding to us once an explicit
                    // Accept-Encoding header is set.
                    let gzipped = response
                        .headers()
                        .get(reqwest::header::CONTENT_ENCODING)
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|v| v.to_ascii_lowercase().contains("gzip"));
                    let mut body = response.bytes().await?;
                    if gzipped {
                        body = inflate_gzip(body);
                    }
                    return Ok(UpstreamResponse {
                        status,
                        content_type,
                        body,
                    });
                }
                Err(e) if attempt < UPSTREAM_RETRIES && (e.is_timeout() || e.is_connect()) => {
                    attempt += 1;
                    warn!(attempt, url = %url, error = %e, "retrying upstream fetch");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(UpstreamError::Request(e)),
            }
        }
    }
}

/// Decompress a gzip response body. Bodies that do not carry the gzip
/// magic, or fail to inflate, pass through unchanged and are caught by the
/// content checks downstream.
fn inflate_gzip(body: Bytes) -> Bytes {
    use std::io::Read as _;

    if !body.starts_with(&[0x1f, 0x8b]) {
        return body;
    }
    let mut inflated = Vec::new();
    let mut decoder = flate2::read::GzDecoder::new(body.as_ref());
    match decoder.read_to_end(&mut inflated) {
        Ok(_) => Bytes::from(inflated),
        Err(e) => {
            warn!(error = %e, "gzip response body failed to inflate");
            body
        }
    }
}
