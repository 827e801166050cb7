use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use strata_shared::TileCoord;

use crate::engine::{self, CacheStatus};
use crate::state::Source;

pub const CACHE_STATUS_HEADER: &str = "X-Cache-Status";

pub async fn handle(
    source: Arc<Source>,
    params: HashMap<String, String>,
    query: HashMap<String, String>,
    headers: HeaderMap,
) -> Response {
    let Some(coord) = parse_coord(&params) else {
        return plain_status(StatusCode::BAD_REQUEST);
    };
    let debug = query.get("debug").is_some_and(|v| v == "true");
    let reply = engine::serve(&source, coord, &headers).await;
    into_response(&source, reply, debug)
}

fn parse_coord(params: &HashMap<String, String>) -> Option<TileCoord> {
    let z: u8 = params.get("z")?.parse().ok()?;
    let x: u32 = params.get("x")?.parse().ok()?;
    let y: u32 = params.get("y")?.parse().ok()?;
    if z > crate::config::MAX_SUPPORTED_ZOOM {
        return None;
    }
    let coord = TileCoord::new(z, x, y);
    coord.is_valid().then_some(coord)
}

fn into_response(source: &Source, reply: engine::TileReply, debug: bool) -> Response {
    let max_age = &source.config.headers.response.cache_control.max_age;
    match reply.body {
        Some(body) => {
            let age = match reply.cache_status {
                CacheStatus::Miss => max_age.miss,
                _ => max_age.hit,
            };
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, reply.content_type)
                .header(header::CACHE_CONTROL, format!("public, max-age={age}"))
                .header(CACHE_STATUS_HEADER, reply.cache_status.as_str())
                .body(Body::from(body))
                .unwrap_or_else(|_| plain_status(StatusCode::INTERNAL_SERVER_ERROR))
        }
        None if debug => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "image/png")
            .header(header::CACHE_CONTROL, "no-store")
            .header(CACHE_STATUS_HEADER, CacheStatus::Error.as_str())
            .body(Body::from(source.error_tile.clone()))
            .unwrap_or_else(|_| plain_status(StatusCode::INTERNAL_SERVER_ERROR)),
        None => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header(header::CACHE_CONTROL, "no-store")
            .header(CACHE_STATUS_HEADER, CacheStatus::Error.as_str())
            .body(Body::empty())
            .unwrap_or_else(|_| plain_status(StatusCode::INTERNAL_SERVER_ERROR)),
    }
}

fn plain_status(status: StatusCode) -> Response {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(z: &str, x: &str, y: &str) -> HashMap<String, String> {
        HashMap::from([
            ("z".to_string(), z.to_string()),
            ("x".to_string(), x.to_string()),
            ("y".to_string(), y.to_string()),
        ])
    }

    #[test]
    fn coordinates_parse_within_the_grid() {
        assert_eq!(
            parse_coord(&params("5", "10", "20")),
            Some(TileCoord::new(5, 10, 20))
        );
        // Out of grid for the zoom.
        assert_eq!(parse_coord(&params("2", "4", "0")), None);
        assert_eq!(parse_coord(&params("2", "0", "4")), None);
        // Garbage and negatives.
        assert_eq!(parse_coord(&params("a", "0", "0")), None);
        assert_eq!(parse_coord(&params("2", "-1", "0")), None);
        assert_eq!(parse_coord(&params("99", "0", "0")), None);
        // Missing params.
        assert_eq!(parse_coord(&HashMap::new()), None);
    }
}
