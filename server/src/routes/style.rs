use std::sync::Arc;

use axum::Json;
use strata_shared::{Center, LngLatBounds};

use crate::state::Source;

/// MapLibre style JSON for one source: a `raster` source and layer, or a
/// `raster-dem` source with hillshade and terrain when the metadata declares
/// an elevation encoding.
pub async fn handle(source: Arc<Source>) -> Json<serde_json::Value> {
    Json(style_json(&source))
}

pub fn style_json(source: &Source) -> serde_json::Value {
    let config = &source.config;
    let tiles_url = format!("{}/{{z}}/{{x}}/{{y}}", config.base_path());
    let encoding = config.terrain_encoding();

    let mut tile_source = serde_json::json!({
        "type": if encoding.is_some() { "raster-dem" } else { "raster" },
        "tiles": [tiles_url],
        "tileSize": config.metadata.tile_size,
        "minzoom": config.minzoom,
        "maxzoom": config.maxzoom,
    });
    if let Some(encoding) = encoding {
        tile_source["encoding"] = serde_json::Value::String(encoding.as_str().to_string());
    }
    if let Some(bounds) = config
        .metadata
        .bounds
        .as_deref()
        .and_then(LngLatBounds::parse)
    {
        tile_source["bounds"] = serde_json::json!([
            bounds.west,
            bounds.south,
            bounds.east,
            bounds.north
        ]);
    }

    let layers = if encoding.is_some() {
        serde_json::json!([{
            "id": format!("{}-hillshade", source.name),
            "type": "hillshade",
            "source": source.name,
            "paint": {"hillshade-shadow-color": "#473B24"},
        }])
    } else {
        serde_json::json!([{
            "id": format!("{}-layer", source.name),
            "type": "raster",
            "source": source.name,
        }])
    };

    let mut sources = serde_json::Map::new();
    sources.insert(source.name.clone(), tile_source);
    let mut style = serde_json::json!({
        "version": 8,
        "name": source.name,
        "sources": sources,
        "layers": layers,
    });
    if encoding.is_some() {
        style["terrain"] = serde_json::json!({"source": source.name, "exaggeration": 1.0});
    }
    if let Some(center) = config.metadata.center.as_deref().and_then(Center::parse) {
        style["center"] = serde_json::json!([center.lng, center.lat]);
        style["zoom"] = serde_json::json!(center.zoom);
    }
    style
}
