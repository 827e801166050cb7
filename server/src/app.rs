use std::collections::HashMap;

use axum::Router;
use axum::extract::{Path, Query};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use tower_http::compression::CompressionLayer;

use crate::routes;
use crate::state::AppState;

pub(crate) fn build_app(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/", get(routes::api::dashboard))
        .route("/api/health", get(routes::api::health))
        .route("/api/stats", get(routes::api::stats))
        .route("/admin/vacuum", get(routes::api::vacuum))
        .route("/api/scan/{source}/status", get(routes::api::scan_status))
        .route(
            "/api/reconstructor/{source}/status",
            get(routes::api::reconstructor_status),
        )
        .route(
            "/api/reconstructor/{source}/start",
            post(routes::api::reconstructor_start),
        );

    // Tile and style routes come from the config: each source registers its
    // Express-style template rewritten with axum captures.
    for source in state.sources.values() {
        let tile_source = source.clone();
        app = app.route(
            &source.config.axum_path(),
            get(
                move |Path(params): Path<HashMap<String, String>>,
                      Query(query): Query<HashMap<String, String>>,
                      headers: HeaderMap| {
                    let source = tile_source.clone();
                    async move { routes::tiles::handle(source, params, query, headers).await }
                },
            ),
        );

        let base = source.config.base_path().to_string();
        if !base.is_empty() {
            let style_source = source.clone();
            app = app.route(
                &base,
                get(move || {
                    let source = style_source.clone();
                    async move { routes::style::handle(source).await }
                }),
            );
        }
    }

    app.layer(CompressionLayer::new()).with_state(state)
}
