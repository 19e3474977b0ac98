use std::sync::Arc;

use axum::{Router, middleware, routing::get};
use tower_http::trace::TraceLayer;

use crate::{
    server::AppState,
    transport::{
        middleware::{add_response_headers, check_auth},
        routes::tracks,
        websocket_server::websocket_handler,
    },
};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(websocket_handler))
        .route("/loadtracks", get(tracks::load_tracks))
        .route(
            "/decodetracks",
            get(tracks::decode_tracks).post(tracks::decode_tracks_batch),
        )
        .route("/version", get(tracks::get_version))
        .layer(middleware::from_fn_with_state(state.clone(), check_auth))
        .layer(middleware::from_fn(add_response_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
