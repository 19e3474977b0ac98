use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::server::AppState;

/// Rejects the request unless `Authorization` equals the configured password.
/// Without a configured password every request passes.
pub async fn check_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(password) = state.config.server.password.as_deref() else {
        return Ok(next.run(req).await);
    };

    let auth_header = req
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok());

    match auth_header {
        Some(auth) if auth == password => Ok(next.run(req).await),
        Some(_) => {
            warn!("Authorization failed on {}: invalid password", req.uri().path());
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!(
                "Authorization failed on {}: missing Authorization header",
                req.uri().path()
            );
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

pub async fn add_response_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    response
        .headers_mut()
        .insert("Lavalink-Major-Version", HeaderValue::from_static("3"));
    response
}
