use std::sync::Arc;

use axum::{
    extract::{Query, RawQuery, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Json, Response},
};
use tracing::debug;

use crate::{
    common::ApiError,
    protocol::{
        CodecError, EncodedTrack, LoadTracksQuery, LoadTracksResponse, Track, TrackDescriptor,
    },
    server::AppState,
};

/// GET /loadtracks?identifier=...
///
/// Always 200: failures travel inside the envelope.
pub async fn load_tracks(
    Query(params): Query<LoadTracksQuery>,
    State(state): State<Arc<AppState>>,
) -> Json<LoadTracksResponse> {
    debug!("Load tracks: {:?}", params.identifier);
    Json(state.source_manager.load(params.identifier.as_deref()).await)
}

/// GET /decodetracks?track=...[&track=...]
///
/// A single `track` answers with its info object, repeated ones with an array
/// of `{track, info}`.
pub async fn decode_tracks(uri: Uri, RawQuery(query): RawQuery) -> Response {
    let handles = track_params(query.as_deref().unwrap_or(""));

    match handles.as_slice() {
        [] => bad_request("Invalid or no track query string provided.", &uri),
        [single] => match TrackDescriptor::decode(single) {
            Ok(descriptor) => Json(descriptor.info()).into_response(),
            Err(e) => decode_failed(e, &uri),
        },
        many => match decode_all(many.iter().map(String::as_str)) {
            Ok(tracks) => Json(tracks).into_response(),
            Err(e) => decode_failed(e, &uri),
        },
    }
}

/// POST /decodetracks with a JSON array of handles.
pub async fn decode_tracks_batch(uri: Uri, Json(handles): Json<Vec<String>>) -> Response {
    match decode_all(handles.iter().map(String::as_str)) {
        Ok(tracks) => Json(tracks).into_response(),
        Err(e) => decode_failed(e, &uri),
    }
}

/// GET /version
pub async fn get_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

fn decode_all<'a>(handles: impl Iterator<Item = &'a str>) -> Result<Vec<Track>, CodecError> {
    handles
        .map(|handle| {
            let descriptor = TrackDescriptor::decode(handle)?;
            Ok(Track {
                track: EncodedTrack(handle.to_string()),
                info: descriptor.info(),
            })
        })
        .collect()
}

/// Every non-empty `track` value in a raw query string, in order. A literal
/// `+` is kept as is since base64 handles contain it.
fn track_params(query: &str) -> Vec<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(key, _)| *key == "track")
        .filter_map(|(_, value)| urlencoding::decode(value).ok())
        .map(|value| value.into_owned())
        .filter(|value| !value.is_empty())
        .collect()
}

fn decode_failed(e: CodecError, uri: &Uri) -> Response {
    debug!("Rejected track handle: {}", e);
    bad_request(e.to_string(), uri)
}

fn bad_request(message: impl Into<String>, uri: &Uri) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError::bad_request(message, uri.path())),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_params_keep_order_and_plus_signs() {
        assert_eq!(
            track_params("track=QUF+Qg%3D%3D&foo=bar&track=Q0M="),
            vec!["QUF+Qg==".to_string(), "Q0M=".to_string()]
        );
        assert!(track_params("").is_empty());
        assert!(track_params("track=").is_empty());
        assert!(track_params("tracks=abc").is_empty());
    }
}
