use serde::{Deserialize, Serialize};

use crate::common::Severity;

use super::tracks::Track;

/// Request parameters for the `loadtracks` endpoint.
#[derive(Deserialize)]
pub struct LoadTracksQuery {
    /// The identifier/link to load.
    pub identifier: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadType {
    TrackLoaded,
    PlaylistLoaded,
    SearchResult,
    NoMatches,
    LoadFailed,
}

/// Playlist metadata. Serializes as `{}` for anything that is not a playlist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Index of the selected track, or -1 if none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_track: Option<i32>,
}

impl PlaylistInfo {
    pub fn named(name: impl Into<String>, selected_track: i32) -> Self {
        Self {
            name: Some(name.into()),
            selected_track: Some(selected_track),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadException {
    pub message: String,
    pub severity: Severity,
}

/// Body of every `/loadtracks` answer, including failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadTracksResponse {
    pub load_type: LoadType,
    #[serde(default)]
    pub playlist_info: PlaylistInfo,
    pub tracks: Vec<Track>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<LoadException>,
}

impl LoadTracksResponse {
    pub fn failed(message: impl Into<String>, severity: Severity) -> Self {
        Self {
            load_type: LoadType::LoadFailed,
            playlist_info: PlaylistInfo::default(),
            tracks: Vec::new(),
            exception: Some(LoadException {
                message: message.into(),
                severity,
            }),
        }
    }

    pub fn no_matches() -> Self {
        Self {
            load_type: LoadType::NoMatches,
            playlist_info: PlaylistInfo::default(),
            tracks: Vec::new(),
            exception: None,
        }
    }
}
