use std::fmt;

use regex::Regex;
use reqwest::Url;
use tracing::{debug, info, warn};

use super::{
    http::HttpResolver,
    plugin::{BoxedResolver, Resolved},
};
use crate::{
    common::Severity,
    configs::Config,
    protocol::{LoadTracksResponse, LoadType, PlaylistInfo, Track},
};

const IDENTIFIER_PATTERN: &str = r"(ytsearch:)?(scsearch:)?(.+)";
const SOUNDCLOUD_HOST: &str = "soundcloud.com";

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("invalid identifier pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Http,
    SoundCloud,
    YouTube,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Http => "http",
            Self::SoundCloud => "soundcloud",
            Self::YouTube => "youtube",
        })
    }
}

/// Where an identifier is headed after prefix and hostname inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route<'a> {
    pub provider: Provider,
    pub query: &'a str,
    /// The provider is asked to search rather than resolve a link.
    pub search: bool,
    /// The identifier carried any search prefix at all.
    pub prefixed: bool,
}

/// Routes `/loadtracks` identifiers to providers and shapes their answers.
pub struct SourceManager {
    identifier: Regex,
    http: Option<BoxedResolver>,
    soundcloud: Option<BoxedResolver>,
    youtube: Option<BoxedResolver>,
    http_enabled: bool,
    youtube_search: bool,
    soundcloud_search: bool,
}

impl SourceManager {
    /// Build the manager and register every built-in provider enabled in
    /// `config`.
    pub fn new(config: &Config) -> Result<Self, SourceError> {
        let mut manager = Self {
            identifier: Regex::new(IDENTIFIER_PATTERN)?,
            http: None,
            soundcloud: None,
            youtube: None,
            http_enabled: config.sources.http,
            youtube_search: config.server.youtube_search_enabled,
            soundcloud_search: config.server.soundcloud_search_enabled,
        };

        if config.sources.http {
            manager.register(Provider::Http, Box::new(HttpResolver::new()?));
        }
        if !config.sources.youtube {
            debug!("youtube source disabled");
        }
        if !config.sources.soundcloud {
            debug!("soundcloud source disabled");
        }

        Ok(manager)
    }

    pub fn register(&mut self, provider: Provider, resolver: BoxedResolver) {
        info!("Loaded source: {} ({})", provider, resolver.name());
        *self.slot(provider) = Some(resolver);
    }

    fn slot(&mut self, provider: Provider) -> &mut Option<BoxedResolver> {
        match provider {
            Provider::Http => &mut self.http,
            Provider::SoundCloud => &mut self.soundcloud,
            Provider::YouTube => &mut self.youtube,
        }
    }

    fn resolver(&self, provider: Provider) -> Option<&BoxedResolver> {
        match provider {
            Provider::Http => self.http.as_ref(),
            Provider::SoundCloud => self.soundcloud.as_ref(),
            Provider::YouTube => self.youtube.as_ref(),
        }
    }

    /// Pick the provider for `identifier`. `None` when nothing is left after
    /// the prefixes.
    pub fn route<'a>(&self, identifier: &'a str) -> Option<Route<'a>> {
        let captures = self.identifier.captures(identifier)?;
        let youtube_search = captures.get(1).is_some();
        let soundcloud_search = captures.get(2).is_some();
        let query = captures.get(3)?.as_str();

        let url = query
            .starts_with("http")
            .then(|| Url::parse(query).ok())
            .flatten();
        let host = url.as_ref().and_then(|u| u.host_str());

        let (provider, search) = if soundcloud_search || host == Some(SOUNDCLOUD_HOST) {
            (Provider::SoundCloud, soundcloud_search)
        } else if host.is_some_and(|h| !h.contains("youtu")) {
            (Provider::Http, false)
        } else {
            (Provider::YouTube, youtube_search)
        };

        Some(Route {
            provider,
            query,
            search,
            prefixed: youtube_search || soundcloud_search,
        })
    }

    /// Reason a route may not be served, checked before any provider call.
    fn gate(&self, route: &Route<'_>) -> Option<&'static str> {
        match route.provider {
            Provider::SoundCloud if route.search && !self.soundcloud_search => {
                Some("Soundcloud searching is not enabled.")
            }
            Provider::YouTube if route.search && !self.youtube_search => {
                Some("YouTube searching is not enabled.")
            }
            Provider::Http if !self.http_enabled => Some("HTTP is not enabled."),
            _ => None,
        }
    }

    pub async fn load(&self, identifier: Option<&str>) -> LoadTracksResponse {
        let Some(route) = identifier
            .filter(|i| !i.is_empty())
            .and_then(|i| self.route(i))
        else {
            return LoadTracksResponse::failed(
                "Invalid or no identifier query string provided.",
                Severity::Common,
            );
        };
        debug!(
            "Loading \"{}\" via {} (search: {})",
            route.query, route.provider, route.search
        );

        if let Some(reason) = self.gate(&route) {
            return LoadTracksResponse::failed(reason, Severity::Common);
        }

        let Some(resolver) = self.resolver(route.provider) else {
            return LoadTracksResponse::failed(
                format!("No {} provider is available.", route.provider),
                Severity::Common,
            );
        };

        match resolver.resolve(route.query, route.search).await {
            Ok(resolved) => envelope(resolved, route.prefixed),
            Err(e) => {
                warn!("{} failed to load \"{}\": {}", route.provider, route.query, e);
                LoadTracksResponse::failed(e.message, e.severity)
            }
        }
    }
}

fn envelope(resolved: Resolved, prefixed: bool) -> LoadTracksResponse {
    let tracks = match resolved.tracks.iter().map(Track::new).collect::<Result<Vec<_>, _>>() {
        Ok(tracks) => tracks,
        Err(e) => {
            warn!("Provider returned a track that cannot be encoded: {}", e);
            return LoadTracksResponse::failed(e.to_string(), Severity::Fault);
        }
    };

    if tracks.is_empty() {
        return LoadTracksResponse::no_matches();
    }

    let load_type = if tracks.len() > 1 && prefixed {
        LoadType::SearchResult
    } else if resolved.playlist.is_some() {
        LoadType::PlaylistLoaded
    } else {
        LoadType::TrackLoaded
    };

    match (&load_type, &resolved.playlist) {
        (LoadType::PlaylistLoaded, Some(playlist)) => {
            debug!("Loaded playlist {:?}", playlist.name)
        }
        (LoadType::TrackLoaded, _) => debug!("Loaded track {}", tracks[0].info.title),
        _ => {}
    }

    LoadTracksResponse {
        load_type,
        playlist_info: resolved.playlist.unwrap_or_else(PlaylistInfo::default),
        tracks,
        exception: None,
    }
}
