use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    Url,
    header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, RANGE},
};
use tracing::debug;

use super::plugin::{ProviderError, Resolved, TrackResolver};
use crate::protocol::{ProbeInfo, SourceExtra, TrackDescriptor};

const HTTP_CLIENT_TIMEOUT_SECS: u64 = 10;
const USER_AGENT: &str = concat!("emberlink/", env!("CARGO_PKG_VERSION"));

/// Reported for live streams, whose length is unknown.
pub const STREAM_LENGTH: u64 = i64::MAX as u64;

/// Resolves direct media URLs by probing their response headers.
pub struct HttpResolver {
    client: reqwest::Client,
}

impl HttpResolver {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(HTTP_CLIENT_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(5))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self { client })
    }

    /// HEAD first; servers that refuse it get a one-byte ranged GET.
    async fn probe(&self, url: &str) -> Result<HeaderMap, ProviderError> {
        match self.client.head(url).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(resp.headers().clone()),
            Ok(resp) => debug!("HEAD {} answered {}, retrying with GET", url, resp.status()),
            Err(e) => debug!("HEAD {} failed: {}, retrying with GET", url, e),
        }

        let resp = self
            .client
            .get(url)
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(|e| ProviderError::suspicious(format!("HTTP request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(ProviderError::common(format!(
                "HTTP request failed with status: {}",
                resp.status()
            )));
        }
        Ok(resp.headers().clone())
    }
}

#[async_trait]
impl TrackResolver for HttpResolver {
    fn name(&self) -> &str {
        "http"
    }

    async fn resolve(&self, query: &str, _is_search: bool) -> Result<Resolved, ProviderError> {
        let url = Url::parse(query).map_err(|e| ProviderError::common(format!("Invalid URL: {}", e)))?;
        let headers = self.probe(url.as_str()).await?;
        let track = describe(query, &url, &headers)?;
        debug!("Probed {} as {}", query, track.title);

        Ok(Resolved {
            tracks: vec![track],
            playlist: None,
        })
    }
}

fn header<'a>(headers: &'a HeaderMap, name: impl reqwest::header::AsHeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Build the track for `identifier` from what its server told us.
fn describe(identifier: &str, url: &Url, headers: &HeaderMap) -> Result<TrackDescriptor, ProviderError> {
    let content_type = header(headers, CONTENT_TYPE).unwrap_or("");
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    let playable = mime.is_empty()
        || mime.starts_with("audio/")
        || mime.starts_with("video/")
        || mime == "application/octet-stream"
        || mime == "application/ogg";
    if !playable {
        return Err(ProviderError::common(format!(
            "Unsupported content type: {}",
            content_type
        )));
    }

    let is_stream = headers.contains_key("icy-metaint") || !headers.contains_key(CONTENT_LENGTH);

    let title = header(headers, "icy-name")
        .map(str::to_string)
        .or_else(|| {
            header(headers, CONTENT_DISPOSITION)
                .and_then(|v| v.split("filename=").nth(1))
                .map(|f| f.trim_matches(|c| c == '"' || c == ';').to_string())
                .filter(|f| !f.is_empty())
        })
        .or_else(|| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|s| !s.is_empty())
                .map(|s| urlencoding::decode(s).map(|d| d.into_owned()).unwrap_or_else(|_| s.to_string()))
        })
        .unwrap_or_else(|| "Unknown title".to_string());

    let author = header(headers, "icy-description")
        .or_else(|| header(headers, "icy-genre"))
        .unwrap_or("Unknown artist")
        .to_string();

    let probe = probe_name(&mime);

    Ok(TrackDescriptor {
        identifier: identifier.to_string(),
        author,
        length: if is_stream { STREAM_LENGTH } else { 0 },
        is_stream,
        position: 0,
        title,
        uri: Some(identifier.to_string()),
        source_name: "http".to_string(),
        extra: SourceExtra::Http(ProbeInfo {
            raw: probe.clone(),
            name: probe,
            parameters: None,
        }),
    })
}

/// Container name for a MIME type, as recorded in the probe info.
fn probe_name(mime: &str) -> String {
    let subtype = mime.split('/').nth(1).unwrap_or("");
    match subtype {
        "mpeg" | "mp3" | "mpeg3" | "x-mpeg" => "mp3",
        "aac" | "aacp" | "x-aac" => "aac",
        "ogg" | "opus" | "vorbis" => "ogg",
        "flac" | "x-flac" => "flac",
        "wav" | "wave" | "x-wav" => "wav",
        "webm" => "webm",
        "mp4" | "m4a" | "x-m4a" => "mp4",
        "" | "octet-stream" => "unknown",
        other => other,
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    fn describe_url(url: &str, pairs: &[(&'static str, &'static str)]) -> Result<TrackDescriptor, ProviderError> {
        describe(url, &Url::parse(url).unwrap(), &headers(pairs))
    }

    #[test]
    fn file_with_length_is_not_a_stream() {
        let track = describe_url(
            "https://cdn.example.com/music/My%20Song.mp3",
            &[("content-type", "audio/mpeg"), ("content-length", "4096")],
        )
        .unwrap();

        assert!(!track.is_stream);
        assert_eq!(track.length, 0);
        assert_eq!(track.title, "My Song.mp3");
        assert_eq!(track.author, "Unknown artist");
        assert_eq!(track.source_name, "http");
        assert_eq!(
            track.extra,
            SourceExtra::Http(ProbeInfo {
                raw: "mp3".into(),
                name: "mp3".into(),
                parameters: None
            })
        );
        let decoded = TrackDescriptor::decode(track.encode().unwrap().as_str()).unwrap();
        assert_eq!(decoded, track);
    }

    #[test]
    fn icy_stream_uses_station_headers() {
        let track = describe_url(
            "http://radio.example.com:8000/live",
            &[
                ("content-type", "audio/aacp"),
                ("icy-metaint", "16000"),
                ("icy-name", "Example FM"),
                ("icy-description", "All hits"),
            ],
        )
        .unwrap();

        assert!(track.is_stream);
        assert_eq!(track.length, STREAM_LENGTH);
        assert_eq!(track.title, "Example FM");
        assert_eq!(track.author, "All hits");
        assert!(track.info().is_stream);
        assert!(!track.info().is_seekable);
    }

    #[test]
    fn content_disposition_names_the_track() {
        let track = describe_url(
            "https://example.com/download?id=1",
            &[
                ("content-type", "application/octet-stream"),
                ("content-length", "10"),
                ("content-disposition", "attachment; filename=\"tune.flac\""),
            ],
        )
        .unwrap();
        assert_eq!(track.title, "tune.flac");
    }

    #[test]
    fn rejects_non_media() {
        let err = describe_url(
            "https://example.com/index.html",
            &[("content-type", "text/html; charset=utf-8")],
        )
        .unwrap_err();
        assert_eq!(err.severity, crate::common::Severity::Common);
        assert!(err.message.contains("text/html"));
    }
}
