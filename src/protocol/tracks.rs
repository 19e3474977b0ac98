use std::io::{Cursor, Read, Write};

use base64::prelude::*;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

/// Current handle format version.
pub const TRACK_VERSION: u8 = 2;

/// Flag bit 0: a source-specific extension block follows the common fields.
pub const FLAG_SOURCE_EXTENSION: u8 = 1;

const KNOWN_FLAGS: u8 = FLAG_SOURCE_EXTENSION;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("track handle is not valid base64")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("track handle is truncated")]
    Truncated,
    #[error("unsupported track version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown track flags {0:#04x}")]
    UnknownFlags(u8),
    #[error("track field is not valid utf-8")]
    InvalidUtf8,
    #[error("source '{0}' carries no extension block")]
    UnexpectedExtension(String),
    #[error("source '{0}' requires an extension block")]
    MissingExtension(String),
    #[error("{0} trailing bytes after track data")]
    TrailingBytes(usize),
    #[error("field '{0}' exceeds 65535 bytes")]
    FieldTooLong(&'static str),
    #[error("i/o error while writing track: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof => CodecError::Truncated,
            _ => CodecError::Io(e),
        }
    }
}

/// What the `http` provider learned while probing a URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeInfo {
    pub raw: String,
    pub name: String,
    pub parameters: Option<String>,
}

/// Provider-specific fields carried in the extension block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SourceExtra {
    #[default]
    None,
    Http(ProbeInfo),
}

/// Everything needed to recreate a playable track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDescriptor {
    pub identifier: String,
    pub author: String,
    /// Duration in milliseconds.
    pub length: u64,
    pub is_stream: bool,
    /// Start position in milliseconds.
    pub position: u64,
    pub title: String,
    pub uri: Option<String>,
    pub source_name: String,
    pub extra: SourceExtra,
}

/// Immutable base64 handle produced by [`TrackDescriptor::encode`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncodedTrack(pub String);

impl EncodedTrack {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EncodedTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TrackDescriptor {
    /// Encode into the binary handle layout:
    ///
    /// ```text
    /// [u8  flags]         bit 0 = extension block present
    /// [u8  version = 2]
    /// [utf source_name]
    /// [utf identifier]
    /// [utf author]
    /// [u64 length ms]
    /// [u8  is_stream]
    /// [u64 position ms]
    /// [utf title]
    /// [opt_utf uri]
    /// [extension]         http: utf raw, utf name, opt_utf parameters
    /// ```
    pub fn encode(&self) -> Result<EncodedTrack, CodecError> {
        let flags = match self.extra {
            SourceExtra::None => 0,
            SourceExtra::Http(_) => FLAG_SOURCE_EXTENSION,
        };

        let mut buf = Vec::with_capacity(128);
        buf.write_u8(flags)?;
        buf.write_u8(TRACK_VERSION)?;
        write_utf(&mut buf, "sourceName", &self.source_name)?;
        write_utf(&mut buf, "identifier", &self.identifier)?;
        write_utf(&mut buf, "author", &self.author)?;
        buf.write_u64::<BigEndian>(self.length)?;
        buf.write_u8(u8::from(self.is_stream))?;
        buf.write_u64::<BigEndian>(self.position)?;
        write_utf(&mut buf, "title", &self.title)?;
        write_opt_utf(&mut buf, "uri", self.uri.as_deref())?;

        if let SourceExtra::Http(probe) = &self.extra {
            write_utf(&mut buf, "probeRaw", &probe.raw)?;
            write_utf(&mut buf, "probeName", &probe.name)?;
            write_opt_utf(&mut buf, "probeParameters", probe.parameters.as_deref())?;
        }

        Ok(EncodedTrack(BASE64_STANDARD.encode(&buf)))
    }

    /// Decode a handle. Never returns a partially populated descriptor.
    pub fn decode(encoded: &str) -> Result<Self, CodecError> {
        let data = BASE64_STANDARD.decode(encoded.trim())?;
        let total = data.len();
        let mut cursor = Cursor::new(data);

        let flags = cursor.read_u8()?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(CodecError::UnknownFlags(flags));
        }
        let version = cursor.read_u8()?;
        if version != TRACK_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let source_name = read_utf(&mut cursor)?;
        let identifier = read_utf(&mut cursor)?;
        let author = read_utf(&mut cursor)?;
        let length = cursor.read_u64::<BigEndian>()?;
        let is_stream = cursor.read_u8()? != 0;
        let position = cursor.read_u64::<BigEndian>()?;
        let title = read_utf(&mut cursor)?;
        let uri = read_opt_utf(&mut cursor)?;

        let has_extension = flags & FLAG_SOURCE_EXTENSION != 0;
        let extra = match (source_name.as_str(), has_extension) {
            ("http", true) => SourceExtra::Http(ProbeInfo {
                raw: read_utf(&mut cursor)?,
                name: read_utf(&mut cursor)?,
                parameters: read_opt_utf(&mut cursor)?,
            }),
            ("http", false) => return Err(CodecError::MissingExtension(source_name)),
            (_, true) => return Err(CodecError::UnexpectedExtension(source_name)),
            (_, false) => SourceExtra::None,
        };

        let consumed = cursor.position() as usize;
        if consumed != total {
            return Err(CodecError::TrailingBytes(total - consumed));
        }

        Ok(Self {
            identifier,
            author,
            length,
            is_stream,
            position,
            title,
            uri,
            source_name,
            extra,
        })
    }

    /// Client-facing view of the descriptor.
    pub fn info(&self) -> TrackInfo {
        TrackInfo {
            identifier: self.identifier.clone(),
            is_seekable: !self.is_stream,
            author: self.author.clone(),
            length: self.length,
            is_stream: self.is_stream,
            position: self.position,
            title: self.title.clone(),
            uri: self.uri.clone(),
            source_name: self.source_name.clone(),
        }
    }
}

fn write_utf(w: &mut Vec<u8>, field: &'static str, s: &str) -> Result<(), CodecError> {
    let bytes = s.as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| CodecError::FieldTooLong(field))?;
    w.write_u16::<BigEndian>(len)?;
    w.write_all(bytes)?;
    Ok(())
}

fn write_opt_utf(w: &mut Vec<u8>, field: &'static str, s: Option<&str>) -> Result<(), CodecError> {
    match s {
        Some(s) => {
            w.write_u8(1)?;
            write_utf(w, field, s)
        }
        None => {
            w.write_u8(0)?;
            Ok(())
        }
    }
}

fn read_utf<R: Read>(r: &mut R) -> Result<String, CodecError> {
    let len = r.read_u16::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| CodecError::InvalidUtf8)
}

fn read_opt_utf<R: Read>(r: &mut R) -> Result<Option<String>, CodecError> {
    match r.read_u8()? {
        0 => Ok(None),
        _ => read_utf(r).map(Some),
    }
}

/// Metadata for a track as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    /// Duration in milliseconds.
    pub length: u64,
    pub is_stream: bool,
    pub position: u64,
    pub title: String,
    pub uri: Option<String>,
    pub source_name: String,
}

/// A handle paired with its decoded info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub track: EncodedTrack,
    pub info: TrackInfo,
}

impl Track {
    pub fn new(descriptor: &TrackDescriptor) -> Result<Self, CodecError> {
        Ok(Self {
            track: descriptor.encode()?,
            info: descriptor.info(),
        })
    }
}
