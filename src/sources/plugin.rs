use async_trait::async_trait;

use crate::{
    common::Severity,
    protocol::{PlaylistInfo, TrackDescriptor},
};

/// What a provider found for one query.
#[derive(Debug, Clone, Default)]
pub struct Resolved {
    pub tracks: Vec<TrackDescriptor>,
    /// Present only when the query named a playlist.
    pub playlist: Option<PlaylistInfo>,
}

/// A provider rejection, surfaced to clients as a `LOAD_FAILED` exception.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    pub message: String,
    pub severity: Severity,
}

impl ProviderError {
    pub fn common(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Common,
        }
    }

    pub fn suspicious(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Suspicious,
        }
    }

    pub fn fault(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Fault,
        }
    }
}

/// A media provider the source manager can route identifiers to.
///
/// `query` has any search prefix already stripped; `is_search` tells the
/// provider whether to treat it as free text or as a link.
#[async_trait]
pub trait TrackResolver: Send + Sync {
    fn name(&self) -> &str;

    async fn resolve(&self, query: &str, is_search: bool) -> Result<Resolved, ProviderError>;
}

pub type BoxedResolver = Box<dyn TrackResolver>;
