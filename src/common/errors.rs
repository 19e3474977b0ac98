use serde::{Deserialize, Serialize};

use super::types::now_ms;

/// Exception severity levels, as reported in `exception.severity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// The cause is known and expected (e.g. a disabled feature).
    Common,
    /// The cause might not be exactly known, but is possibly caused by outside factors.
    Suspicious,
    /// The probable cause is an issue with the node or a provider.
    Fault,
}

/// JSON error body for non-200 REST answers.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    pub status: u16,
    /// Reason phrase (e.g. "Bad Request").
    pub error: String,
    pub message: String,
    /// The request path that caused the error.
    pub path: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            timestamp: now_ms(),
            status: 400,
            error: "Bad Request".into(),
            message: message.into(),
            path: path.into(),
        }
    }
}
