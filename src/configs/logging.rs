use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct LoggingConfig {
    /// Base level, e.g. `info` or `debug`.
    pub level: Option<String>,
    /// Extra `EnvFilter` directives appended to the level, e.g. `emberlink::worker=trace`.
    pub filters: Option<String>,
    pub file: Option<FileLoggingConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FileLoggingConfig {
    pub path: String,
    #[serde(default = "default_max_lines")]
    pub max_lines: u32,
}

fn default_max_lines() -> u32 {
    10_000
}
