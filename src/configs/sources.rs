use serde::{Deserialize, Serialize};

/// Which providers get registered with the source manager.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourcesConfig {
    #[serde(default = "enabled")]
    pub http: bool,
    #[serde(default = "enabled")]
    pub youtube: bool,
    #[serde(default = "enabled")]
    pub soundcloud: bool,
}

fn enabled() -> bool {
    true
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            http: true,
            youtube: true,
            soundcloud: true,
        }
    }
}
