use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::configs::*;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config.toml or config.default.toml not found")]
    NotFound,
    #[error("{0} is empty")]
    Empty(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = if Path::new("config.toml").exists() {
            "config.toml"
        } else if Path::new("config.default.toml").exists() {
            "config.default.toml"
        } else {
            return Err(ConfigError::NotFound);
        };

        Self::from_path(config_path)
    }

    pub fn from_path(path: &str) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        if config_str.trim().is_empty() {
            return Err(ConfigError::Empty(path.to_string()));
        }

        Self::parse(&config_str).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config = Config::parse("[server]\npassword = \"youshallnotpass\"\n").unwrap();

        assert_eq!(config.server.password.as_deref(), Some("youshallnotpass"));
        assert_eq!(config.server.port, 2333);
        assert!(config.server.youtube_search_enabled);
        assert!(config.sources.http);
        assert_eq!(config.session.voice_state_ttl_secs, 20);
        assert_eq!(config.session.heartbeat_interval_secs, 60);
        assert_eq!(config.workers.broadcast_timeout_ms, 5_000);
        assert!(config.logging.is_none());
    }

    #[test]
    fn worker_size_override() {
        let config = Config::parse("[workers]\nsize = 3\n").unwrap();
        assert_eq!(config.workers.pool_size(), 3);

        let config = Config::parse("[workers]\nsize = 0\n").unwrap();
        assert!(config.workers.pool_size() >= 1);
    }

    #[test]
    fn search_flags_and_logging() {
        let config = Config::parse(
            r#"
            [server]
            soundcloud_search_enabled = false

            [sources]
            http = false

            [logging]
            level = "debug"
            file = { path = "logs/emberlink.log" }
            "#,
        )
        .unwrap();

        assert!(!config.server.soundcloud_search_enabled);
        assert!(config.server.youtube_search_enabled);
        assert!(!config.sources.http);
        let logging = config.logging.unwrap();
        assert_eq!(logging.level.as_deref(), Some("debug"));
        assert_eq!(logging.file.unwrap().max_lines, 10_000);
    }
}
