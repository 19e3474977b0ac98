use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret compared against the `Authorization` header. When unset
    /// every request is accepted.
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub youtube_search_enabled: bool,
    #[serde(default = "default_true")]
    pub soundcloud_search_enabled: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2333
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            password: None,
            youtube_search_enabled: true,
            soundcloud_search_enabled: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WorkersConfig {
    /// Number of worker threads. Defaults to the available parallelism.
    pub size: Option<usize>,
    /// How long a broadcast waits on any single worker before giving up on it.
    #[serde(default = "default_broadcast_timeout_ms")]
    pub broadcast_timeout_ms: u64,
    /// Capacity of each worker's job channel.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_broadcast_timeout_ms() -> u64 {
    5_000
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            size: None,
            broadcast_timeout_ms: default_broadcast_timeout_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl WorkersConfig {
    pub fn pool_size(&self) -> usize {
        self.size.filter(|n| *n > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn broadcast_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.broadcast_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_resume_timeout_secs")]
    pub default_resume_timeout_secs: u64,
    #[serde(default = "default_voice_state_ttl_secs")]
    pub voice_state_ttl_secs: u64,
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}

fn default_resume_timeout_secs() -> u64 {
    60
}

fn default_voice_state_ttl_secs() -> u64 {
    20
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            default_resume_timeout_secs: default_resume_timeout_secs(),
            voice_state_ttl_secs: default_voice_state_ttl_secs(),
        }
    }
}
