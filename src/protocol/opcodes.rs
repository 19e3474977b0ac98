use serde::Deserialize;
use serde_json::{Map, Value};

use crate::common::types::GuildId;

/// Messages a client may send over the websocket, discriminated by `op`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IncomingMessage {
    Play(PlayCommand),
    VoiceUpdate(VoiceUpdate),
    Stop(GuildCommand),
    Pause(PauseCommand),
    Destroy(GuildCommand),
    Filters(FiltersCommand),
    ConfigureResuming(ConfigureResuming),
}

impl IncomingMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Play(_) => "play",
            Self::VoiceUpdate(_) => "voiceUpdate",
            Self::Stop(_) => "stop",
            Self::Pause(_) => "pause",
            Self::Destroy(_) => "destroy",
            Self::Filters(_) => "filters",
            Self::ConfigureResuming(_) => "configureResuming",
        }
    }

    /// The guild a player op targets; `None` for connection-level ops.
    pub fn guild_id(&self) -> Option<&GuildId> {
        match self {
            Self::Play(cmd) => Some(&cmd.guild_id),
            Self::VoiceUpdate(update) => Some(&update.guild_id),
            Self::Stop(cmd) | Self::Destroy(cmd) => Some(&cmd.guild_id),
            Self::Pause(cmd) => Some(&cmd.guild_id),
            Self::Filters(cmd) => Some(&cmd.guild_id),
            Self::ConfigureResuming(_) => None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayCommand {
    pub guild_id: GuildId,
    /// Encoded track handle.
    pub track: String,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub volume: Option<u16>,
    #[serde(default)]
    pub no_replace: bool,
    #[serde(default)]
    pub pause: bool,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceUpdate {
    pub guild_id: GuildId,
    pub session_id: String,
    pub event: Value,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GuildCommand {
    pub guild_id: GuildId,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PauseCommand {
    pub guild_id: GuildId,
    #[serde(default = "default_pause")]
    pub pause: bool,
}

fn default_pause() -> bool {
    true
}

/// Filter settings are opaque to the node; workers store them as sent.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FiltersCommand {
    pub guild_id: GuildId,
    #[serde(flatten)]
    pub filters: Map<String, Value>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ConfigureResuming {
    /// `null` turns resuming off for the connection.
    pub key: Option<String>,
    /// Seconds; falls back to the configured default.
    pub timeout: Option<u64>,
}
