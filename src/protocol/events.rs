use serde::Serialize;

use crate::common::{Severity, types::GuildId};

use super::tracks::EncodedTrack;

/// Frames the node itself sends over the websocket. Worker-originated frames
/// are built with the same types inside the worker and relayed verbatim.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum OutgoingMessage {
    Stats(Stats),
    #[serde(rename_all = "camelCase")]
    PlayerUpdate {
        guild_id: GuildId,
        state: PlayerState,
    },
    Event(PlayerEvent),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub players: u32,
    pub playing_players: u32,
    /// Milliseconds since the node started.
    pub uptime: u64,
    pub memory: Memory,
    pub cpu: Cpu,
    pub frame_stats: FrameStats,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub reservable: u64,
    pub used: u64,
    pub free: u64,
    pub allocated: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cpu {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

/// Always zero: there is no per-frame accounting behind it.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct FrameStats {
    pub sent: u32,
    pub nulled: u32,
    pub deficit: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub time: u64,
    pub position: u64,
    pub connected: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum PlayerEvent {
    #[serde(rename = "TrackStartEvent", rename_all = "camelCase")]
    TrackStart { guild_id: GuildId, track: EncodedTrack },
    #[serde(rename = "TrackEndEvent", rename_all = "camelCase")]
    TrackEnd {
        guild_id: GuildId,
        track: EncodedTrack,
        reason: TrackEndReason,
    },
    #[serde(rename = "TrackExceptionEvent", rename_all = "camelCase")]
    TrackException {
        guild_id: GuildId,
        track: String,
        exception: TrackException,
    },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

#[derive(Debug, Serialize)]
pub struct TrackException {
    pub message: String,
    pub severity: Severity,
}
