use serde_json::{Map, Value};

use crate::{
    common::types::{GuildId, UserId},
    protocol::PlayCommand,
};

/// Voice-gateway credentials for one (client, guild) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceServerState {
    pub client_id: UserId,
    pub guild_id: GuildId,
    pub session_id: String,
    pub event: Value,
}

/// Unit of work sent to a worker. Built per inbound message and dropped once
/// delivered.
#[derive(Debug, Clone)]
pub struct Job {
    pub client_id: Option<UserId>,
    pub op: WorkerOp,
}

#[derive(Debug, Clone)]
pub enum WorkerOp {
    Play(PlayCommand),
    Stop { guild_id: GuildId },
    Pause { guild_id: GuildId, pause: bool },
    Destroy { guild_id: GuildId },
    Filters { guild_id: GuildId, filters: Map<String, Value> },
    VoiceServer(VoiceServerState),
    /// Drop every player owned by `client_id`.
    DeleteAll,
    Stats,
}

impl Job {
    pub fn for_client(client_id: UserId, op: WorkerOp) -> Self {
        Self {
            client_id: Some(client_id),
            op,
        }
    }

    pub fn stats() -> Self {
        Self {
            client_id: None,
            op: WorkerOp::Stats,
        }
    }

    pub fn guild_id(&self) -> Option<&GuildId> {
        match &self.op {
            WorkerOp::Play(cmd) => Some(&cmd.guild_id),
            WorkerOp::Stop { guild_id }
            | WorkerOp::Pause { guild_id, .. }
            | WorkerOp::Destroy { guild_id }
            | WorkerOp::Filters { guild_id, .. } => Some(guild_id),
            WorkerOp::VoiceServer(state) => Some(&state.guild_id),
            WorkerOp::DeleteAll | WorkerOp::Stats => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self.op {
            WorkerOp::Play(_) => "PLAY",
            WorkerOp::Stop { .. } => "STOP",
            WorkerOp::Pause { .. } => "PAUSE",
            WorkerOp::Destroy { .. } => "DESTROY",
            WorkerOp::Filters { .. } => "FILTERS",
            WorkerOp::VoiceServer(_) => "VOICE_SERVER",
            WorkerOp::DeleteAll => "DELETE_ALL",
            WorkerOp::Stats => "STATS",
        }
    }
}

/// How a job reached the worker. A broadcast play is an ownership probe, a
/// direct play is an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Broadcast,
    Direct,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub players: u32,
    pub playing_players: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReply {
    Ack,
    /// Answer to a play probe: whether this worker already owns the pair.
    Owned(bool),
    Stats(WorkerStats),
}

/// Unsolicited frame for the connection mapped to (client, guild).
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub client_id: UserId,
    pub guild_id: GuildId,
    /// Complete outbound frame, including its `op`.
    pub payload: Value,
}

/// Shared state a worker asks the dispatcher for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataRequest {
    VoiceServer { client_id: UserId, guild_id: GuildId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutput {
    Event(WorkerEvent),
    DataRequest { worker: usize, request: DataRequest },
}
