use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{
    job::{DataRequest, Delivery, Job, VoiceServerState, WorkerOp, WorkerReply, WorkerStats},
    pool::{Outbox, Worker},
};
use crate::{
    common::{
        Severity,
        types::{GuildId, PlayerKey, UserId, now_ms},
    },
    protocol::{
        EncodedTrack, OutgoingMessage, PlayCommand, PlayerEvent, PlayerState, TrackDescriptor,
        TrackEndReason, TrackException,
    },
};

#[derive(Debug, Default)]
struct GuildPlayer {
    track: Option<EncodedTrack>,
    position: u64,
    paused: bool,
    volume: u16,
    filters: Map<String, Value>,
    voice: Option<VoiceServerState>,
}

impl GuildPlayer {
    fn is_playing(&self) -> bool {
        self.track.is_some() && !self.paused
    }
}

/// Default worker body. Owns the players assigned to its slot and answers
/// every broadcast for the players it holds.
#[derive(Debug, Default)]
pub struct PlayerWorker {
    players: HashMap<PlayerKey, GuildPlayer>,
}

impl PlayerWorker {
    pub fn new() -> Self {
        Self::default()
    }

    fn stats(&self) -> WorkerStats {
        WorkerStats {
            players: self.players.len() as u32,
            playing_players: self.players.values().filter(|p| p.is_playing()).count() as u32,
        }
    }

    fn start_track(&mut self, key: &PlayerKey, cmd: PlayCommand, outbox: &Outbox) {
        let (client_id, guild_id) = key;

        if let Err(e) = TrackDescriptor::decode(&cmd.track) {
            warn!("[{}] rejected track handle: {}", guild_id, e);
            send(
                outbox,
                *client_id,
                guild_id,
                OutgoingMessage::Event(PlayerEvent::TrackException {
                    guild_id: guild_id.clone(),
                    track: cmd.track,
                    exception: TrackException {
                        message: e.to_string(),
                        severity: Severity::Common,
                    },
                }),
            );
            return;
        }

        let player = self.players.entry(key.clone()).or_default();
        if cmd.no_replace && player.is_playing() {
            debug!("[{}] noReplace set, keeping current track", guild_id);
            return;
        }

        let previous = player.track.replace(EncodedTrack(cmd.track));
        player.position = cmd.start_time.unwrap_or(0);
        player.paused = cmd.pause;
        if let Some(volume) = cmd.volume {
            player.volume = volume;
        }
        let current = player.track.clone();

        if let Some(previous) = previous {
            send(
                outbox,
                *client_id,
                guild_id,
                OutgoingMessage::Event(PlayerEvent::TrackEnd {
                    guild_id: guild_id.clone(),
                    track: previous,
                    reason: TrackEndReason::Replaced,
                }),
            );
        }
        if let Some(track) = current {
            send(
                outbox,
                *client_id,
                guild_id,
                OutgoingMessage::Event(PlayerEvent::TrackStart {
                    guild_id: guild_id.clone(),
                    track,
                }),
            );
        }
    }

    fn play(&mut self, key: PlayerKey, cmd: PlayCommand, delivery: Delivery, outbox: &Outbox) -> WorkerReply {
        match delivery {
            Delivery::Broadcast => {
                let owned = self.players.contains_key(&key);
                if owned {
                    self.start_track(&key, cmd, outbox);
                }
                WorkerReply::Owned(owned)
            }
            Delivery::Direct => {
                self.start_track(&key, cmd, outbox);
                let needs_voice = self
                    .players
                    .get(&key)
                    .is_some_and(|p| p.voice.is_none());
                if needs_voice {
                    outbox.request(DataRequest::VoiceServer {
                        client_id: key.0,
                        guild_id: key.1,
                    });
                }
                WorkerReply::Ack
            }
        }
    }

    fn voice_server(&mut self, state: VoiceServerState, outbox: &Outbox) {
        let key = (state.client_id, state.guild_id.clone());
        let Some(player) = self.players.get_mut(&key) else {
            return;
        };
        player.voice = Some(state);
        let position = player.position;

        send(
            outbox,
            key.0,
            &key.1,
            OutgoingMessage::PlayerUpdate {
                guild_id: key.1.clone(),
                state: PlayerState {
                    time: now_ms(),
                    position,
                    connected: true,
                },
            },
        );
    }

    fn stop(&mut self, key: &PlayerKey, outbox: &Outbox) {
        let Some(track) = self.players.get_mut(key).and_then(|p| p.track.take()) else {
            return;
        };
        send(
            outbox,
            key.0,
            &key.1,
            OutgoingMessage::Event(PlayerEvent::TrackEnd {
                guild_id: key.1.clone(),
                track,
                reason: TrackEndReason::Stopped,
            }),
        );
    }
}

impl Worker for PlayerWorker {
    fn handle(&mut self, job: Job, delivery: Delivery, outbox: &Outbox) -> WorkerReply {
        let Some(client_id) = job.client_id else {
            return match job.op {
                WorkerOp::Stats => WorkerReply::Stats(self.stats()),
                _ => WorkerReply::Ack,
            };
        };

        let key = |guild_id: GuildId| (client_id, guild_id);

        match job.op {
            WorkerOp::Play(cmd) => {
                let player_key = key(cmd.guild_id.clone());
                return self.play(player_key, cmd, delivery, outbox);
            }
            WorkerOp::VoiceServer(state) => self.voice_server(state, outbox),
            WorkerOp::Stop { guild_id } => self.stop(&key(guild_id), outbox),
            WorkerOp::Pause { guild_id, pause } => {
                if let Some(player) = self.players.get_mut(&key(guild_id)) {
                    player.paused = pause;
                }
            }
            WorkerOp::Destroy { guild_id } => {
                if self.players.remove(&key(guild_id.clone())).is_some() {
                    debug!("[{}] player destroyed for client {}", guild_id, client_id);
                }
            }
            WorkerOp::Filters { guild_id, filters } => {
                if let Some(player) = self.players.get_mut(&key(guild_id)) {
                    player.filters = filters;
                }
            }
            WorkerOp::DeleteAll => {
                let before = self.players.len();
                self.players.retain(|(owner, _), _| *owner != client_id);
                let removed = before - self.players.len();
                if removed > 0 {
                    debug!(
                        "worker {}: dropped {} players of client {}",
                        outbox.worker(),
                        removed,
                        client_id
                    );
                }
            }
            WorkerOp::Stats => return WorkerReply::Stats(self.stats()),
        }

        WorkerReply::Ack
    }
}

fn send(outbox: &Outbox, client_id: UserId, guild_id: &GuildId, message: OutgoingMessage) {
    match serde_json::to_value(&message) {
        Ok(payload) => outbox.emit(client_id, guild_id.clone(), payload),
        Err(e) => warn!("[{}] failed to serialize frame: {}", guild_id, e),
    }
}
