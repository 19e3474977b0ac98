//! The node's control loop.
//!
//! One task owns the connection registry, the voice-state cache and the
//! per-player job queues. Connection tasks talk to it through
//! [`DispatcherHandle`]; worker pool calls run in spawned tasks that report
//! back through the same command channel, so the loop itself never waits on
//! a worker.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    sync::oneshot,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::{debug, error, info, warn};

use super::{
    registry::{Closed, ConnectionRegistry, Opened, SocketLink},
    voice_state::VoiceStateCache,
};
use crate::{
    common::types::{ConnectionId, PlayerKey, UserId},
    configs::SessionConfig,
    monitoring::StatsCollector,
    protocol::{IncomingMessage, OutgoingMessage, Stats},
    worker::{
        DataRequest, Job, VoiceServerState, WorkerOp, WorkerOutput, WorkerPool, WorkerReply,
        WorkerStats,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatsTarget {
    Everyone,
    Connection(ConnectionId),
}

enum Command {
    Open {
        user_id: UserId,
        resume_key: Option<String>,
        link: SocketLink,
        reply: oneshot::Sender<Opened>,
    },
    CanResume {
        user_id: UserId,
        key: String,
        reply: oneshot::Sender<bool>,
    },
    Message {
        connection: ConnectionId,
        message: IncomingMessage,
    },
    Pong(ConnectionId),
    Closed {
        connection: ConnectionId,
        socket: u64,
    },
    JobSettled(PlayerKey),
    StatsCollected {
        target: StatsTarget,
        stats: Stats,
    },
}

/// Cloneable front door to the dispatcher task.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: flume::Sender<Command>,
}

impl DispatcherHandle {
    /// Register a freshly upgraded socket. `None` once the dispatcher is gone.
    pub async fn open(
        &self,
        user_id: UserId,
        resume_key: Option<String>,
        link: SocketLink,
    ) -> Option<Opened> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Open {
            user_id,
            resume_key,
            link,
            reply,
        });
        rx.await.ok()
    }

    pub async fn can_resume(&self, user_id: UserId, key: String) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CanResume {
            user_id,
            key,
            reply,
        });
        rx.await.unwrap_or(false)
    }

    pub fn message(&self, connection: ConnectionId, message: IncomingMessage) {
        self.send(Command::Message {
            connection,
            message,
        });
    }

    pub fn pong(&self, connection: ConnectionId) {
        self.send(Command::Pong(connection));
    }

    /// Report that socket `socket` of `connection` has ended.
    pub fn closed(&self, connection: ConnectionId, socket: u64) {
        self.send(Command::Closed { connection, socket });
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            warn!("Dispatcher is not running, command dropped");
        }
    }
}

pub struct Dispatcher {
    commands: flume::Receiver<Command>,
    handle: DispatcherHandle,
    pool: WorkerPool,
    worker_output: flume::Receiver<WorkerOutput>,
    registry: ConnectionRegistry,
    voice_states: VoiceStateCache,
    stats: Arc<Mutex<StatsCollector>>,
    /// Jobs waiting behind the one currently running for the same player.
    queued: HashMap<PlayerKey, VecDeque<Job>>,
    heartbeat_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        session: &SessionConfig,
        pool: WorkerPool,
        worker_output: flume::Receiver<WorkerOutput>,
    ) -> (Self, DispatcherHandle) {
        let (tx, commands) = flume::unbounded();
        let handle = DispatcherHandle { tx };

        let dispatcher = Self {
            commands,
            handle: handle.clone(),
            pool,
            worker_output,
            registry: ConnectionRegistry::new(Duration::from_secs(
                session.default_resume_timeout_secs,
            )),
            voice_states: VoiceStateCache::new(Duration::from_secs(session.voice_state_ttl_secs)),
            stats: Arc::new(Mutex::new(StatsCollector::new())),
            queued: HashMap::new(),
            heartbeat_interval: Duration::from_secs(session.heartbeat_interval_secs.max(1)),
        };

        (dispatcher, handle)
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let mut heartbeat = interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Dispatcher running with {} workers, heartbeat every {:?}",
            self.pool.size(),
            self.heartbeat_interval
        );

        loop {
            tokio::select! {
                command = self.commands.recv_async() => match command {
                    Ok(command) => self.handle_command(command),
                    Err(_) => break,
                },
                Ok(output) = self.worker_output.recv_async() => self.handle_output(output),
                expired = self.registry.next_expired() => {
                    info!("Session of client {} was not resumed, releasing its players", expired.user_id);
                    self.spawn_broadcast(Job::for_client(expired.user_id, WorkerOp::DeleteAll));
                }
                key = self.voice_states.next_expired() => {
                    debug!("Voice state for {}/{} expired", key.0, key.1);
                }
                _ = heartbeat.tick() => self.collect_stats(StatsTarget::Everyone),
            }
        }

        info!("Dispatcher stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open {
                user_id,
                resume_key,
                link,
                reply,
            } => {
                let opened = self.registry.open(user_id, resume_key.as_deref(), link);
                let _ = reply.send(opened);
                self.collect_stats(StatsTarget::Connection(opened.id));
            }
            Command::CanResume {
                user_id,
                key,
                reply,
            } => {
                let _ = reply.send(self.registry.can_resume(user_id, &key));
            }
            Command::Message {
                connection,
                message,
            } => self.handle_message(connection, message),
            Command::Pong(connection) => self.registry.mark_alive(connection),
            Command::Closed { connection, socket } => {
                if let Some(closed) = self.registry.close(connection, socket) {
                    self.handle_closed(connection, closed);
                }
            }
            Command::JobSettled(key) => self.settle(key),
            Command::StatsCollected { target, stats } => {
                let frame = match serde_json::to_string(&OutgoingMessage::Stats(stats)) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("Failed to serialize stats: {}", e);
                        return;
                    }
                };
                match target {
                    StatsTarget::Everyone => {
                        for (connection, closed) in self.registry.heartbeat(&frame) {
                            self.handle_closed(connection, closed);
                        }
                    }
                    StatsTarget::Connection(id) => {
                        self.registry.send_to(id, frame);
                    }
                }
            }
        }
    }

    fn handle_message(&mut self, connection: ConnectionId, message: IncomingMessage) {
        let Some(user_id) = self.registry.user_id(connection) else {
            debug!("Message from unknown connection {}", connection);
            return;
        };
        debug!("Client {} sent {}", user_id, message.name());

        if message.guild_id().is_some_and(|guild| guild.is_empty()) {
            debug!("Ignoring {} without a guild id from {}", message.name(), connection);
            return;
        }

        let job = match message {
            IncomingMessage::Play(cmd) => {
                if cmd.track.is_empty() {
                    debug!("Ignoring play without a track for {}", cmd.guild_id);
                    return;
                }
                self.registry
                    .bind_route((user_id, cmd.guild_id.clone()), connection);
                Job::for_client(user_id, WorkerOp::Play(cmd))
            }
            IncomingMessage::VoiceUpdate(update) => {
                let state = VoiceServerState {
                    client_id: user_id,
                    guild_id: update.guild_id,
                    session_id: update.session_id,
                    event: update.event,
                };
                self.voice_states.insert(state.clone());
                Job::for_client(user_id, WorkerOp::VoiceServer(state))
            }
            IncomingMessage::Stop(cmd) => {
                Job::for_client(user_id, WorkerOp::Stop { guild_id: cmd.guild_id })
            }
            IncomingMessage::Pause(cmd) => Job::for_client(
                user_id,
                WorkerOp::Pause {
                    guild_id: cmd.guild_id,
                    pause: cmd.pause,
                },
            ),
            IncomingMessage::Destroy(cmd) => {
                Job::for_client(user_id, WorkerOp::Destroy { guild_id: cmd.guild_id })
            }
            IncomingMessage::Filters(cmd) => Job::for_client(
                user_id,
                WorkerOp::Filters {
                    guild_id: cmd.guild_id,
                    filters: cmd.filters,
                },
            ),
            IncomingMessage::ConfigureResuming(cmd) => {
                if let Err(e) = self
                    .registry
                    .configure_resuming(connection, cmd.key, cmd.timeout)
                {
                    warn!("configureResuming from {} rejected: {}", connection, e);
                }
                return;
            }
        };

        self.enqueue(job);
    }

    fn handle_closed(&mut self, connection: ConnectionId, closed: Closed) {
        let dropped = self.voice_states.remove_client(closed.user_id());
        if dropped > 0 {
            debug!("Dropped {} voice states of client {}", dropped, closed.user_id());
        }
        if let Closed::PendingResume { timeout, .. } = closed {
            debug!("Connection {} parked for {:?}", connection, timeout);
        }
    }

    fn handle_output(&mut self, output: WorkerOutput) {
        match output {
            WorkerOutput::Event(event) => {
                let key = (event.client_id, event.guild_id);
                match serde_json::to_string(&event.payload) {
                    Ok(frame) => {
                        self.registry.route_event(&key, frame);
                    }
                    Err(e) => warn!("Failed to serialize worker event: {}", e),
                }
            }
            WorkerOutput::DataRequest {
                worker,
                request: DataRequest::VoiceServer {
                    client_id,
                    guild_id,
                },
            } => {
                let key = (client_id, guild_id);
                match self.voice_states.get(&key).cloned() {
                    Some(state) => {
                        self.enqueue(Job::for_client(client_id, WorkerOp::VoiceServer(state)))
                    }
                    None => debug!(
                        "Worker {} asked for voice state of {}/{}, none cached",
                        worker, key.0, key.1
                    ),
                }
            }
        }
    }

    /// Jobs for one player run strictly one after another; everything else
    /// goes straight to the pool.
    fn enqueue(&mut self, job: Job) {
        let (Some(client_id), Some(guild_id)) = (job.client_id, job.guild_id().cloned()) else {
            self.spawn_broadcast(job);
            return;
        };
        let key = (client_id, guild_id);

        match self.queued.get_mut(&key) {
            Some(waiting) => waiting.push_back(job),
            None => {
                self.queued.insert(key.clone(), VecDeque::new());
                self.spawn_job(key, job);
            }
        }
    }

    fn settle(&mut self, key: PlayerKey) {
        let next = self.queued.get_mut(&key).and_then(VecDeque::pop_front);
        match next {
            Some(job) => self.spawn_job(key, job),
            None => {
                self.queued.remove(&key);
            }
        }
    }

    fn spawn_job(&self, key: PlayerKey, job: Job) {
        let pool = self.pool.clone();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            if matches!(job.op, WorkerOp::Play(_)) {
                play(&pool, job).await;
            } else {
                pool.broadcast(job).await;
            }
            handle.send(Command::JobSettled(key));
        });
    }

    fn spawn_broadcast(&self, job: Job) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            pool.broadcast(job).await;
        });
    }

    /// Host sampling runs on the blocking pool; the loop only forwards the
    /// finished frame.
    fn collect_stats(&self, target: StatsTarget) {
        let pool = self.pool.clone();
        let handle = self.handle.clone();
        let collector = self.stats.clone();
        tokio::spawn(async move {
            let totals = sum_stats(&pool.broadcast(Job::stats()).await);
            let sampled = tokio::task::spawn_blocking(move || {
                collector
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .collect(totals)
            })
            .await;
            match sampled {
                Ok(stats) => handle.send(Command::StatsCollected { target, stats }),
                Err(e) => error!("Stats sampling failed: {}", e),
            }
        });
    }
}

/// Probe every worker for an owner of the player and assign a new one only
/// when all of them answered no.
async fn play(pool: &WorkerPool, job: Job) {
    let replies = pool.broadcast(job.clone()).await;

    if replies.contains(&Some(WorkerReply::Owned(true))) {
        return;
    }
    if replies.iter().any(Option::is_none) {
        warn!(
            "Not assigning player for {:?}: {} of {} workers did not answer",
            job.guild_id(),
            replies.iter().filter(|r| r.is_none()).count(),
            replies.len()
        );
        return;
    }
    if let Err(e) = pool.execute(job).await {
        warn!("Failed to assign player: {}", e);
    }
}

fn sum_stats(replies: &[Option<WorkerReply>]) -> WorkerStats {
    replies
        .iter()
        .fold(WorkerStats::default(), |mut total, reply| {
            if let Some(WorkerReply::Stats(stats)) = reply {
                total.players += stats.players;
                total.playing_players += stats.playing_players;
            }
            total
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::{
            ConfigureResuming, GuildCommand, PlayCommand, SourceExtra, TrackDescriptor,
            VoiceUpdate,
        },
        server::registry::{Outbound, SocketLink},
        worker::PlayerWorker,
    };
    use tokio::time::timeout;

    struct Node {
        pool: WorkerPool,
        handle: DispatcherHandle,
    }

    fn start(resume_timeout_secs: u64) -> Node {
        let (pool, output) = WorkerPool::spawn(4, 64, Duration::from_secs(2), |_| {
            PlayerWorker::new()
        })
        .unwrap();
        let session = SessionConfig {
            heartbeat_interval_secs: 3600,
            default_resume_timeout_secs: resume_timeout_secs,
            voice_state_ttl_secs: 20,
        };
        let (dispatcher, handle) = Dispatcher::new(&session, pool.clone(), output);
        dispatcher.spawn();
        Node { pool, handle }
    }

    fn track() -> String {
        TrackDescriptor {
            identifier: "id".into(),
            author: "a".into(),
            length: 1000,
            is_stream: false,
            position: 0,
            title: "t".into(),
            uri: None,
            source_name: "youtube".into(),
            extra: SourceExtra::None,
        }
        .encode()
        .unwrap()
        .0
    }

    fn play(guild: &str) -> IncomingMessage {
        IncomingMessage::Play(PlayCommand {
            guild_id: guild.into(),
            track: track(),
            start_time: None,
            end_time: None,
            volume: None,
            no_replace: false,
            pause: false,
        })
    }

    async fn next_frame(rx: &flume::Receiver<Outbound>) -> serde_json::Value {
        loop {
            let outbound = timeout(Duration::from_secs(5), rx.recv_async())
                .await
                .expect("timed out waiting for a frame")
                .unwrap();
            if let Outbound::Frame(frame) = outbound {
                return serde_json::from_str(&frame).unwrap();
            }
        }
    }

    /// Next frame that is not a stats frame.
    async fn next_event(rx: &flume::Receiver<Outbound>) -> serde_json::Value {
        loop {
            let frame = next_frame(rx).await;
            if frame["op"] != "stats" {
                return frame;
            }
        }
    }

    async fn connect(
        node: &Node,
        user: u64,
        resume_key: Option<&str>,
    ) -> (Opened, flume::Receiver<Outbound>) {
        let (link, end) = SocketLink::new();
        let opened = node
            .handle
            .open(UserId(user), resume_key.map(String::from), link)
            .await
            .unwrap();
        (opened, end.outbound)
    }

    async fn total_players(pool: &WorkerPool) -> u32 {
        sum_stats(&pool.broadcast(Job::stats()).await).players
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn new_connection_gets_stats() {
        let node = start(60);
        let (opened, rx) = connect(&node, 1, None).await;
        assert!(!opened.resumed);

        let frame = next_frame(&rx).await;
        assert_eq!(frame["op"], "stats");
        assert_eq!(frame["frameStats"]["sent"], 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_plays_create_one_player() {
        let node = start(60);
        let (opened, rx) = connect(&node, 1, None).await;
        let id = opened.id;

        node.handle.message(id, play("100"));
        node.handle.message(id, play("100"));

        let types: Vec<serde_json::Value> = [
            next_event(&rx).await,
            next_event(&rx).await,
            next_event(&rx).await,
        ]
        .iter()
        .map(|f| f["type"].clone())
        .collect();
        assert_eq!(
            types,
            vec!["TrackStartEvent", "TrackEndEvent", "TrackStartEvent"]
        );
        assert_eq!(total_players(&node.pool).await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn voice_update_reaches_owning_worker() {
        let node = start(60);
        let (opened, rx) = connect(&node, 1, None).await;
        let id = opened.id;

        node.handle.message(id, play("5"));
        assert_eq!(next_event(&rx).await["type"], "TrackStartEvent");

        node.handle.message(
            id,
            IncomingMessage::VoiceUpdate(VoiceUpdate {
                guild_id: "5".into(),
                session_id: "session".into(),
                event: serde_json::json!({ "token": "t", "endpoint": "e" }),
            }),
        );
        let update = next_event(&rx).await;
        assert_eq!(update["op"], "playerUpdate");
        assert_eq!(update["guildId"], "5");
        assert_eq!(update["state"]["connected"], true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn voice_state_cached_before_play_reaches_new_player() {
        let node = start(60);
        let (opened, rx) = connect(&node, 1, None).await;

        node.handle.message(
            opened.id,
            IncomingMessage::VoiceUpdate(VoiceUpdate {
                guild_id: "7".into(),
                session_id: "session".into(),
                event: serde_json::json!({ "token": "t", "endpoint": "e" }),
            }),
        );
        // Nobody owns the player yet, so the update itself reaches no one.
        node.handle.message(opened.id, play("7"));

        assert_eq!(next_event(&rx).await["type"], "TrackStartEvent");
        let update = next_event(&rx).await;
        assert_eq!(update["op"], "playerUpdate");
        assert_eq!(update["guildId"], "7");
        assert_eq!(update["state"]["connected"], true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ops_without_guild_are_ignored() {
        let node = start(60);
        let (opened, rx) = connect(&node, 1, None).await;

        node.handle.message(opened.id, play(""));
        node.handle.message(
            opened.id,
            IncomingMessage::Stop(GuildCommand { guild_id: "".into() }),
        );
        node.handle.message(opened.id, play("3"));

        let started = next_event(&rx).await;
        assert_eq!(started["type"], "TrackStartEvent");
        assert_eq!(started["guildId"], "3");
        assert_eq!(total_players(&node.pool).await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resumed_session_receives_buffered_events_in_order() {
        let node = start(60);
        let (opened_a, rx_a) = connect(&node, 1, None).await;
        let (opened_b, rx_b) = connect(&node, 2, None).await;
        let (a, b) = (opened_a.id, opened_b.id);

        node.handle.message(
            a,
            IncomingMessage::ConfigureResuming(ConfigureResuming {
                key: Some("resume-a".into()),
                timeout: Some(60),
            }),
        );
        node.handle.message(a, play("1"));
        node.handle.message(b, play("1"));
        assert_eq!(next_event(&rx_a).await["type"], "TrackStartEvent");
        assert_eq!(next_event(&rx_b).await["type"], "TrackStartEvent");

        node.handle.closed(a, opened_a.socket);
        assert!(node.handle.can_resume(UserId(1), "resume-a".into()).await);

        node.pool
            .broadcast(Job::for_client(
                UserId(1),
                WorkerOp::Stop {
                    guild_id: "1".into(),
                },
            ))
            .await;
        node.pool
            .broadcast(Job::for_client(
                UserId(1),
                WorkerOp::Play(match play("1") {
                    IncomingMessage::Play(cmd) => cmd,
                    _ => unreachable!(),
                }),
            ))
            .await;

        let (opened, rx_new) = connect(&node, 1, Some("resume-a")).await;
        assert_eq!(opened.id, a);
        assert!(opened.resumed);

        // The stopped player has no track, so the owned play only starts one.
        let first = next_event(&rx_new).await;
        assert_eq!(first["type"], "TrackEndEvent");
        assert_eq!(first["reason"], "STOPPED");
        assert_eq!(next_event(&rx_new).await["type"], "TrackStartEvent");

        node.handle.message(b, IncomingMessage::Stop(GuildCommand { guild_id: "1".into() }));
        let other = next_event(&rx_b).await;
        assert_eq!(other["type"], "TrackEndEvent");
        assert!(rx_new.try_iter().all(|o| match o {
            Outbound::Frame(f) => f.contains("\"stats\""),
            _ => true,
        }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn expired_session_releases_players() {
        let node = start(60);
        let (opened, rx) = connect(&node, 9, None).await;
        let id = opened.id;

        node.handle.message(
            id,
            IncomingMessage::ConfigureResuming(ConfigureResuming {
                key: Some("short".into()),
                timeout: Some(1),
            }),
        );
        node.handle.message(id, play("1"));
        node.handle.message(id, play("2"));
        next_event(&rx).await;
        next_event(&rx).await;
        assert_eq!(total_players(&node.pool).await, 2);

        node.handle.closed(id, opened.socket);
        assert!(node.handle.can_resume(UserId(9), "short".into()).await);
        assert_eq!(total_players(&node.pool).await, 2);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!node.handle.can_resume(UserId(9), "short".into()).await);
        assert_eq!(total_players(&node.pool).await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn messages_from_unknown_connections_are_ignored() {
        let node = start(60);
        node.handle.message(ConnectionId(42), play("1"));
        assert_eq!(total_players(&node.pool).await, 0);
    }
}
