//! Bookkeeping for accepted websocket connections and their resume windows.

use std::{
    collections::{HashMap, VecDeque},
    task::Poll,
    time::Duration,
};

use tokio_util::{
    sync::CancellationToken,
    time::{DelayQueue, delay_queue},
};
use tracing::{debug, info, warn};

use crate::common::types::{ConnectionId, PlayerKey, UserId};

/// Upper bound on frames held for a disconnected session; the oldest frame
/// is dropped first.
const MAX_BUFFERED_EVENTS: usize = 1000;

/// What a connection task is asked to put on its socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(String),
    Ping,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("resume key is already held by connection {0}")]
    ResumeKeyInUse(ConnectionId),
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}

/// The registry's end of one accepted socket.
///
/// The registry keeps a receiver on the outbound queue too, so whatever the
/// socket task never wrote can be pulled back into the resume buffer when the
/// socket goes away.
#[derive(Debug, Clone)]
pub struct SocketLink {
    sender: flume::Sender<Outbound>,
    backlog: flume::Receiver<Outbound>,
    cancel: CancellationToken,
}

/// The connection task's end of a [`SocketLink`].
#[derive(Debug)]
pub struct SocketEnd {
    pub outbound: flume::Receiver<Outbound>,
    /// Cancelled when the registry gives up on the socket.
    pub cancel: CancellationToken,
}

impl SocketLink {
    pub fn new() -> (Self, SocketEnd) {
        let (sender, outbound) = flume::unbounded();
        let cancel = CancellationToken::new();
        let link = Self {
            sender,
            backlog: outbound.clone(),
            cancel: cancel.clone(),
        };
        (link, SocketEnd { outbound, cancel })
    }

    fn send(&self, outbound: Outbound) -> bool {
        self.sender.send(outbound).is_ok()
    }

    /// Stop the socket task and hand back every frame it did not take.
    fn sever(self) -> Vec<String> {
        self.cancel.cancel();
        self.backlog
            .drain()
            .filter_map(|outbound| match outbound {
                Outbound::Frame(frame) => Some(frame),
                Outbound::Ping => None,
            })
            .collect()
    }
}

struct ClientConnection {
    user_id: UserId,
    /// `None` while the connection waits to be resumed.
    link: Option<SocketLink>,
    /// Bumped on every open or resume so a late close from a replaced socket
    /// is recognized.
    socket: u64,
    resume_key: Option<String>,
    resume_timeout: Duration,
    alive: bool,
}

struct PendingResume {
    connection: ConnectionId,
    events: VecDeque<String>,
    delay: delay_queue::Key,
}

impl PendingResume {
    fn push(&mut self, frame: String) {
        if self.events.len() >= MAX_BUFFERED_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(frame);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opened {
    pub id: ConnectionId,
    pub resumed: bool,
    /// Identifies this particular socket; passed back on close.
    pub socket: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closed {
    Removed { user_id: UserId },
    PendingResume { user_id: UserId, timeout: Duration },
}

impl Closed {
    pub fn user_id(&self) -> UserId {
        match self {
            Self::Removed { user_id } | Self::PendingResume { user_id, .. } => *user_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Sent,
    Buffered,
    Dropped,
}

/// A resume window that ran out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired {
    pub connection: ConnectionId,
    pub user_id: UserId,
    pub key: String,
}

pub struct ConnectionRegistry {
    next_id: u64,
    next_socket: u64,
    default_resume_timeout: Duration,
    connections: HashMap<ConnectionId, ClientConnection>,
    pending: HashMap<String, PendingResume>,
    expirations: DelayQueue<String>,
    routes: HashMap<PlayerKey, ConnectionId>,
}

impl ConnectionRegistry {
    pub fn new(default_resume_timeout: Duration) -> Self {
        Self {
            next_id: 1,
            next_socket: 1,
            default_resume_timeout,
            connections: HashMap::new(),
            pending: HashMap::new(),
            expirations: DelayQueue::new(),
            routes: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn user_id(&self, id: ConnectionId) -> Option<UserId> {
        self.connections.get(&id).map(|c| c.user_id)
    }

    /// Whether `key` names a session of `user_id` that is waiting to be resumed.
    pub fn can_resume(&self, user_id: UserId, key: &str) -> bool {
        self.pending
            .get(key)
            .and_then(|p| self.connections.get(&p.connection))
            .is_some_and(|c| c.user_id == user_id)
    }

    /// Register an upgraded socket. A matching resume key rebinds the pending
    /// entry to `link` and flushes everything buffered while it was away.
    pub fn open(&mut self, user_id: UserId, resume_key: Option<&str>, link: SocketLink) -> Opened {
        let socket = self.next_socket;
        self.next_socket += 1;

        if let Some(key) = resume_key.filter(|key| self.can_resume(user_id, key)) {
            if let Some(pending) = self.pending.remove(key) {
                self.expirations.remove(&pending.delay);
                if let Some(connection) = self.connections.get_mut(&pending.connection) {
                    info!(
                        "Resumed session {} with key {}, replaying {} events",
                        pending.connection,
                        key,
                        pending.events.len()
                    );
                    for frame in pending.events {
                        link.send(Outbound::Frame(frame));
                    }
                    connection.link = Some(link);
                    connection.socket = socket;
                    connection.alive = true;
                    return Opened {
                        id: pending.connection,
                        resumed: true,
                        socket,
                    };
                }
            }
        }

        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.connections.insert(
            id,
            ClientConnection {
                user_id,
                link: Some(link),
                socket,
                resume_key: None,
                resume_timeout: self.default_resume_timeout,
                alive: true,
            },
        );
        info!("Connection {} established for client {}", id, user_id);

        Opened {
            id,
            resumed: false,
            socket,
        }
    }

    /// Set or clear the resume key of `id`. Keys are unique across every
    /// registered connection.
    pub fn configure_resuming(
        &mut self,
        id: ConnectionId,
        key: Option<String>,
        timeout_secs: Option<u64>,
    ) -> Result<(), RegistryError> {
        if let Some(key) = key.as_deref() {
            let holder = self
                .connections
                .iter()
                .find(|(other, c)| **other != id && c.resume_key.as_deref() == Some(key));
            if let Some((other, _)) = holder {
                return Err(RegistryError::ResumeKeyInUse(*other));
            }
        }

        let default_timeout = self.default_resume_timeout;
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;
        connection.resume_timeout = timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);
        debug!(
            "Connection {} resume key {:?}, timeout {:?}",
            id, key, connection.resume_timeout
        );
        connection.resume_key = key;
        Ok(())
    }

    /// Handle socket `socket` of connection `id` going away. A close from a
    /// socket that was already detached or replaced by a resume is ignored.
    pub fn close(&mut self, id: ConnectionId, socket: u64) -> Option<Closed> {
        let connection = self.connections.get(&id)?;
        if connection.socket != socket || connection.link.is_none() {
            debug!("Ignoring close of stale socket {} on {}", socket, id);
            return None;
        }
        self.detach(id)
    }

    /// Drop the socket of `id`. Connections with a resume key are parked and
    /// keep receiving events into their buffer, starting with whatever the
    /// socket never wrote, until they resume or expire.
    fn detach(&mut self, id: ConnectionId) -> Option<Closed> {
        let connection = self.connections.get_mut(&id)?;
        let link = connection.link.take()?;
        let user_id = connection.user_id;
        let unsent = link.sever();

        match connection.resume_key.clone() {
            Some(key) => {
                let timeout = connection.resume_timeout;
                let delay = self.expirations.insert(key.clone(), timeout);
                let mut pending = PendingResume {
                    connection: id,
                    events: VecDeque::new(),
                    delay,
                };
                for frame in unsent {
                    pending.push(frame);
                }
                info!(
                    "Connection {} closed, resumable within {:?} with key {} ({} unsent events kept)",
                    id,
                    timeout,
                    key,
                    pending.events.len()
                );
                self.pending.insert(key, pending);
                Some(Closed::PendingResume { user_id, timeout })
            }
            None => {
                self.remove(id);
                info!("Connection {} closed", id);
                Some(Closed::Removed { user_id })
            }
        }
    }

    /// Wait for the next resume window to run out and purge its connection.
    /// Stays pending while nothing is parked.
    pub async fn next_expired(&mut self) -> Expired {
        loop {
            let key = std::future::poll_fn(|cx| match self.expirations.poll_expired(cx) {
                Poll::Ready(Some(expired)) => Poll::Ready(expired.into_inner()),
                _ => Poll::Pending,
            })
            .await;

            let Some(pending) = self.pending.remove(&key) else {
                continue;
            };
            let Some(user_id) = self.remove(pending.connection) else {
                continue;
            };
            info!(
                "Resume window for {} expired, dropping {} buffered events",
                pending.connection,
                pending.events.len()
            );
            return Expired {
                connection: pending.connection,
                user_id,
                key,
            };
        }
    }

    /// Point events for `key` at connection `id`.
    pub fn bind_route(&mut self, key: PlayerKey, id: ConnectionId) {
        self.routes.insert(key, id);
    }

    pub fn route_event(&mut self, key: &PlayerKey, frame: String) -> Routed {
        let Some(connection) = self.routes.get(key).and_then(|id| self.connections.get(id)) else {
            return Routed::Dropped;
        };

        // The link holds a receiver of its own, so a send only fails once it
        // is gone.
        if let Some(link) = &connection.link {
            return if link.send(Outbound::Frame(frame)) {
                Routed::Sent
            } else {
                Routed::Dropped
            };
        }

        let Some(pending) = connection
            .resume_key
            .as_ref()
            .and_then(|k| self.pending.get_mut(k))
        else {
            return Routed::Dropped;
        };
        pending.push(frame);
        Routed::Buffered
    }

    pub fn send_to(&self, id: ConnectionId, frame: String) -> bool {
        self.connections
            .get(&id)
            .and_then(|c| c.link.as_ref())
            .is_some_and(|link| link.send(Outbound::Frame(frame)))
    }

    pub fn mark_alive(&mut self, id: ConnectionId) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.alive = true;
        }
    }

    /// Liveness sweep: connections that never answered the previous ping are
    /// cancelled and closed here, the rest get a fresh ping and `stats_frame`.
    pub fn heartbeat(&mut self, stats_frame: &str) -> Vec<(ConnectionId, Closed)> {
        let mut silent = Vec::new();

        for (id, connection) in self.connections.iter_mut() {
            let Some(link) = &connection.link else {
                continue;
            };
            if !connection.alive {
                silent.push(*id);
                continue;
            }
            connection.alive = false;
            link.send(Outbound::Ping);
            link.send(Outbound::Frame(stats_frame.to_string()));
        }

        silent
            .into_iter()
            .filter_map(|id| {
                warn!("Connection {} missed its heartbeat, terminating", id);
                self.detach(id).map(|closed| (id, closed))
            })
            .collect()
    }

    fn remove(&mut self, id: ConnectionId) -> Option<UserId> {
        let connection = self.connections.remove(&id)?;
        self.routes.retain(|_, route| *route != id);
        Some(connection.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{self, timeout};

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Duration::from_secs(60))
    }

    fn key(user: u64, guild: &str) -> PlayerKey {
        (UserId(user), guild.into())
    }

    fn socket() -> (SocketLink, flume::Receiver<Outbound>) {
        let (link, end) = SocketLink::new();
        (link, end.outbound)
    }

    fn frames(rx: &flume::Receiver<Outbound>) -> Vec<Outbound> {
        rx.try_iter().collect()
    }

    fn frame(text: &str) -> Outbound {
        Outbound::Frame(text.into())
    }

    #[tokio::test]
    async fn plain_close_removes_connection_and_routes() {
        let mut registry = registry();
        let (link, rx) = socket();
        let opened = registry.open(UserId(1), None, link);
        assert!(!opened.resumed);

        registry.bind_route(key(1, "g"), opened.id);
        assert_eq!(registry.route_event(&key(1, "g"), "a".into()), Routed::Sent);
        assert_eq!(frames(&rx), vec![frame("a")]);

        assert_eq!(
            registry.close(opened.id, opened.socket),
            Some(Closed::Removed { user_id: UserId(1) })
        );
        assert!(registry.is_empty());
        assert_eq!(registry.route_event(&key(1, "g"), "b".into()), Routed::Dropped);
        assert_eq!(registry.close(opened.id, opened.socket), None);
    }

    #[tokio::test]
    async fn resume_replays_in_order_without_leaking() {
        let mut registry = registry();
        let (link_a, _rx_a) = socket();
        let (link_b, rx_b) = socket();
        let a = registry.open(UserId(1), None, link_a);
        let b = registry.open(UserId(2), None, link_b).id;
        registry.configure_resuming(a.id, Some("A".into()), Some(30)).unwrap();
        registry.bind_route(key(1, "g"), a.id);
        registry.bind_route(key(2, "g"), b);

        assert!(matches!(
            registry.close(a.id, a.socket),
            Some(Closed::PendingResume { timeout, .. }) if timeout == Duration::from_secs(30)
        ));
        for i in 0..3 {
            assert_eq!(
                registry.route_event(&key(1, "g"), format!("e{}", i)),
                Routed::Buffered
            );
        }
        assert_eq!(registry.route_event(&key(2, "g"), "other".into()), Routed::Sent);

        assert!(registry.can_resume(UserId(1), "A"));
        assert!(!registry.can_resume(UserId(2), "A"));
        assert!(!registry.can_resume(UserId(1), "B"));

        let (link_new, rx_new) = socket();
        let opened = registry.open(UserId(1), Some("A"), link_new);
        assert_eq!(opened.id, a.id);
        assert!(opened.resumed);
        assert_eq!(frames(&rx_new), vec![frame("e0"), frame("e1"), frame("e2")]);
        assert_eq!(frames(&rx_b), vec![frame("other")]);

        assert_eq!(registry.route_event(&key(1, "g"), "live".into()), Routed::Sent);
        assert_eq!(frames(&rx_new), vec![frame("live")]);
        assert!(!registry.can_resume(UserId(1), "A"));
    }

    #[tokio::test]
    async fn frames_left_on_a_dead_socket_are_replayed_first() {
        let mut registry = registry();
        let (link, end) = SocketLink::new();
        let a = registry.open(UserId(1), None, link);
        registry.configure_resuming(a.id, Some("k".into()), None).unwrap();
        registry.bind_route(key(1, "g"), a.id);

        // The socket task is gone but its close has not been handled yet.
        assert_eq!(registry.route_event(&key(1, "g"), "e1".into()), Routed::Sent);
        assert!(matches!(
            registry.close(a.id, a.socket),
            Some(Closed::PendingResume { .. })
        ));
        assert!(end.cancel.is_cancelled());
        drop(end);
        assert_eq!(registry.route_event(&key(1, "g"), "e2".into()), Routed::Buffered);

        let (link, rx) = socket();
        let resumed = registry.open(UserId(1), Some("k"), link);
        assert!(resumed.resumed);
        assert_eq!(frames(&rx), vec![frame("e1"), frame("e2")]);

        // A late close from the replaced socket leaves the resumed one alone.
        assert_eq!(registry.close(a.id, a.socket), None);
        assert_eq!(registry.route_event(&key(1, "g"), "e3".into()), Routed::Sent);
        assert_eq!(frames(&rx), vec![frame("e3")]);
    }

    #[tokio::test]
    async fn parked_sessions_keep_separate_buffers() {
        let mut registry = registry();
        let (link_a, _rx_a) = socket();
        let (link_b, _rx_b) = socket();
        let a = registry.open(UserId(1), None, link_a);
        let b = registry.open(UserId(1), None, link_b);
        registry.configure_resuming(a.id, Some("A".into()), None).unwrap();
        registry.configure_resuming(b.id, Some("B".into()), None).unwrap();
        registry.bind_route(key(1, "g1"), a.id);
        registry.bind_route(key(1, "g2"), b.id);
        registry.close(a.id, a.socket);
        registry.close(b.id, b.socket);

        for i in 0..2 {
            registry.route_event(&key(1, "g1"), format!("a{}", i));
            registry.route_event(&key(1, "g2"), format!("b{}", i));
        }

        let (link, rx_b) = socket();
        assert_eq!(registry.open(UserId(1), Some("B"), link).id, b.id);
        assert_eq!(frames(&rx_b), vec![frame("b0"), frame("b1")]);

        registry.route_event(&key(1, "g1"), "a2".into());
        let (link, rx_a) = socket();
        assert_eq!(registry.open(UserId(1), Some("A"), link).id, a.id);
        assert_eq!(frames(&rx_a), vec![frame("a0"), frame("a1"), frame("a2")]);
        assert!(frames(&rx_b).is_empty());
    }

    #[tokio::test]
    async fn resume_key_is_unique_and_scoped_to_own_entry() {
        let mut registry = registry();
        let (link_a, _rx_a) = socket();
        let (link_b, _rx_b) = socket();
        let a = registry.open(UserId(1), None, link_a);
        let b = registry.open(UserId(1), None, link_b);

        registry.configure_resuming(a.id, Some("k".into()), None).unwrap();
        assert_eq!(
            registry.configure_resuming(b.id, Some("k".into()), None),
            Err(RegistryError::ResumeKeyInUse(a.id))
        );
        registry.configure_resuming(a.id, Some("k".into()), Some(5)).unwrap();

        assert_eq!(
            registry.close(b.id, b.socket),
            Some(Closed::Removed { user_id: UserId(1) })
        );
        assert!(matches!(
            registry.close(a.id, a.socket),
            Some(Closed::PendingResume { .. })
        ));

        assert_eq!(
            registry.configure_resuming(ConnectionId(99), None, None),
            Err(RegistryError::UnknownConnection(ConnectionId(99)))
        );
    }

    #[tokio::test]
    async fn cleared_key_closes_normally() {
        let mut registry = registry();
        let (link, _rx) = socket();
        let a = registry.open(UserId(1), None, link);
        registry.configure_resuming(a.id, Some("k".into()), None).unwrap();
        registry.configure_resuming(a.id, None, None).unwrap();

        assert_eq!(
            registry.close(a.id, a.socket),
            Some(Closed::Removed { user_id: UserId(1) })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_resume_purges_entry() {
        let mut registry = registry();
        let (link, _rx) = socket();
        let a = registry.open(UserId(7), None, link);
        registry.configure_resuming(a.id, Some("k".into()), Some(5)).unwrap();
        registry.bind_route(key(7, "g"), a.id);
        registry.close(a.id, a.socket);

        time::advance(Duration::from_secs(4)).await;
        assert!(
            timeout(Duration::from_millis(1), registry.next_expired())
                .await
                .is_err()
        );

        time::advance(Duration::from_secs(2)).await;
        let expired = registry.next_expired().await;
        assert_eq!(
            expired,
            Expired {
                connection: a.id,
                user_id: UserId(7),
                key: "k".into()
            }
        );
        assert!(registry.is_empty());
        assert!(!registry.can_resume(UserId(7), "k"));
        assert_eq!(registry.route_event(&key(7, "g"), "late".into()), Routed::Dropped);

        let (link, _rx) = socket();
        assert!(!registry.open(UserId(7), Some("k"), link).resumed);
    }

    #[tokio::test]
    async fn heartbeat_terminates_silent_connections() {
        let mut registry = registry();
        let (link_a, end_a) = SocketLink::new();
        let (link_b, rx_b) = socket();
        let a = registry.open(UserId(1), None, link_a);
        let b = registry.open(UserId(2), None, link_b).id;

        assert!(registry.heartbeat("stats").is_empty());
        assert_eq!(frames(&end_a.outbound), vec![Outbound::Ping, frame("stats")]);
        frames(&rx_b);

        registry.mark_alive(b);
        assert_eq!(
            registry.heartbeat("stats"),
            vec![(a.id, Closed::Removed { user_id: UserId(1) })]
        );
        assert!(end_a.cancel.is_cancelled());
        assert!(registry.user_id(a.id).is_none());
        assert_eq!(registry.close(a.id, a.socket), None);
        assert_eq!(frames(&rx_b), vec![Outbound::Ping, frame("stats")]);
    }

    #[tokio::test]
    async fn stuck_resumable_socket_is_parked_with_its_backlog() {
        let mut registry = registry();
        let (link, end) = SocketLink::new();
        let a = registry.open(UserId(1), None, link);
        registry.configure_resuming(a.id, Some("k".into()), None).unwrap();
        registry.bind_route(key(1, "g"), a.id);

        // Nothing is read from the socket from here on.
        registry.heartbeat("stats");
        registry.route_event(&key(1, "g"), "e1".into());
        let terminated = registry.heartbeat("stats");
        assert_eq!(terminated.len(), 1);
        assert!(matches!(terminated[0], (id, Closed::PendingResume { .. }) if id == a.id));
        assert!(end.cancel.is_cancelled());
        assert!(frames(&end.outbound).is_empty());

        assert_eq!(registry.route_event(&key(1, "g"), "e2".into()), Routed::Buffered);
        let (link, rx) = socket();
        assert!(registry.open(UserId(1), Some("k"), link).resumed);
        assert_eq!(frames(&rx), vec![frame("stats"), frame("e1"), frame("e2")]);
    }

    #[tokio::test]
    async fn buffer_keeps_newest_events() {
        let mut registry = registry();
        let (link, _rx) = socket();
        let a = registry.open(UserId(1), None, link);
        registry.configure_resuming(a.id, Some("k".into()), None).unwrap();
        registry.bind_route(key(1, "g"), a.id);
        registry.close(a.id, a.socket);

        for i in 0..MAX_BUFFERED_EVENTS + 2 {
            registry.route_event(&key(1, "g"), i.to_string());
        }

        let (link, rx) = socket();
        registry.open(UserId(1), Some("k"), link);
        let replayed = frames(&rx);
        assert_eq!(replayed.len(), MAX_BUFFERED_EVENTS);
        assert_eq!(replayed[0], frame("2"));
    }
}
