use std::{collections::HashMap, task::Poll, time::Duration};

use tokio::time::Instant;
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::trace;

use crate::{
    common::types::{PlayerKey, UserId},
    worker::VoiceServerState,
};

struct Entry {
    state: VoiceServerState,
    deadline: Instant,
    delay: delay_queue::Key,
}

/// Latest voice credentials per (client, guild), each kept for a fixed TTL
/// after its most recent write.
pub struct VoiceStateCache {
    ttl: Duration,
    entries: HashMap<PlayerKey, Entry>,
    expirations: DelayQueue<PlayerKey>,
}

impl VoiceStateCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            expirations: DelayQueue::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store `state`, superseding both the previous value and its deadline.
    pub fn insert(&mut self, state: VoiceServerState) {
        let key = (state.client_id, state.guild_id.clone());
        let deadline = Instant::now() + self.ttl;

        match self.entries.get_mut(&key) {
            Some(entry) => {
                self.expirations.reset(&entry.delay, self.ttl);
                entry.state = state;
                entry.deadline = deadline;
            }
            None => {
                let delay = self.expirations.insert(key.clone(), self.ttl);
                self.entries.insert(
                    key,
                    Entry {
                        state,
                        deadline,
                        delay,
                    },
                );
            }
        }
    }

    /// Entries past their deadline are never returned, drained or not.
    pub fn get(&self, key: &PlayerKey) -> Option<&VoiceServerState> {
        self.entries
            .get(key)
            .filter(|entry| entry.deadline > Instant::now())
            .map(|entry| &entry.state)
    }

    /// Forget everything stored for `client_id`.
    pub fn remove_client(&mut self, client_id: UserId) -> usize {
        let keys: Vec<PlayerKey> = self
            .entries
            .keys()
            .filter(|(owner, _)| *owner == client_id)
            .cloned()
            .collect();

        for key in &keys {
            if let Some(entry) = self.entries.remove(key) {
                self.expirations.remove(&entry.delay);
            }
        }
        keys.len()
    }

    /// Wait for the next entry to reach its deadline and drop it. Stays
    /// pending while the cache is empty.
    pub async fn next_expired(&mut self) -> PlayerKey {
        let key = std::future::poll_fn(|cx| match self.expirations.poll_expired(cx) {
            Poll::Ready(Some(expired)) => Poll::Ready(expired.into_inner()),
            _ => Poll::Pending,
        })
        .await;

        self.entries.remove(&key);
        trace!("voice state for {}/{} expired", key.0, key.1);
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{self, timeout};

    fn state(user: u64, guild: &str, session: &str) -> VoiceServerState {
        VoiceServerState {
            client_id: UserId(user),
            guild_id: guild.into(),
            session_id: session.into(),
            event: serde_json::json!({ "token": "t", "endpoint": "e" }),
        }
    }

    fn key(user: u64, guild: &str) -> PlayerKey {
        (UserId(user), guild.into())
    }

    #[tokio::test(start_paused = true)]
    async fn entry_disappears_after_ttl_without_draining() {
        let mut cache = VoiceStateCache::new(Duration::from_secs(20));
        cache.insert(state(1, "g", "s1"));

        time::advance(Duration::from_secs(19)).await;
        assert_eq!(cache.get(&key(1, "g")).map(|s| s.session_id.as_str()), Some("s1"));

        time::advance(Duration::from_secs(6)).await;
        assert!(cache.get(&key(1, "g")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rewrite_resets_deadline() {
        let mut cache = VoiceStateCache::new(Duration::from_secs(20));
        cache.insert(state(1, "g", "s1"));

        time::advance(Duration::from_secs(15)).await;
        cache.insert(state(1, "g", "s2"));

        time::advance(Duration::from_secs(15)).await;
        assert_eq!(cache.get(&key(1, "g")).map(|s| s.session_id.as_str()), Some("s2"));
        assert!(
            timeout(Duration::from_millis(1), cache.next_expired())
                .await
                .is_err()
        );

        time::advance(Duration::from_secs(6)).await;
        assert!(cache.get(&key(1, "g")).is_none());
        assert_eq!(cache.next_expired().await, key(1, "g"));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_client_only_touches_that_client() {
        let mut cache = VoiceStateCache::new(Duration::from_secs(20));
        cache.insert(state(1, "a", "s"));
        cache.insert(state(1, "b", "s"));
        cache.insert(state(2, "a", "s"));

        assert_eq!(cache.remove_client(UserId(1)), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key(2, "a")).is_some());

        time::advance(Duration::from_secs(21)).await;
        assert_eq!(cache.next_expired().await, key(2, "a"));
    }
}
