//! Fixed-size pool of worker threads.
//!
//! Every worker is a long-lived OS thread draining its own bounded job
//! channel, so jobs sent to one worker are handled in submission order. The
//! async side never blocks on a worker: sends use `send_async` and replies
//! come back over oneshot channels guarded by the pool timeout.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::job::{
    DataRequest, Delivery, Job, WorkerEvent, WorkerOutput, WorkerReply,
};
use crate::common::types::{GuildId, UserId};

/// Body of one pool slot. Runs on its own thread and owns its state outright.
pub trait Worker: Send + 'static {
    fn handle(&mut self, job: Job, delivery: Delivery, outbox: &Outbox) -> WorkerReply;
}

/// A worker's way back to the dispatcher for unsolicited output.
#[derive(Clone)]
pub struct Outbox {
    worker: usize,
    tx: flume::Sender<WorkerOutput>,
}

impl Outbox {
    pub(crate) fn new(worker: usize, tx: flume::Sender<WorkerOutput>) -> Self {
        Self { worker, tx }
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn emit(&self, client_id: UserId, guild_id: GuildId, payload: Value) {
        let event = WorkerEvent {
            client_id,
            guild_id,
            payload,
        };
        if self.tx.send(WorkerOutput::Event(event)).is_err() {
            trace!("worker {}: output channel closed, event dropped", self.worker);
        }
    }

    pub fn request(&self, request: DataRequest) {
        let output = WorkerOutput::DataRequest {
            worker: self.worker,
            request,
        };
        if self.tx.send(output).is_err() {
            trace!("worker {}: output channel closed, request dropped", self.worker);
        }
    }
}

struct Envelope {
    job: Job,
    delivery: Delivery,
    reply: oneshot::Sender<WorkerReply>,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker {0} is no longer running")]
    Disconnected(usize),
    #[error("worker {worker} did not answer within {timeout:?}")]
    Timeout { worker: usize, timeout: Duration },
}

struct PoolInner {
    workers: Vec<flume::Sender<Envelope>>,
    timeout: Duration,
    next: AtomicUsize,
}

/// Cheap to clone; all clones talk to the same threads.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Start `size` worker threads built by `factory` and return the pool
    /// together with the receiving end of their shared output channel.
    pub fn spawn<W, F>(
        size: usize,
        queue_capacity: usize,
        timeout: Duration,
        mut factory: F,
    ) -> std::io::Result<(Self, flume::Receiver<WorkerOutput>)>
    where
        W: Worker,
        F: FnMut(usize) -> W,
    {
        let size = size.max(1);
        let (out_tx, out_rx) = flume::unbounded();
        let mut workers = Vec::with_capacity(size);

        for index in 0..size {
            let (tx, rx) = flume::bounded::<Envelope>(queue_capacity.max(1));
            let worker = factory(index);
            let outbox = Outbox::new(index, out_tx.clone());
            std::thread::Builder::new()
                .name(format!("player-worker-{}", index))
                .spawn(move || run_worker(worker, rx, outbox))?;
            workers.push(tx);
        }

        debug!("Started {} worker threads", size);

        Ok((
            Self {
                inner: Arc::new(PoolInner {
                    workers,
                    timeout,
                    next: AtomicUsize::new(0),
                }),
            },
            out_rx,
        ))
    }

    pub fn size(&self) -> usize {
        self.inner.workers.len()
    }

    /// Worker a direct job lands on: a stable hash of the guild id, or
    /// round-robin for jobs without one.
    pub fn placement(&self, job: &Job) -> usize {
        let size = self.size();
        match job.guild_id() {
            Some(guild_id) => {
                let mut hasher = DefaultHasher::new();
                guild_id.hash(&mut hasher);
                (hasher.finish() % size as u64) as usize
            }
            None => self.inner.next.fetch_add(1, Ordering::Relaxed) % size,
        }
    }

    /// Send `job` to exactly one worker.
    pub async fn execute(&self, job: Job) -> Result<WorkerReply, PoolError> {
        let index = self.placement(&job);
        self.submit(index, job, Delivery::Direct).await
    }

    /// Send `job` to every worker and collect replies in worker-index order.
    /// A worker that fails or stays silent past the timeout leaves `None` in
    /// its slot.
    pub async fn broadcast(&self, job: Job) -> Vec<Option<WorkerReply>> {
        let name = job.name();
        let pending = (0..self.size()).map(|index| {
            let job = job.clone();
            async move {
                match self.submit(index, job, Delivery::Broadcast).await {
                    Ok(reply) => Some(reply),
                    Err(e) => {
                        warn!("Broadcast {} degraded: {}", name, e);
                        None
                    }
                }
            }
        });
        join_all(pending).await
    }

    async fn submit(
        &self,
        index: usize,
        job: Job,
        delivery: Delivery,
    ) -> Result<WorkerReply, PoolError> {
        let sender = &self.inner.workers[index];
        let timeout = self.inner.timeout;
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = Envelope {
            job,
            delivery,
            reply: reply_tx,
        };

        let exchange = async {
            sender
                .send_async(envelope)
                .await
                .map_err(|_| PoolError::Disconnected(index))?;
            reply_rx.await.map_err(|_| PoolError::Disconnected(index))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::Timeout {
                worker: index,
                timeout,
            }),
        }
    }
}

fn run_worker<W: Worker>(mut worker: W, jobs: flume::Receiver<Envelope>, outbox: Outbox) {
    while let Ok(Envelope {
        job,
        delivery,
        reply,
    }) = jobs.recv()
    {
        let name = job.name();
        let result = worker.handle(job, delivery, &outbox);
        if reply.send(result).is_err() {
            trace!(
                "worker {}: caller stopped waiting for {}",
                outbox.worker, name
            );
        }
    }
    debug!("worker {} stopped", outbox.worker);
}
