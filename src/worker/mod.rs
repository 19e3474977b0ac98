pub mod job;
pub mod player;
pub mod pool;

pub use job::*;
pub use player::PlayerWorker;
pub use pool::{Outbox, PoolError, Worker, WorkerPool};
