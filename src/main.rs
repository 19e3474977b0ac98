use std::sync::Arc;

use emberlink::{
    common::{logger, types::AnyResult},
    configs::Config,
    server::{AppState, Dispatcher},
    sources::SourceManager,
    transport,
    worker::{PlayerWorker, WorkerPool},
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> AnyResult<()> {
    let config = Config::load()?;
    logger::init(&config);

    info!("Starting emberlink v{}", env!("CARGO_PKG_VERSION"));

    let (pool, worker_output) = WorkerPool::spawn(
        config.workers.pool_size(),
        config.workers.queue_capacity,
        config.workers.broadcast_timeout(),
        |_| PlayerWorker::new(),
    )?;
    info!("Spawned {} player workers", pool.size());

    let (dispatcher, handle) = Dispatcher::new(&config.session, pool, worker_output);
    dispatcher.spawn();

    let source_manager = Arc::new(SourceManager::new(&config)?);

    let address = format!("{}:{}", config.server.host, config.server.port);
    if config.server.password.is_none() {
        info!("No password configured, every request will be accepted");
    }

    let shared_state = Arc::new(AppState {
        config,
        dispatcher: handle,
        source_manager,
    });
    let app = transport::router(shared_state);

    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Listening on {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
