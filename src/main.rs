//! Postrider server binary.
//!
//! Wires config, logging, the Redis queues and the SQLite store
//! together, then runs the sender worker pool until interrupted.
//! Gateway handlers are registered by the embedding application; run
//! standalone this serves the queue engine and dethrottler only.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{info, warn};

use postrider::backend::Backend;
use postrider::channels::HandlerRegistry;
use postrider::config::Config;
use postrider::queue::RedisQueue;
use postrider::server::Server;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;

    let _logging_guard = postrider::logging::init_production(&config.logs_dir, &config.log_level)
        .context("failed to initialise logging")?;

    info!("postrider starting");

    let db_options: SqliteConnectOptions = config
        .database_url
        .parse()
        .context("invalid database URL")?;
    let db = SqlitePoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect_with(db_options)
        .await
        .context("failed to open database")?;

    let outgoing = RedisQueue::connect(&config.redis_url, &config.msg_queue)
        .await
        .context("failed to connect to redis")?;
    let incoming = RedisQueue::connect(&config.redis_url, &config.event_queue)
        .await
        .context("failed to connect to redis")?;

    let backend = Arc::new(Backend::new(db, Arc::new(outgoing), Arc::new(incoming)));
    backend.migrate().await.context("failed to run migrations")?;
    info!("database ready");

    // Handlers come from the embedding application; standalone we run
    // the queue machinery with an empty registry.
    let registry = HandlerRegistry::new();
    if registry.is_empty() {
        warn!("no channel handlers registered; outbound sends will error");
    }

    let mut server = Server::new(backend, registry, config.max_workers);
    server.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    server.stop().await;
    info!("postrider stopped");
    Ok(())
}
