use std::net::SocketAddr;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use chirp::auth::session;
use chirp::config::{Cli, Config};
use chirp::db;
use chirp::routes;
use chirp::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI args and load config
    let cli = Cli::parse();
    let data_dir = Config::data_dir(&cli);
    std::fs::create_dir_all(&data_dir)?;

    let config = Config::load(&cli)?;

    // Initialize logging; RUST_LOG beats the configured level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&config.server.log_level))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    tracing::info!("Data directory: {}", data_dir.display());

    // Initialize database
    let pool = db::create_pool(&config.db_path())?;
    db::run_migrations(&pool)?;

    let purged = session::purge_expired(&pool)?;
    if purged > 0 {
        tracing::info!("Purged {} expired sessions", purged);
    }

    // Build app state
    let (state, worker) = AppState::new(pool, config.clone());
    tracing::info!(fanout = ?state.feed.mode(), "Feed service ready");

    let app = routes::router(state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(routes::shutdown_signal())
        .await?;

    // The router owned the last handle to the feed service, so the queue is
    // closed and the worker drains what is left.
    if let Some(worker) = worker {
        tracing::info!("Waiting for pending fan-out");
        worker.await?;
    }

    Ok(())
}
