pub mod social;

use std::future::Future;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::auth::handlers;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/register", post(handlers::register))
        .route("/login", post(handlers::login))
        .route("/logout", post(handlers::logout))
        .route("/follow", post(social::follow))
        .route("/posts", post(social::create_post))
        .route("/feed", get(social::feed))
        .route("/me", get(social::me))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Resolves on Ctrl-C. If the handler cannot be installed it never resolves,
/// so the server keeps running until killed.
pub async fn shutdown_signal() {
    wait_for_signal(tokio::signal::ctrl_c()).await;
}

async fn wait_for_signal<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => tracing::info!("Shutting down"),
        Err(e) => {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
