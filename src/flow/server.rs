use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState};
use super::db::{DbHandle, FlowDb};
use super::runtime::FlowRuntime;
use crate::config::FlowToml;

/// Build the full application router.
pub fn build_router(state: Arc<AppState>, dev_mode: bool) -> Router {
    let app = api::api_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Open the database, start the runtime and serve until Ctrl+C.
pub async fn start_server(config: FlowToml) -> Result<()> {
    let server = &config.server;
    let db = FlowDb::new(&server.db_path).with_context(|| {
        format!(
            "Failed to initialize flow database at {}",
            server.db_path.display()
        )
    })?;
    db.set_busy_timeout(server.busy_timeout())?;
    let runtime = FlowRuntime::build(DbHandle::new(db), &config).await?;
    let app = build_router(Arc::new(AppState::from_runtime(&runtime)), server.dev_mode);

    let host = if server.dev_mode { "0.0.0.0" } else { server.host.as_str() };
    let addr = format!("{}:{}", host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, db = %server.db_path.display(), "Flow engine listening");
    println!("Fawkes flow engine running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    runtime.shutdown().await;
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for Ctrl+C; shutting down");
    }
    println!("\nShutting down...");
}
