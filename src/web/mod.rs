//! HTTP control surface for the scheduler and run history

mod routes;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tracing::info;

use crate::config::ServerConfig;
use crate::db::Database;
use crate::scheduler::Scheduler;

pub struct AppState {
    pub scheduler: Scheduler,
    pub db: Database,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/scheduler", get(routes::scheduler_status))
        .route("/api/scheduler/arm", post(routes::scheduler_arm))
        .route("/api/scheduler/cancel", post(routes::scheduler_cancel))
        .route("/api/scheduler/run-now", post(routes::scheduler_run_now))
        .route("/api/runs", get(routes::list_runs))
        .route("/api/runs/:run_id", get(routes::show_run))
        .with_state(state)
}

pub async fn start_server(config: &ServerConfig, state: Arc<AppState>) -> Result<()> {
    let app = create_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Control API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
