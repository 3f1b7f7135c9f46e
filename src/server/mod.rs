//! HTTP and WebSocket surface of the complaint service.

pub mod http;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use axum::Router;
use axum::routing::{get, post};
use tracing::info;

use crate::flow::{Flow, FlowError};
use crate::gateway::Gateway;
use crate::nodes::{complaint_flow, reject_flow, triage_flow};
use crate::registry::TaskRegistry;
use crate::topics::TopicStore;

/// Everything the handlers share. The flows are built once at startup
/// and reused across requests; per-request state lives in the registry.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TaskRegistry>,
    pub complaint: Arc<Flow>,
    pub triage: Arc<Flow>,
    pub reject: Arc<Flow>,
}

impl AppState {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        topics: Arc<dyn TopicStore>,
    ) -> Result<Self, FlowError> {
        Ok(Self {
            registry: TaskRegistry::new(),
            complaint: Arc::new(complaint_flow(gateway.clone())?),
            triage: Arc::new(triage_flow(gateway, topics)?),
            reject: Arc::new(reject_flow()?),
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/tasks", post(http::create_task))
        .route("/api/tasks/{task_id}/stream", get(http::stream_task))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

pub async fn run_server(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to install ctrl-c handler");
        return;
    }
    info!("shutdown signal received");
}
