use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    coordinator::Coordinator,
    websocket::{ws_default_handler, ws_room_handler},
};

pub struct AppState {
    pub coordinator: Coordinator,
    metrics: PrometheusHandle,
    connections: AtomicUsize,
}

impl AppState {
    pub fn new(coordinator: Coordinator, metrics: PrometheusHandle) -> Self {
        Self {
            coordinator,
            metrics,
            connections: AtomicUsize::new(0),
        }
    }

    pub(crate) fn connection_opened(&self) -> usize {
        self.connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn connection_closed(&self) -> usize {
        self.connections.fetch_sub(1, Ordering::Relaxed).saturating_sub(1)
    }

    fn stats(&self) -> StatsResponse {
        let rooms: Vec<RoomStatsEntry> = self
            .coordinator
            .snapshot()
            .into_iter()
            .map(|room| RoomStatsEntry {
                room_id: room.room_id.to_string(),
                members: room.members,
                active_producer: room.active_producer.map(|producer| ProducerStatsEntry {
                    id: producer.id.to_string(),
                    kind: producer.kind.to_string(),
                    owner: producer.owner.to_string(),
                }),
            })
            .collect();
        StatsResponse {
            active_rooms: rooms.len(),
            active_members: rooms.iter().map(|room| room.members).sum(),
            active_connections: self.connections.load(Ordering::Relaxed),
            rooms,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_rooms: usize,
    active_members: usize,
    active_connections: usize,
    rooms: Vec<RoomStatsEntry>,
}

#[derive(Debug, Serialize)]
struct RoomStatsEntry {
    room_id: String,
    members: usize,
    active_producer: Option<ProducerStatsEntry>,
}

#[derive(Debug, Serialize)]
struct ProducerStatsEntry {
    id: String,
    kind: String,
    owner: String,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_default_handler))
        .route("/ws/:room_id", get(ws_room_handler))
        .with_state(state)
}

/// Serves the signaling API on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener.local_addr().context("listener has no local address")?;
    info!("beach-relay listening on {}", local_addr);
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error")
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
