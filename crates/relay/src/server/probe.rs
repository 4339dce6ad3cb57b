// Read-only liveness and metrics probes over the room directory.

use axum::extract::State;
use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::room::RoomSnapshot;
use crate::state::RelayState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Seconds since the relay started.
    pub uptime: f64,
    pub rooms: usize,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsResponse {
    pub rooms: Vec<RoomSnapshot>,
    pub total_rooms: usize,
    pub total_connections: usize,
}

pub async fn health(State(state): State<RelayState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        uptime: state.uptime().as_secs_f64(),
        rooms: state.rooms().len().await,
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

pub async fn metrics(State(state): State<RelayState>) -> Json<MetricsResponse> {
    let rooms = state.rooms().snapshot().await;
    let total_connections = rooms.iter().map(|room| room.connections).sum();
    Json(MetricsResponse { total_rooms: rooms.len(), total_connections, rooms })
}
