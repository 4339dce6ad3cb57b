pub mod probe;
pub mod upgrade;

use std::future::Future;
use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Context;
use axum::{
    body::Body,
    http::{header::HeaderValue, Request},
    middleware::{self, Next},
    response::Response,
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

use crate::cors::cors_layer;
use crate::state::RelayState;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Probe routes with CORS and request logging; every other path is a relay
/// WebSocket endpoint.
pub fn build_router(state: RelayState, cors_origins: &[String]) -> Router {
    let probes = Router::new()
        .route("/health", get(probe::health))
        .route("/metrics", get(probe::metrics))
        .layer(cors_layer(cors_origins))
        .layer(middleware::from_fn(request_context_middleware));

    Router::new().merge(probes).fallback(upgrade::relay_upgrade).with_state(state)
}

pub async fn serve<F>(
    listener: TcpListener,
    state: RelayState,
    cors_origins: &[String],
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state, cors_origins);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await
        .context("relay server exited unexpectedly")
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = next.run(request).await;

    if let Ok(request_id_header) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, request_id_header);
    }

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
