// CORS configuration for the probe endpoints.
//
// Origins come from `CORS_ORIGINS` via `RelayConfig`. WebSocket upgrades are
// not subject to CORS and bypass this layer.

use std::time::Duration;

use axum::http::{header, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

const PREFLIGHT_MAX_AGE: Duration = Duration::from_secs(86_400);

/// Build a [`CorsLayer`] for the configured origins.
///
/// - `["*"]` allows any origin, without credentials.
/// - Any other list allows exactly those origins, with credentials.
///
/// Only `GET`/`OPTIONS` and the `Content-Type` header are allowed; preflight
/// responses are cacheable for a day.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(PREFLIGHT_MAX_AGE);

    if origins.iter().any(|origin| origin == "*") {
        return base.allow_origin(AllowOrigin::any());
    }

    base.allow_origin(parse_origins(origins)).allow_credentials(true)
}

fn parse_origins(origins: &[String]) -> Vec<HeaderValue> {
    origins.iter().filter_map(|origin| HeaderValue::from_str(origin).ok()).collect()
}
