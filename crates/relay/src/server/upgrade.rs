// WebSocket entry point: everything that is not a probe route.

use std::net::SocketAddr;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use nextdesk_common::protocol::CloseReason;
use thiserror::Error;
use url::Url;

use crate::admission::client_ip;
use crate::session::{self, ConnectionRequest};
use crate::state::RelayState;

const DEFAULT_HOST: &str = "localhost";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomNameError {
    #[error("failed to parse request URL: {0}")]
    MalformedUrl(String),
    #[error("missing room ID")]
    Missing,
}

impl RoomNameError {
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::MalformedUrl(_) => CloseReason::MalformedUrl,
            Self::Missing => CloseReason::MissingRoomId,
        }
    }
}

/// Room name for a request: its URL path without the leading slash, resolved
/// against the `Host` header.
pub fn room_name(uri: &Uri, host: Option<&str>) -> Result<String, RoomNameError> {
    let base = Url::parse(&format!("http://{}", host.unwrap_or(DEFAULT_HOST)))
        .map_err(|error| RoomNameError::MalformedUrl(error.to_string()))?;
    let target = uri.path_and_query().map_or("/", |path_and_query| path_and_query.as_str());
    let url = base.join(target).map_err(|error| RoomNameError::MalformedUrl(error.to_string()))?;

    let name = url.path().strip_prefix('/').unwrap_or(url.path());
    if name.is_empty() {
        return Err(RoomNameError::Missing);
    }
    Ok(name.to_owned())
}

pub async fn relay_upgrade(
    State(state): State<RelayState>,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
    uri: Uri,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Ok(upgrade) = upgrade else {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };

    let peer = connect_info.map(|Extension(ConnectInfo(addr))| addr);
    let host = headers.get(header::HOST).and_then(|value| value.to_str().ok());
    let request = ConnectionRequest { ip: client_ip(&headers, peer), room: room_name(&uri, host) };

    let max_payload = state.limits().max_payload;
    upgrade
        .max_message_size(max_payload)
        .max_frame_size(max_payload)
        .on_upgrade(move |socket| session::run(socket, state, request))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(raw: &str) -> Uri {
        raw.parse().expect("test uri should parse")
    }

    #[test]
    fn room_is_the_path_without_leading_slash() {
        assert_eq!(room_name(&uri("/my-room"), Some("relay.local")), Ok("my-room".to_string()));
        assert_eq!(room_name(&uri("/team/notes?token=x"), None), Ok("team/notes".to_string()));
    }

    #[test]
    fn root_path_has_no_room() {
        assert_eq!(room_name(&uri("/"), Some("relay.local")), Err(RoomNameError::Missing));
        assert_eq!(room_name(&uri("/?room=x"), None), Err(RoomNameError::Missing));
    }

    #[test]
    fn unusable_host_is_a_malformed_url() {
        let error = room_name(&uri("/room"), Some("bad host")).expect_err("host should not parse");
        assert!(matches!(error, RoomNameError::MalformedUrl(_)));
        assert_eq!(error.close_reason(), CloseReason::MalformedUrl);
    }

    #[test]
    fn percent_encoding_is_preserved() {
        assert_eq!(room_name(&uri("/caf%C3%A9"), None), Ok("caf%C3%A9".to_string()));
    }

    #[test]
    fn missing_room_maps_to_its_close_reason() {
        assert_eq!(RoomNameError::Missing.close_reason(), CloseReason::MissingRoomId);
    }
}
