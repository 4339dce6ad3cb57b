// One relay connection from admission to detach.

mod governor;

pub use governor::MessageGovernor;

use std::sync::Arc;

use anyhow::Context;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use nextdesk_common::protocol::CloseReason;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::protocol;
use crate::room::{Room, SessionId, OUTBOUND_QUEUE_CAPACITY};
use crate::server::upgrade::RoomNameError;
use crate::state::RelayState;

/// What the upgrade handler learned about a connection before the socket
/// was handed over.
#[derive(Debug)]
pub struct ConnectionRequest {
    pub ip: String,
    pub room: Result<String, RoomNameError>,
}

pub async fn run(mut socket: WebSocket, state: RelayState, request: ConnectionRequest) {
    let ConnectionRequest { ip, room: room_name } = request;
    let mut shutdown = state.shutdown().subscribe();
    if shutdown.is_triggered() {
        close_with(&mut socket, CloseReason::ShuttingDown).await;
        return;
    }

    // Held until the session ends; dropping it frees the global and per-IP slots.
    let _permit = match state.admission().admit(&ip, state.memory_ratio()) {
        Ok(permit) => permit,
        Err(reason) => {
            close_with(&mut socket, reason).await;
            return;
        }
    };

    let room_name = match room_name {
        Ok(room_name) => room_name,
        Err(rejection) => {
            warn!(ip = %ip, error = %rejection, "connection rejected: invalid room");
            close_with(&mut socket, rejection.close_reason()).await;
            return;
        }
    };

    let session_id = state.next_session_id();
    info!(room = %room_name, ip = %ip, session_id, "client connected");

    let (outbound_sender, mut outbound_receiver) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let room = match state.rooms().attach(&room_name, session_id, outbound_sender).await {
        Ok(room) => room,
        Err(error) => {
            error!(room = %room_name, session_id, %error, "failed to create room replica");
            close_with(&mut socket, CloseReason::InternalError).await;
            return;
        }
    };

    if let Err(error) = send_initial_frames(&mut socket, &room).await {
        error!(room = %room_name, session_id, error = %format!("{error:#}"), "error setting up connection");
        state.rooms().rollback_attach(&room, session_id).await;
        close_with(&mut socket, CloseReason::InternalError).await;
        return;
    }

    let mut governor = MessageGovernor::new(state.limits(), Instant::now());

    let close_reason = loop {
        tokio::select! {
            incoming = socket.recv() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(error)) if is_frame_size_violation(&error) => {
                        warn!(room = %room_name, ip = %ip, session_id, %error, "client disconnected: transport size limit exceeded");
                        break Some(CloseReason::PayloadTooLarge);
                    }
                    Some(Err(error)) => {
                        error!(room = %room_name, session_id, %error, "websocket error");
                        break None;
                    }
                    None => break None,
                };

                match message {
                    WsMessage::Binary(payload) => {
                        if let Err(reason) = governor.check(payload.len(), Instant::now()) {
                            log_governor_rejection(&room_name, &ip, session_id, reason, payload.len(), &governor);
                            break Some(reason);
                        }

                        match protocol::handle_binary(&room, session_id, &payload).await {
                            Ok(Some(reply)) => {
                                if socket.send(WsMessage::Binary(reply.encode().into())).await.is_err() {
                                    break None;
                                }
                            }
                            Ok(None) => {}
                            Err(error) => {
                                warn!(room = %room_name, session_id, %error, "error handling message");
                            }
                        }
                    }
                    WsMessage::Text(text) => {
                        let size = text.as_str().len();
                        if let Err(reason) = governor.check(size, Instant::now()) {
                            log_governor_rejection(&room_name, &ip, session_id, reason, size, &governor);
                            break Some(reason);
                        }
                        debug!(room = %room_name, session_id, size, "ignoring text frame");
                    }
                    WsMessage::Ping(payload) => {
                        if socket.send(WsMessage::Pong(payload)).await.is_err() {
                            break None;
                        }
                    }
                    WsMessage::Pong(_) => {}
                    WsMessage::Close(_) => break None,
                }
            }
            outbound = outbound_receiver.recv() => {
                // The room drops our sender once the queue overflows.
                let Some(frame) = outbound else {
                    warn!(room = %room_name, ip = %ip, session_id, "client disconnected: send queue overflowed");
                    break Some(CloseReason::SlowConsumer);
                };
                if socket.send(WsMessage::Binary(frame)).await.is_err() {
                    break None;
                }
            }
            _ = shutdown.triggered() => break Some(CloseReason::ShuttingDown),
        }
    };

    if let Some(reason) = close_reason {
        close_with(&mut socket, reason).await;
    }

    state.rooms().detach(&room, session_id).await;
    info!(room = %room_name, ip = %ip, session_id, "client disconnected");
}

async fn send_initial_frames(socket: &mut WebSocket, room: &Arc<Room>) -> anyhow::Result<()> {
    let frames = protocol::initial_frames(room).await.context("failed to encode initial frames")?;
    for frame in frames {
        socket
            .send(WsMessage::Binary(frame.encode().into()))
            .await
            .with_context(|| format!("failed to send initial frame of kind {}", frame.kind()))?;
    }
    Ok(())
}

fn log_governor_rejection(
    room: &str,
    ip: &str,
    session_id: SessionId,
    reason: CloseReason,
    size: usize,
    governor: &MessageGovernor,
) {
    match reason {
        CloseReason::PayloadTooLarge => {
            warn!(room, ip, session_id, size, "client disconnected: max payload size exceeded");
        }
        _ => {
            warn!(
                room,
                ip,
                session_id,
                rate = governor.messages_in_window(),
                "client disconnected: message rate limit exceeded"
            );
        }
    }
}

pub(crate) fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_with(socket: &mut WebSocket, reason: CloseReason) {
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code: reason.code(),
            reason: reason.reason().to_string().into(),
        })))
        .await;
}
