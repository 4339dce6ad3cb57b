// Drives a room's replica from decoded relay frames.

use nextdesk_common::protocol::{Frame, FrameError, SyncFrame};
use thiserror::Error;
use tracing::{debug, warn};

use crate::replica::ReplicaError;
use crate::room::{Room, SessionId};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
}

/// Frames a newly attached session receives: step 1 with the room's state
/// vector, then one awareness frame if anyone is present.
pub async fn initial_frames(room: &Room) -> Result<Vec<Frame>, ProtocolError> {
    let replica = room.replica();
    let mut frames = vec![Frame::Sync(SyncFrame::Step1(replica.encode_state_vector().await))];

    let present: Vec<u64> = replica.presence_states().await.into_keys().collect();
    if !present.is_empty() {
        frames.push(Frame::Awareness(replica.encode_presence_snapshot(&present).await?));
    }
    Ok(frames)
}

/// Decode and apply one inbound binary message. Returns the reply for the
/// sender, if any.
pub async fn handle_binary(
    room: &Room,
    session_id: SessionId,
    bytes: &[u8],
) -> Result<Option<Frame>, ProtocolError> {
    let frame = Frame::decode(bytes)?;
    handle_frame(room, session_id, frame).await
}

pub async fn handle_frame(
    room: &Room,
    session_id: SessionId,
    frame: Frame,
) -> Result<Option<Frame>, ProtocolError> {
    match frame {
        Frame::Sync(message) => {
            debug!(room = %room.name(), session_id, message = message.name(), "sync message");
            let reply = room.replica().apply_merge_message(message, Some(session_id)).await?;
            Ok(reply.map(Frame::Sync))
        }
        Frame::Awareness(delta) => {
            let change = room.replica().apply_presence_delta(&delta, Some(session_id)).await?;
            if !change.is_empty() {
                room.record_presence(session_id, &change).await;
            }
            Ok(None)
        }
        Frame::Unknown(kind) => {
            warn!(room = %room.name(), session_id, kind, "unknown message type");
            Ok(None)
        }
    }
}
