// One task per room turns replica events into frames for the other peers.
// Events are consumed in emission order, which keeps each origin's frames
// FIFO for every recipient.

use std::sync::Weak;

use nextdesk_common::protocol::{Frame, SyncFrame};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use super::Room;
use crate::replica::ReplicaEvent;

pub(super) fn spawn(
    room: Weak<Room>,
    mut events: mpsc::UnboundedReceiver<ReplicaEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(room) = room.upgrade() else {
                break;
            };

            let (frame, origin) = frame_for(event);
            let delivered = room.fan_out(&frame, origin).await;
            trace!(room = %room.name(), kind = frame.kind(), delivered, "fanned out replica event");
        }
    })
}

fn frame_for(event: ReplicaEvent) -> (Frame, Option<u64>) {
    match event {
        ReplicaEvent::Update { update, origin } => (Frame::Sync(SyncFrame::Update(update)), origin),
        ReplicaEvent::Presence { delta, origin } => (Frame::Awareness(delta), origin),
    }
}
