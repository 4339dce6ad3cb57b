// Room directory: one replica per room name plus the sessions attached to it.
//
// Lock order is directory, then room. Nothing holds a room lock while
// waiting on the directory lock.

mod fanout;
pub mod reaper;

use std::collections::{hash_map::Entry, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use nextdesk_common::protocol::Frame;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::replica::{DocReplica, PresenceChange, ReplicaError};

pub type SessionId = u64;

/// Frames a session may have queued before it is cut off as too slow.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

pub type Outbound = mpsc::Sender<Bytes>;

struct Peer {
    /// `None` once the peer overflowed its queue; its session then sees the
    /// queue close and disconnects.
    outbound: Option<Outbound>,
    presence_ids: HashSet<u64>,
}

struct RoomState {
    peers: HashMap<SessionId, Peer>,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    destroyed: bool,
}

impl RoomState {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }
}

pub struct Room {
    name: String,
    replica: DocReplica,
    state: Mutex<RoomState>,
}

/// Point-in-time view of a room for the metrics probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSnapshot {
    pub id: String,
    pub connections: usize,
    /// Epoch milliseconds.
    #[serde(rename = "lastActivity")]
    pub last_activity: i64,
}

impl Room {
    fn create(name: &str) -> Result<Arc<Self>, ReplicaError> {
        let (replica, events) = DocReplica::new()?;
        let room = Arc::new(Self {
            name: name.to_owned(),
            replica,
            state: Mutex::new(RoomState {
                peers: HashMap::new(),
                last_activity: Instant::now(),
                last_activity_at: Utc::now(),
                destroyed: false,
            }),
        });
        fanout::spawn(Arc::downgrade(&room), events);
        Ok(room)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn replica(&self) -> &DocReplica {
        &self.replica
    }

    pub async fn connections(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    pub async fn is_destroyed(&self) -> bool {
        self.state.lock().await.destroyed
    }

    /// Deliver `frame` to every attached session except `origin`.
    ///
    /// The frame is encoded once. Sends never wait on a recipient: a peer
    /// whose queue is full is cut off, and a closed peer is skipped. Returns
    /// the number of deliveries.
    pub async fn fan_out(&self, frame: &Frame, origin: Option<SessionId>) -> usize {
        let payload = Bytes::from(frame.encode());
        let mut state = self.state.lock().await;
        let mut delivered = 0;

        for (session_id, peer) in state.peers.iter_mut() {
            if Some(*session_id) == origin {
                continue;
            }
            let Some(outbound) = &peer.outbound else {
                continue;
            };

            match outbound.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        room = %self.name,
                        session_id = *session_id,
                        capacity = outbound.max_capacity(),
                        "peer send queue full, disconnecting"
                    );
                    peer.outbound = None;
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(
                        room = %self.name,
                        session_id = *session_id,
                        "failed to deliver frame to peer"
                    );
                }
            }
        }
        delivered
    }

    /// Track presence ids a session now controls.
    pub async fn record_presence(&self, session_id: SessionId, change: &PresenceChange) {
        let mut state = self.state.lock().await;
        if let Some(peer) = state.peers.get_mut(&session_id) {
            peer.presence_ids.extend(change.added.iter().copied());
            peer.presence_ids.extend(change.updated.iter().copied());
            for removed in &change.removed {
                peer.presence_ids.remove(removed);
            }
        }
    }

    pub async fn presence_ids(&self, session_id: SessionId) -> Vec<u64> {
        let state = self.state.lock().await;
        let mut ids: Vec<u64> = state
            .peers
            .get(&session_id)
            .map(|peer| peer.presence_ids.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub async fn snapshot(&self) -> RoomSnapshot {
        let state = self.state.lock().await;
        RoomSnapshot {
            id: self.name.clone(),
            connections: state.peers.len(),
            last_activity: state.last_activity_at.timestamp_millis(),
        }
    }
}

pub struct RoomDirectory {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    inactive_after: Duration,
}

impl RoomDirectory {
    pub fn new(inactive_after: Duration) -> Self {
        Self { rooms: RwLock::new(HashMap::new()), inactive_after }
    }

    /// The room named `name`, created with a fresh replica if absent.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<Room>, ReplicaError> {
        if let Some(existing) = self.rooms.read().await.get(name) {
            return Ok(Arc::clone(existing));
        }

        let mut rooms = self.rooms.write().await;
        match rooms.entry(name.to_owned()) {
            Entry::Occupied(occupied) => Ok(Arc::clone(occupied.get())),
            Entry::Vacant(vacant) => {
                let room = Room::create(name)?;
                info!(room = name, "room created");
                Ok(Arc::clone(vacant.insert(room)))
            }
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Register a session in the room, creating the room if needed.
    pub async fn attach(
        &self,
        name: &str,
        session_id: SessionId,
        outbound: Outbound,
    ) -> Result<Arc<Room>, ReplicaError> {
        loop {
            let room = self.get_or_create(name).await?;
            let mut state = room.state.lock().await;
            if state.destroyed {
                // Lost a race with teardown; the entry is about to disappear.
                drop(state);
                tokio::task::yield_now().await;
                continue;
            }
            state
                .peers
                .insert(session_id, Peer { outbound: Some(outbound), presence_ids: HashSet::new() });
            state.touch();
            drop(state);
            return Ok(room);
        }
    }

    /// Remove a session and retract its presence, or tear the room down if it
    /// was the last one. Returns whether the room was destroyed.
    pub async fn detach(&self, room: &Arc<Room>, session_id: SessionId) -> bool {
        let (presence_ids, now_empty) = {
            let mut state = room.state.lock().await;
            let presence_ids: Vec<u64> = state
                .peers
                .remove(&session_id)
                .map(|peer| peer.presence_ids.into_iter().collect())
                .unwrap_or_default();
            state.touch();
            let now_empty = state.peers.is_empty() && !state.destroyed;
            if now_empty {
                state.destroyed = true;
            }
            (presence_ids, now_empty)
        };

        if now_empty {
            // Unlisted before any other await so a racing attach retries at most
            // one lock hop. Destroying the replica clears all presence.
            self.remove_entry(room).await;
            room.replica.destroy().await;
            info!(room = %room.name, "room destroyed after last disconnect");
            return true;
        }

        if let Err(error) = room.replica.retract_presence(&presence_ids).await {
            warn!(room = %room.name, session_id, %error, "failed to retract presence");
        }
        false
    }

    /// Undo an attach whose setup failed. The room is left for the reaper.
    pub async fn rollback_attach(&self, room: &Arc<Room>, session_id: SessionId) {
        let mut state = room.state.lock().await;
        state.peers.remove(&session_id);
        state.touch();
        if state.peers.is_empty() {
            info!(room = %room.name, "room empty after setup failure, marking for cleanup");
        }
    }

    /// Destroy every room with no sessions that has been idle longer than the
    /// inactivity timeout. Rooms busy with another operation are skipped.
    pub async fn reap_inactive(&self, now: Instant) -> Vec<String> {
        let mut reaped = Vec::new();
        let remaining = {
            let mut rooms = self.rooms.write().await;
            rooms.retain(|name, room| {
                let Ok(mut state) = room.state.try_lock() else {
                    return true;
                };
                let idle = now.saturating_duration_since(state.last_activity);
                if state.peers.is_empty() && idle > self.inactive_after {
                    state.destroyed = true;
                    info!(room = %name, inactive_ms = idle.as_millis() as u64, "room cleaned up");
                    reaped.push(Arc::clone(room));
                    false
                } else {
                    true
                }
            });
            rooms.len()
        };

        for room in &reaped {
            room.replica.destroy().await;
        }
        if !reaped.is_empty() {
            info!(rooms_cleaned = reaped.len(), active_rooms = remaining, "cleanup completed");
        }

        reaped.iter().map(|room| room.name.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }

    /// Snapshots of every room, ordered by name.
    pub async fn snapshot(&self) -> Vec<RoomSnapshot> {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(rooms.len());
        for room in rooms {
            snapshots.push(room.snapshot().await);
        }
        snapshots.sort_by(|left, right| left.id.cmp(&right.id));
        snapshots
    }

    async fn remove_entry(&self, room: &Arc<Room>) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(&room.name).is_some_and(|current| Arc::ptr_eq(current, room)) {
            rooms.remove(&room.name);
            debug!(room = %room.name, "room removed from directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nextdesk_common::protocol::SyncFrame;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn peer_channel() -> (Outbound, mpsc::Receiver<Bytes>) {
        mpsc::channel(16)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_touch_creates_one_replica() {
        let directory = Arc::new(RoomDirectory::new(TIMEOUT));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let directory = Arc::clone(&directory);
                tokio::spawn(async move { directory.get_or_create("shared").await })
            })
            .collect();

        let mut rooms = Vec::new();
        for handle in handles {
            rooms.push(handle.await.expect("task should finish").expect("room should build"));
        }

        assert_eq!(directory.len().await, 1);
        assert!(rooms.iter().all(|room| Arc::ptr_eq(room, &rooms[0])));
    }

    #[tokio::test]
    async fn last_detach_destroys_room_immediately() {
        let directory = RoomDirectory::new(TIMEOUT);
        let (tx_a, _rx_a) = peer_channel();
        let (tx_b, _rx_b) = peer_channel();

        let room = directory.attach("doc", 1, tx_a).await.expect("attach a");
        directory.attach("doc", 2, tx_b).await.expect("attach b");
        assert_eq!(room.connections().await, 2);

        assert!(!directory.detach(&room, 1).await);
        assert_eq!(directory.len().await, 1);

        assert!(directory.detach(&room, 2).await);
        assert!(directory.is_empty().await);
        assert!(room.is_destroyed().await);
        assert!(room.replica().is_destroyed());
    }

    #[tokio::test]
    async fn attach_after_teardown_gets_a_fresh_room() {
        let directory = RoomDirectory::new(TIMEOUT);
        let (tx, _rx) = peer_channel();
        let first = directory.attach("doc", 1, tx).await.expect("attach");
        directory.detach(&first, 1).await;

        let (tx, _rx) = peer_channel();
        let second = directory.attach("doc", 2, tx).await.expect("reattach");
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_destroyed().await);
    }

    #[tokio::test]
    async fn reaper_removes_room_left_by_setup_failure() {
        let directory = RoomDirectory::new(TIMEOUT);
        let (tx, _rx) = peer_channel();
        let room = directory.attach("orphan", 1, tx).await.expect("attach");

        directory.rollback_attach(&room, 1).await;
        assert_eq!(directory.len().await, 1, "setup failure leaves the room for the reaper");

        assert!(directory.reap_inactive(Instant::now()).await.is_empty());

        let later = Instant::now() + TIMEOUT + Duration::from_millis(1);
        assert_eq!(directory.reap_inactive(later).await, vec!["orphan".to_string()]);
        assert!(directory.is_empty().await);
        assert!(room.replica().is_destroyed());
    }

    #[tokio::test]
    async fn reaper_keeps_rooms_with_sessions() {
        let directory = RoomDirectory::new(TIMEOUT);
        let (tx, _rx) = peer_channel();
        directory.attach("busy", 1, tx).await.expect("attach");

        let later = Instant::now() + TIMEOUT * 2;
        assert!(directory.reap_inactive(later).await.is_empty());
        assert_eq!(directory.len().await, 1);
    }

    #[tokio::test]
    async fn fan_out_skips_origin_and_closed_peers() {
        let directory = RoomDirectory::new(TIMEOUT);
        let (tx_origin, mut rx_origin) = peer_channel();
        let (tx_open, mut rx_open) = peer_channel();
        let (tx_closed, rx_closed) = peer_channel();
        let (tx_other, mut rx_other) = peer_channel();

        let room = directory.attach("doc", 1, tx_origin).await.expect("attach");
        directory.attach("doc", 2, tx_open).await.expect("attach");
        directory.attach("doc", 3, tx_closed).await.expect("attach");
        directory.attach("doc", 4, tx_other).await.expect("attach");
        drop(rx_closed);

        let frame = Frame::Sync(SyncFrame::Update(vec![1, 2, 3]));
        let delivered = room.fan_out(&frame, Some(1)).await;

        assert_eq!(delivered, 2);
        assert_eq!(rx_open.try_recv().expect("peer 2").as_ref(), frame.encode().as_slice());
        assert_eq!(rx_other.try_recv().expect("peer 4").as_ref(), frame.encode().as_slice());
        assert!(rx_origin.try_recv().is_err(), "origin must not receive its own frame");
    }

    #[tokio::test]
    async fn fan_out_without_origin_reaches_everyone() {
        let directory = RoomDirectory::new(TIMEOUT);
        let (tx_a, mut rx_a) = peer_channel();
        let (tx_b, mut rx_b) = peer_channel();
        let room = directory.attach("doc", 1, tx_a).await.expect("attach");
        directory.attach("doc", 2, tx_b).await.expect("attach");

        assert_eq!(room.fan_out(&Frame::Awareness(vec![0]), None).await, 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn presence_ownership_follows_changes() {
        let directory = RoomDirectory::new(TIMEOUT);
        let (tx, _rx) = peer_channel();
        let room = directory.attach("doc", 1, tx).await.expect("attach");

        room.record_presence(
            1,
            &PresenceChange { added: vec![10, 11], updated: vec![12], removed: vec![] },
        )
        .await;
        room.record_presence(1, &PresenceChange { removed: vec![11], ..PresenceChange::default() })
            .await;

        assert_eq!(room.presence_ids(1).await, vec![10, 12]);
        assert!(room.presence_ids(99).await.is_empty());
    }

    #[tokio::test]
    async fn snapshot_lists_rooms_by_name() {
        let directory = RoomDirectory::new(TIMEOUT);
        let (tx_a, _rx_a) = peer_channel();
        let (tx_b, _rx_b) = peer_channel();
        let (tx_c, _rx_c) = peer_channel();
        directory.attach("beta", 1, tx_a).await.expect("attach");
        directory.attach("alpha", 2, tx_b).await.expect("attach");
        directory.attach("alpha", 3, tx_c).await.expect("attach");

        let snapshot = directory.snapshot().await;
        let summary: Vec<(&str, usize)> =
            snapshot.iter().map(|room| (room.id.as_str(), room.connections)).collect();
        assert_eq!(summary, vec![("alpha", 2), ("beta", 1)]);
        assert!(snapshot.iter().all(|room| room.last_activity > 0));
    }

    #[tokio::test]
    async fn full_queue_cuts_off_only_the_slow_peer() {
        let directory = RoomDirectory::new(TIMEOUT);
        let (tx_slow, mut rx_slow) = mpsc::channel(1);
        let (tx_fast, mut rx_fast) = peer_channel();
        let room = directory.attach("doc", 1, tx_slow).await.expect("attach slow");
        directory.attach("doc", 2, tx_fast).await.expect("attach fast");
        room.record_presence(1, &PresenceChange { added: vec![5], ..PresenceChange::default() })
            .await;

        let frame = Frame::Awareness(vec![1]);
        assert_eq!(room.fan_out(&frame, None).await, 2);
        assert_eq!(room.fan_out(&frame, None).await, 1, "slow peer is full");
        assert_eq!(room.fan_out(&frame, None).await, 1, "slow peer stays cut off");

        assert!(rx_slow.recv().await.is_some(), "queued frame is still delivered");
        assert!(rx_slow.recv().await.is_none(), "queue closes once drained");
        for _ in 0..3 {
            assert!(rx_fast.try_recv().is_ok());
        }

        assert_eq!(room.connections().await, 2, "cut-off peer stays until its session detaches");
        assert_eq!(room.presence_ids(1).await, vec![5]);
        assert!(!directory.detach(&room, 1).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn attach_racing_last_detach_lands_on_a_live_room() {
        let directory = Arc::new(RoomDirectory::new(TIMEOUT));

        for round in 0..100u64 {
            let (tx, _rx_leaving) = peer_channel();
            let leaving = directory.attach("churn", round * 2, tx).await.expect("attach");
            let presence = PresenceChange { added: vec![round], ..PresenceChange::default() };
            leaving.record_presence(round * 2, &presence).await;

            let detaching = {
                let directory = Arc::clone(&directory);
                let leaving = Arc::clone(&leaving);
                tokio::spawn(async move { directory.detach(&leaving, round * 2).await })
            };
            let (tx, _rx_joining) = peer_channel();
            let joined = tokio::time::timeout(
                Duration::from_secs(1),
                directory.attach("churn", round * 2 + 1, tx),
            )
            .await
            .expect("attach should not stall behind teardown")
            .expect("attach");

            let destroyed = detaching.await.expect("detach task");
            assert!(!joined.is_destroyed().await);
            assert_eq!(destroyed, !Arc::ptr_eq(&joined, &leaving));
            let listed = directory.get("churn").await.expect("joined room stays listed");
            assert!(Arc::ptr_eq(&listed, &joined));

            assert!(directory.detach(&joined, round * 2 + 1).await);
            assert!(directory.is_empty().await);
        }
    }
}
