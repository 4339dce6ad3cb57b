// Per-room document replica: a yrs document plus its awareness (presence)
// layer. Mutations are reported as `ReplicaEvent`s on a channel so the room
// can fan them out without the replica knowing about transports.

use std::collections::BTreeMap;
use std::sync::Mutex as StdMutex;

use nextdesk_common::protocol::SyncFrame;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use yrs::sync::{Awareness, AwarenessUpdate};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Subscription, Transact, Update};

use crate::room::SessionId;

const SESSION_ORIGIN_PREFIX: &str = "session:";

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("failed to register document observer: {0}")]
    Observe(String),
    #[error("invalid state vector: {0}")]
    StateVector(String),
    #[error("invalid document update: {0}")]
    DecodeUpdate(String),
    #[error("failed to apply document update: {0}")]
    ApplyUpdate(String),
    #[error("invalid presence delta: {0}")]
    DecodePresence(String),
    #[error("failed to apply presence delta: {0}")]
    ApplyPresence(String),
    #[error("failed to encode presence: {0}")]
    EncodePresence(String),
}

/// Something changed in the replica and peers should hear about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaEvent {
    Update { update: Vec<u8>, origin: Option<SessionId> },
    Presence { delta: Vec<u8>, origin: Option<SessionId> },
}

/// Presence client ids touched by one applied delta.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl PresenceChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

pub struct DocReplica {
    awareness: Mutex<Awareness>,
    subscription: StdMutex<Option<Subscription>>,
    events: mpsc::UnboundedSender<ReplicaEvent>,
}

impl DocReplica {
    pub fn new() -> Result<(Self, mpsc::UnboundedReceiver<ReplicaEvent>), ReplicaError> {
        let (events, receiver) = mpsc::unbounded_channel();
        let doc = Doc::new();

        let observer = events.clone();
        let subscription = doc
            .observe_update_v1(move |txn, event| {
                let origin = txn.origin().and_then(session_from_origin);
                // The receiver only goes away with the room.
                let _ = observer.send(ReplicaEvent::Update { update: event.update.clone(), origin });
            })
            .map_err(|error| ReplicaError::Observe(error.to_string()))?;

        let awareness = Awareness::new(doc);
        awareness.clean_local_state();

        Ok((
            Self {
                awareness: Mutex::new(awareness),
                subscription: StdMutex::new(Some(subscription)),
                events,
            },
            receiver,
        ))
    }

    pub async fn encode_state_vector(&self) -> Vec<u8> {
        let awareness = self.awareness.lock().await;
        let state_vector = awareness.doc().transact().state_vector();
        state_vector.encode_v1()
    }

    /// Feed one sync message into the document.
    ///
    /// Step 1 yields the step 2 diff for the requester. Step 2 and updates are
    /// merged under `origin` and surface as a [`ReplicaEvent::Update`].
    pub async fn apply_merge_message(
        &self,
        message: SyncFrame,
        origin: Option<SessionId>,
    ) -> Result<Option<SyncFrame>, ReplicaError> {
        let awareness = self.awareness.lock().await;
        let doc = awareness.doc();

        match message {
            SyncFrame::Step1(state_vector) => {
                let state_vector = StateVector::decode_v1(&state_vector)
                    .map_err(|error| ReplicaError::StateVector(error.to_string()))?;
                let diff = doc.transact().encode_state_as_update_v1(&state_vector);
                Ok(Some(SyncFrame::Step2(diff)))
            }
            SyncFrame::Step2(update) | SyncFrame::Update(update) => {
                let update = Update::decode_v1(&update)
                    .map_err(|error| ReplicaError::DecodeUpdate(error.to_string()))?;
                let mut txn = match origin {
                    Some(session_id) => doc.transact_mut_with(origin_for_session(session_id).as_str()),
                    None => doc.transact_mut(),
                };
                txn.apply_update(update).map_err(|error| ReplicaError::ApplyUpdate(error.to_string()))?;
                Ok(None)
            }
        }
    }

    /// Present presence entries keyed by client id, as raw JSON.
    pub async fn presence_states(&self) -> BTreeMap<u64, String> {
        let awareness = self.awareness.lock().await;
        awareness
            .iter()
            .filter_map(|(client_id, state)| Some((client_id, state.data?.to_string())))
            .collect()
    }

    pub async fn apply_presence_delta(
        &self,
        delta: &[u8],
        origin: Option<SessionId>,
    ) -> Result<PresenceChange, ReplicaError> {
        let update = AwarenessUpdate::decode_v1(delta)
            .map_err(|error| ReplicaError::DecodePresence(error.to_string()))?;

        let awareness = self.awareness.lock().await;
        let Some(summary) = awareness
            .apply_update_summary(update)
            .map_err(|error| ReplicaError::ApplyPresence(error.to_string()))?
        else {
            return Ok(PresenceChange::default());
        };

        let changed = summary.all_changes();
        if !changed.is_empty() {
            let rebroadcast = awareness
                .update_with_clients(changed)
                .map_err(|error| ReplicaError::EncodePresence(error.to_string()))?;
            let _ = self.events.send(ReplicaEvent::Presence { delta: rebroadcast.encode_v1(), origin });
        }

        Ok(PresenceChange {
            added: summary.added,
            updated: summary.updated,
            removed: summary.removed,
        })
    }

    pub async fn encode_presence_snapshot(&self, client_ids: &[u64]) -> Result<Vec<u8>, ReplicaError> {
        let awareness = self.awareness.lock().await;
        let update = awareness
            .update_with_clients(client_ids.iter().copied())
            .map_err(|error| ReplicaError::EncodePresence(error.to_string()))?;
        Ok(update.encode_v1())
    }

    /// Remove presence entries and announce the removal with no origin.
    pub async fn retract_presence(&self, client_ids: &[u64]) -> Result<(), ReplicaError> {
        if client_ids.is_empty() {
            return Ok(());
        }

        let awareness = self.awareness.lock().await;
        for client_id in client_ids {
            awareness.remove_state(*client_id);
        }
        let removal = awareness
            .update_with_clients(client_ids.iter().copied())
            .map_err(|error| ReplicaError::EncodePresence(error.to_string()))?;
        let _ = self.events.send(ReplicaEvent::Presence { delta: removal.encode_v1(), origin: None });
        Ok(())
    }

    /// Stop observing the document and drop every presence entry.
    pub async fn destroy(&self) {
        self.subscription.lock().expect("replica subscription lock poisoned").take();

        let awareness = self.awareness.lock().await;
        let client_ids: Vec<u64> = awareness.iter().map(|(client_id, _)| client_id).collect();
        for client_id in &client_ids {
            awareness.remove_state(*client_id);
        }
        debug!(presence_entries = client_ids.len(), "replica destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.subscription.lock().expect("replica subscription lock poisoned").is_none()
    }
}

fn origin_for_session(session_id: SessionId) -> String {
    format!("{SESSION_ORIGIN_PREFIX}{session_id}")
}

fn session_from_origin(origin: &Origin) -> Option<SessionId> {
    std::str::from_utf8(origin.as_ref()).ok()?.strip_prefix(SESSION_ORIGIN_PREFIX)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text};

    fn client_doc(client_id: u64, content: &str) -> Doc {
        let doc = Doc::with_client_id(client_id);
        let text = doc.get_or_insert_text("content");
        let mut txn = doc.transact_mut();
        text.push(&mut txn, content);
        drop(txn);
        doc
    }

    fn full_update(doc: &Doc) -> Vec<u8> {
        doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    fn presence_delta(client_id: u64, name: &str) -> Vec<u8> {
        let awareness = Awareness::new(Doc::with_client_id(client_id));
        awareness
            .set_local_state(format!(r#"{{"user":{{"name":"{name}"}}}}"#))
            .expect("local state should set");
        awareness.update().expect("awareness update should encode").encode_v1()
    }

    async fn replica_text(replica: &DocReplica) -> String {
        let awareness = replica.awareness.lock().await;
        let txn = awareness.doc().transact();
        txn.get_text("content").map(|text| text.get_string(&txn)).unwrap_or_default()
    }

    #[test]
    fn session_origin_round_trips() {
        let origin = Origin::from(origin_for_session(42).as_str());
        assert_eq!(session_from_origin(&origin), Some(42));
        assert_eq!(session_from_origin(&Origin::from("file-watcher")), None);
    }

    #[tokio::test]
    async fn update_is_applied_and_reported_with_origin() {
        let (replica, mut events) = DocReplica::new().expect("replica should build");
        let update = full_update(&client_doc(1, "hello"));

        let reply = replica
            .apply_merge_message(SyncFrame::Update(update), Some(7))
            .await
            .expect("update should apply");

        assert_eq!(reply, None);
        assert_eq!(replica_text(&replica).await, "hello");
        match events.try_recv().expect("mutation event should be emitted") {
            ReplicaEvent::Update { origin, update } => {
                assert_eq!(origin, Some(7));
                assert!(!update.is_empty());
            }
            other => panic!("expected update event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn step2_merges_like_an_update() {
        let (replica, mut events) = DocReplica::new().expect("replica should build");

        replica
            .apply_merge_message(SyncFrame::Step2(full_update(&client_doc(2, "abc"))), Some(3))
            .await
            .expect("step2 should apply");

        assert_eq!(replica_text(&replica).await, "abc");
        assert!(matches!(events.try_recv(), Ok(ReplicaEvent::Update { origin: Some(3), .. })));
    }

    #[tokio::test]
    async fn step1_replies_with_missing_diff_only() {
        let (replica, mut events) = DocReplica::new().expect("replica should build");
        replica
            .apply_merge_message(SyncFrame::Update(full_update(&client_doc(5, "server"))), None)
            .await
            .expect("seed update should apply");
        let _ = events.try_recv();

        let requester = Doc::with_client_id(6);
        let state_vector = requester.transact().state_vector().encode_v1();
        let reply = replica
            .apply_merge_message(SyncFrame::Step1(state_vector), Some(1))
            .await
            .expect("step1 should be answered");

        let Some(SyncFrame::Step2(diff)) = reply else {
            panic!("expected step2 reply, got {reply:?}");
        };
        requester
            .transact_mut()
            .apply_update(Update::decode_v1(&diff).expect("diff should decode"))
            .expect("diff should apply");
        let text = requester.get_or_insert_text("content");
        assert_eq!(text.get_string(&requester.transact()), "server");
        assert!(events.try_recv().is_err(), "step1 must not mutate the replica");
    }

    #[tokio::test]
    async fn malformed_update_is_an_error_not_a_panic() {
        let (replica, _events) = DocReplica::new().expect("replica should build");
        let result = replica.apply_merge_message(SyncFrame::Update(vec![0xff, 0xff, 0xff]), Some(1)).await;
        assert!(result.is_err());

        let result = replica.apply_merge_message(SyncFrame::Step1(vec![0xff]), Some(1)).await;
        assert!(matches!(result, Err(ReplicaError::StateVector(_))));
    }

    #[tokio::test]
    async fn fresh_replica_has_no_presence() {
        let (replica, _events) = DocReplica::new().expect("replica should build");
        assert!(replica.presence_states().await.is_empty());
    }

    #[tokio::test]
    async fn presence_delta_reports_changes_and_rebroadcasts() {
        let (replica, mut events) = DocReplica::new().expect("replica should build");

        let change = replica
            .apply_presence_delta(&presence_delta(11, "Ada"), Some(4))
            .await
            .expect("presence should apply");

        assert_eq!(change.added, vec![11]);
        assert!(change.removed.is_empty());
        assert!(replica.presence_states().await.contains_key(&11));
        match events.try_recv().expect("presence event should be emitted") {
            ReplicaEvent::Presence { delta, origin } => {
                assert_eq!(origin, Some(4));
                let decoded = AwarenessUpdate::decode_v1(&delta).expect("delta should decode");
                assert!(decoded.clients.contains_key(&11));
            }
            other => panic!("expected presence event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retract_presence_removes_entries_and_announces_removal() {
        let (replica, mut events) = DocReplica::new().expect("replica should build");
        replica.apply_presence_delta(&presence_delta(21, "Grace"), Some(1)).await.expect("apply");
        replica.apply_presence_delta(&presence_delta(22, "Linus"), Some(2)).await.expect("apply");
        while events.try_recv().is_ok() {}

        replica.retract_presence(&[21]).await.expect("retract should succeed");

        let states = replica.presence_states().await;
        assert!(!states.contains_key(&21));
        assert!(states.contains_key(&22));
        assert!(matches!(events.try_recv(), Ok(ReplicaEvent::Presence { origin: None, .. })));
    }

    #[tokio::test]
    async fn presence_snapshot_decodes_to_requested_clients() {
        let (replica, _events) = DocReplica::new().expect("replica should build");
        replica.apply_presence_delta(&presence_delta(31, "Barbara"), Some(1)).await.expect("apply");

        let snapshot = replica.encode_presence_snapshot(&[31]).await.expect("snapshot should encode");
        let decoded = AwarenessUpdate::decode_v1(&snapshot).expect("snapshot should decode");
        assert_eq!(decoded.clients.len(), 1);
        assert!(decoded.clients.contains_key(&31));
    }

    #[tokio::test]
    async fn destroy_stops_events_and_clears_presence() {
        let (replica, mut events) = DocReplica::new().expect("replica should build");
        replica.apply_presence_delta(&presence_delta(41, "Edsger"), Some(1)).await.expect("apply");
        while events.try_recv().is_ok() {}

        replica.destroy().await;

        assert!(replica.is_destroyed());
        assert!(replica.presence_states().await.is_empty());
        replica
            .apply_merge_message(SyncFrame::Update(full_update(&client_doc(9, "late"))), Some(1))
            .await
            .expect("late update still merges");
        assert!(events.try_recv().is_err(), "destroyed replica must not emit updates");
    }
}
