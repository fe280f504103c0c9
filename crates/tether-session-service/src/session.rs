// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! One server session: the tree, its outgoing sequence and replay history.
//!
//! Every unit of work against the tree runs under the session lock and ends
//! with a flush, so each encoded response reflects a consistent tree state.

use std::collections::VecDeque;
use std::sync::Arc;

use tether_proto::{ClientMessage, ClientSeq, ResponseMeta, ServerMessage, SyncId};
use tether_tree::{ClientPutOutcome, StateTree};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// How a reconnecting client is brought up to date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resume {
    /// Buffered messages after the client's last applied id, concatenated.
    Replay(String),
    /// A fresh snapshot.
    Snapshot(String),
    /// Nothing was sent since the client's last applied id.
    UpToDate,
}

#[derive(Debug, Clone)]
struct Sent {
    sync_id: SyncId,
    resynchronize: bool,
    text: String,
}

/// Tree plus protocol state for one client session.
#[derive(Debug)]
pub struct SyncSession {
    id: String,
    tree: StateTree,
    next_sync_id: SyncId,
    history: VecDeque<Sent>,
    history_capacity: usize,
    next_client_seq: ClientSeq,
    last_response: Option<String>,
}

impl SyncSession {
    /// New session around `tree`, keeping up to `history_capacity` responses.
    pub fn new(id: impl Into<String>, tree: StateTree, history_capacity: usize) -> Self {
        Self {
            id: id.into(),
            tree,
            next_sync_id: 0,
            history: VecDeque::new(),
            history_capacity: history_capacity.max(1),
            next_client_seq: 0,
            last_response: None,
        }
    }

    /// Session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The tree.
    pub fn tree(&self) -> &StateTree {
        &self.tree
    }

    /// Mutable tree. Changes go out with the next flush.
    pub fn tree_mut(&mut self) -> &mut StateTree {
        &mut self.tree
    }

    /// Id of the last message sent, if any.
    pub fn last_sync_id(&self) -> Option<SyncId> {
        self.next_sync_id.checked_sub(1)
    }

    /// Number of responses kept for replay.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Emits pending tree changes. Returns `None` when nothing changed.
    pub fn flush(&mut self, meta: ResponseMeta) -> Option<ServerMessage> {
        let changes = self.tree.collect_changes();
        if changes.is_empty() {
            return None;
        }
        let mut msg = ServerMessage::delta(self.next_sync_id, changes);
        msg.meta = meta;
        self.record(&msg);
        Some(msg)
    }

    /// Discards pending deltas and emits the full state.
    pub fn snapshot(&mut self) -> ServerMessage {
        let dropped = self.tree.collect_changes().len();
        let msg = ServerMessage::snapshot(self.next_sync_id, self.tree.collect_full_state());
        debug!(session = %self.id, sync_id = msg.sync_id, dropped, "built snapshot");
        self.record(&msg);
        msg
    }

    fn record(&mut self, msg: &ServerMessage) -> String {
        let text = msg.encode_wrapped();
        self.history.push_back(Sent {
            sync_id: msg.sync_id,
            resynchronize: msg.resynchronize,
            text: text.clone(),
        });
        while self.history.len() > self.history_capacity {
            self.history.pop_front();
        }
        self.next_sync_id = msg.sync_id + 1;
        text
    }

    /// Decides how to bring a client that last applied `last_applied` up to date.
    pub fn resume(&mut self, last_applied: Option<SyncId>) -> Resume {
        let Some(applied) = last_applied else {
            return Resume::Snapshot(self.snapshot().encode_wrapped());
        };
        match self.last_sync_id() {
            Some(last) if applied == last => return Resume::UpToDate,
            Some(last) if applied < last => {}
            _ => return Resume::Snapshot(self.snapshot().encode_wrapped()),
        }
        let start = self
            .history
            .iter()
            .position(|sent| sent.sync_id == applied + 1)
            .or_else(|| {
                self.history
                    .iter()
                    .rposition(|sent| sent.resynchronize && sent.sync_id > applied)
            });
        match start {
            Some(start) => {
                let text: String = self
                    .history
                    .iter()
                    .skip(start)
                    .map(|sent| sent.text.as_str())
                    .collect();
                debug!(session = %self.id, from = applied, "replaying history");
                Resume::Replay(text)
            }
            None => Resume::Snapshot(self.snapshot().encode_wrapped()),
        }
    }

    /// Applies one client message and returns the response text.
    ///
    /// A re-sent message gets the previous response again. A message from
    /// the future gets a snapshot and its edits are ignored. An in-order
    /// resync request has its edits applied before the snapshot is taken.
    pub fn handle_client(&mut self, msg: &ClientMessage) -> String {
        if msg.client_id < self.next_client_seq {
            if let Some(previous) = &self.last_response {
                debug!(session = %self.id, client_id = msg.client_id, "re-sending last response");
                return previous.clone();
            }
        }
        let ahead = msg.client_id > self.next_client_seq;
        if ahead {
            warn!(
                session = %self.id,
                got = msg.client_id,
                expected = self.next_client_seq,
                "client message out of order; resynchronizing"
            );
        } else {
            self.apply_edits(msg);
        }
        self.next_client_seq = msg.client_id + 1;
        if ahead || msg.resynchronize {
            self.tree.collect_changes();
            let mut snapshot =
                ServerMessage::snapshot(self.next_sync_id, self.tree.collect_full_state());
            snapshot.client_id = Some(self.next_client_seq);
            return self.respond(&snapshot);
        }
        let mut response = ServerMessage::delta(self.next_sync_id, self.tree.collect_changes());
        response.client_id = Some(self.next_client_seq);
        self.respond(&response)
    }

    fn apply_edits(&mut self, msg: &ClientMessage) {
        for edit in &msg.rpc {
            let outcome =
                self.tree
                    .apply_client_put(edit.node, edit.feature, &edit.key, edit.value.clone());
            match outcome {
                Ok(ClientPutOutcome::Accepted) => {}
                Ok(outcome) => {
                    debug!(node = edit.node, key = %edit.key, ?outcome, "client edit not accepted");
                }
                Err(err) => {
                    warn!(node = edit.node, key = %edit.key, error = %err, "dropping client edit");
                }
            }
        }
    }

    fn respond(&mut self, msg: &ServerMessage) -> String {
        let text = self.record(msg);
        self.last_response = Some(text.clone());
        text
    }
}

/// Shared, lockable session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Arc<str>,
    inner: Arc<Mutex<SyncSession>>,
}

impl SessionHandle {
    /// Wraps a session.
    pub fn new(session: SyncSession) -> Self {
        Self {
            id: Arc::from(session.id()),
            inner: Arc::new(Mutex::new(session)),
        }
    }

    /// Session id (no lock needed).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Locks the session.
    pub async fn lock(&self) -> MutexGuard<'_, SyncSession> {
        self.inner.lock().await
    }

    /// Runs `work` on the tree under the lock, then flushes.
    pub async fn access<R>(
        &self,
        work: impl FnOnce(&mut StateTree) -> R,
    ) -> (R, Option<ServerMessage>) {
        let mut session = self.inner.lock().await;
        let out = work(session.tree_mut());
        (out, session.flush(ResponseMeta::pushed()))
    }

    /// Same as [`Self::access`] for code outside the async runtime.
    pub fn access_blocking<R>(
        &self,
        work: impl FnOnce(&mut StateTree) -> R,
    ) -> (R, Option<ServerMessage>) {
        let mut session = self.inner.blocking_lock();
        let out = work(session.tree_mut());
        (out, session.flush(ResponseMeta::pushed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_proto::{decode_response, ClientEdit};
    use tether_tree::{FeatureDescriptor, FeatureId, FeatureRegistry, ROOT_ID};

    const PROPS: FeatureId = 0;
    const VALUE: FeatureId = 1;

    fn session(capacity: usize) -> SyncSession {
        let root = FeatureRegistry::new()
            .with(FeatureDescriptor::map(PROPS, "properties"))
            .unwrap()
            .with(FeatureDescriptor::map(VALUE, "value").client_writable())
            .unwrap()
            .node_type("root", &[PROPS, VALUE])
            .unwrap();
        let mut session = SyncSession::new("s", StateTree::new(root), capacity);
        session.flush(ResponseMeta::default());
        session
    }

    fn put(session: &mut SyncSession, key: &str, value: i64) -> ServerMessage {
        session
            .tree_mut()
            .map_put(ROOT_ID, PROPS, key, json!(value))
            .unwrap();
        session.flush(ResponseMeta::default()).unwrap()
    }

    fn text_of(session: &SyncSession) -> Option<serde_json::Value> {
        session
            .tree()
            .map_get(ROOT_ID, VALUE, "text")
            .unwrap()
            .and_then(|v| v.as_value())
            .cloned()
    }

    #[test]
    fn flush_assigns_sequential_ids_and_skips_empty_cycles() {
        let mut s = session(8);
        assert_eq!(s.last_sync_id(), Some(0));
        assert_eq!(put(&mut s, "a", 1).sync_id, 1);
        assert!(s.flush(ResponseMeta::default()).is_none());
        assert_eq!(put(&mut s, "b", 2).sync_id, 2);
    }

    #[test]
    fn resume_replays_contiguous_history() {
        let mut s = session(8);
        put(&mut s, "a", 1);
        put(&mut s, "b", 2);
        match s.resume(Some(0)) {
            Resume::Replay(text) => {
                let msgs = decode_response(&text).unwrap();
                let ids: Vec<_> = msgs.iter().map(|m| m.sync_id).collect();
                assert_eq!(ids, vec![1, 2]);
            }
            other => panic!("expected replay, got {other:?}"),
        }
        assert_eq!(s.resume(Some(2)), Resume::UpToDate);
    }

    #[test]
    fn resume_falls_back_to_snapshot_when_history_is_gone() {
        let mut s = session(2);
        for i in 0..4 {
            put(&mut s, "k", i);
        }
        match s.resume(Some(0)) {
            Resume::Snapshot(text) => {
                let msgs = decode_response(&text).unwrap();
                assert!(msgs[0].resynchronize);
                assert_eq!(msgs[0].sync_id, 5);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
        assert!(matches!(s.resume(Some(99)), Resume::Snapshot(_)));
        assert!(matches!(s.resume(None), Resume::Snapshot(_)));
    }

    #[test]
    fn resume_replays_from_a_buffered_snapshot() {
        let mut s = session(2);
        put(&mut s, "a", 1);
        put(&mut s, "b", 2);
        s.snapshot();
        put(&mut s, "c", 3);
        match s.resume(Some(0)) {
            Resume::Replay(text) => {
                let msgs = decode_response(&text).unwrap();
                assert!(msgs[0].resynchronize);
                assert_eq!(msgs.len(), 2);
            }
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[test]
    fn client_messages_are_sequenced() {
        let mut s = session(8);
        let edit = ClientMessage {
            client_id: 0,
            sync_id: Some(0),
            resynchronize: false,
            rpc: vec![ClientEdit {
                node: ROOT_ID,
                feature: VALUE,
                key: "text".into(),
                value: json!("typed"),
            }],
        };
        let first = s.handle_client(&edit);
        let response = decode_response(&first).unwrap().remove(0);
        assert_eq!(response.client_id, Some(1));
        assert!(response.changes.is_empty());
        assert_eq!(text_of(&s), Some(json!("typed")));

        assert_eq!(s.handle_client(&edit), first);

        let ahead = ClientMessage {
            client_id: 5,
            ..edit.clone()
        };
        let resync = decode_response(&s.handle_client(&ahead)).unwrap().remove(0);
        assert!(resync.resynchronize);
        assert_eq!(resync.client_id, Some(6));
    }

    #[test]
    fn resync_request_keeps_its_edits() {
        let mut s = session(8);
        let msg = ClientMessage {
            client_id: 0,
            sync_id: Some(0),
            resynchronize: true,
            rpc: vec![ClientEdit {
                node: ROOT_ID,
                feature: VALUE,
                key: "text".into(),
                value: json!("kept"),
            }],
        };
        let snapshot = decode_response(&s.handle_client(&msg)).unwrap().remove(0);
        assert!(snapshot.resynchronize);
        assert_eq!(snapshot.client_id, Some(1));
        assert_eq!(text_of(&s), Some(json!("kept")));
        assert!(snapshot.changes.iter().any(|change| matches!(
            change,
            tether_proto::NodeChange::Put { key, .. } if key == "text"
        )));
    }

    #[test]
    fn edits_from_the_future_are_not_applied() {
        let mut s = session(8);
        let msg = ClientMessage {
            client_id: 3,
            sync_id: Some(0),
            resynchronize: false,
            rpc: vec![ClientEdit {
                node: ROOT_ID,
                feature: VALUE,
                key: "text".into(),
                value: json!("early"),
            }],
        };
        let snapshot = decode_response(&s.handle_client(&msg)).unwrap().remove(0);
        assert!(snapshot.resynchronize);
        assert_eq!(text_of(&s), None);
    }

    #[test]
    fn forbidden_client_edit_is_overridden() {
        let mut s = session(8);
        s.tree_mut().map_put(ROOT_ID, PROPS, "title", json!("server")).unwrap();
        s.flush(ResponseMeta::default());
        let msg = ClientMessage {
            client_id: 0,
            sync_id: None,
            resynchronize: false,
            rpc: vec![ClientEdit {
                node: ROOT_ID,
                feature: PROPS,
                key: "title".into(),
                value: json!("client"),
            }],
        };
        let response = decode_response(&s.handle_client(&msg)).unwrap().remove(0);
        assert!(matches!(
            response.changes.as_slice(),
            [tether_proto::NodeChange::PutOverride { .. }]
        ));
    }

    #[tokio::test]
    async fn access_flushes_after_the_unit_of_work() {
        let handle = SessionHandle::new(session(8));
        let (len, msg) = handle
            .access(|tree| {
                tree.map_put(ROOT_ID, PROPS, "x", json!(1)).unwrap();
                tree.node_count()
            })
            .await;
        assert_eq!(len, 1);
        let msg = msg.unwrap();
        assert!(msg.meta.is_async);
        assert_eq!(msg.sync_id, 1);
        assert_eq!(handle.lock().await.history_len(), 2);
        let (_, none) = handle.access(|_| ()).await;
        assert!(none.is_none());
    }
}
