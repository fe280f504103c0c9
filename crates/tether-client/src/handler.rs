// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Inbound sequencing and outbound message building for one client.
//!
//! Responses are decoded all-or-nothing, ordered by `syncId` and applied to the
//! mirror one message at a time. Anything the handler cannot reconcile (a
//! malformed text, a rejected batch, a gap that stays open, an overflowing
//! queue) turns into a resynchronization request carried by the next outgoing
//! [`ClientMessage`].

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use tether_app_core::settings::ClientSettings;
use tether_proto::{decode_response, ClientMessage, ClientSeq, ServerMessage, SyncId};
use tracing::{debug, warn};

use crate::mirror::{MirrorChanges, MirrorTree};

/// Why the handler asked the server for a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    /// A response could not be decoded.
    Decode,
    /// The mirror rejected a batch.
    Apply,
    /// A sync id gap stayed open past the timeout.
    GapTimeout,
    /// Too many out-of-order messages were buffered.
    BufferFull,
    /// The inbound queue overflowed.
    QueueOverflow,
}

impl fmt::Display for ResyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Decode => "undecodable response",
            Self::Apply => "rejected batch",
            Self::GapTimeout => "sync id gap timed out",
            Self::BufferFull => "out-of-order buffer full",
            Self::QueueOverflow => "inbound queue overflow",
        };
        f.write_str(label)
    }
}

/// Outcome of handling one raw response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleReport {
    /// Sync ids applied, in order.
    pub applied: Vec<SyncId>,
    /// Messages ignored as already applied.
    pub duplicates: usize,
    /// Messages parked until their predecessors arrive.
    pub buffered: usize,
    /// Aggregate mirror changes.
    pub changes: MirrorChanges,
    /// Set when a resync was requested while handling.
    pub resync: Option<ResyncReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resync {
    Idle,
    Requested,
    Sent,
}

/// Sequencing state around a [`MirrorTree`].
#[derive(Debug)]
pub struct MessageHandler {
    mirror: MirrorTree,
    settings: ClientSettings,
    last_seen: Option<SyncId>,
    parked: BTreeMap<SyncId, ServerMessage>,
    gap_since: Option<Instant>,
    queue: VecDeque<String>,
    next_client_seq: ClientSeq,
    in_flight: Option<ClientMessage>,
    resync: Resync,
}

impl MessageHandler {
    /// Handler with an empty mirror.
    pub fn new(settings: ClientSettings) -> Self {
        Self::with_mirror(MirrorTree::new(), settings)
    }

    /// Handler around an existing mirror (listeners already registered).
    pub fn with_mirror(mirror: MirrorTree, settings: ClientSettings) -> Self {
        Self {
            mirror,
            settings,
            last_seen: None,
            parked: BTreeMap::new(),
            gap_since: None,
            queue: VecDeque::new(),
            next_client_seq: 0,
            in_flight: None,
            resync: Resync::Idle,
        }
    }

    /// The mirror.
    pub fn mirror(&self) -> &MirrorTree {
        &self.mirror
    }

    /// Mutable mirror, for local edits and listeners.
    pub fn mirror_mut(&mut self) -> &mut MirrorTree {
        &mut self.mirror
    }

    /// Last applied server sync id.
    pub fn last_seen_sync_id(&self) -> Option<SyncId> {
        self.last_seen
    }

    /// Sequence number the next outgoing message will carry.
    pub fn next_client_seq(&self) -> ClientSeq {
        self.next_client_seq
    }

    /// Returns `true` while a snapshot has been requested but not received.
    pub fn resync_pending(&self) -> bool {
        self.resync != Resync::Idle
    }

    /// Number of out-of-order messages waiting for a gap to fill.
    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    /// Number of raw responses waiting in the inbound queue.
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Forgets sequencing state after the server started a fresh session.
    ///
    /// The mirror stays as is until the server's snapshot replaces it.
    pub fn reset_session(&mut self) {
        self.last_seen = None;
        self.parked.clear();
        self.gap_since = None;
        self.next_client_seq = 0;
        self.in_flight = None;
        self.resync = Resync::Idle;
    }

    /// Splits, decodes and sequences one raw response.
    pub fn handle_text(&mut self, raw: &str, now: Instant) -> HandleReport {
        let mut report = HandleReport::default();
        let messages = match decode_response(raw) {
            Ok(messages) => messages,
            Err(err) => {
                warn!(error = %err, "dropping undecodable response");
                self.request_resync(ResyncReason::Decode, &mut report);
                return report;
            }
        };
        for message in messages {
            self.sequence(message, now, &mut report);
        }
        report
    }

    fn sequence(&mut self, message: ServerMessage, now: Instant, report: &mut HandleReport) {
        let id = message.sync_id;
        if self.last_seen.is_some_and(|seen| id <= seen) {
            debug!(sync_id = id, "ignoring duplicate message");
            report.duplicates += 1;
            return;
        }
        if message.resynchronize {
            self.parked.retain(|parked, _| *parked > id);
            self.apply(message, report);
            self.drain_parked(report);
            return;
        }
        if self.resync != Resync::Idle {
            debug!(sync_id = id, "dropping delta while waiting for snapshot");
            report.duplicates += 1;
            return;
        }
        let expected = self.last_seen.map_or(id, |seen| seen + 1);
        if id == expected {
            self.apply(message, report);
            self.drain_parked(report);
            return;
        }
        if self.parked.len() >= self.settings.max_pending_messages {
            self.request_resync(ResyncReason::BufferFull, report);
            return;
        }
        debug!(sync_id = id, expected, "parking out-of-order message");
        self.parked.insert(id, message);
        self.gap_since.get_or_insert(now);
        report.buffered += 1;
    }

    fn drain_parked(&mut self, report: &mut HandleReport) {
        while let Some(seen) = self.last_seen {
            if self.resync != Resync::Idle {
                break;
            }
            match self.parked.remove(&(seen + 1)) {
                Some(next) => self.apply(next, report),
                None => break,
            }
        }
        if self.parked.is_empty() {
            self.gap_since = None;
        }
    }

    fn apply(&mut self, message: ServerMessage, report: &mut HandleReport) {
        let result = if message.resynchronize {
            self.mirror.replace_with_snapshot(&message.changes)
        } else {
            self.mirror.apply(&message.changes)
        };
        let changes = match result {
            Ok(changes) => changes,
            Err(err) => {
                warn!(sync_id = message.sync_id, error = %err, "mirror rejected batch");
                self.request_resync(ResyncReason::Apply, report);
                return;
            }
        };
        if let Some(next_expected) = message.client_id {
            self.mirror.acknowledge(next_expected);
            if self
                .in_flight
                .as_ref()
                .is_some_and(|sent| sent.client_id < next_expected)
            {
                self.in_flight = None;
            }
            self.next_client_seq = next_expected;
        }
        if message.resynchronize {
            self.resync = Resync::Idle;
        }
        self.last_seen = Some(message.sync_id);
        report.applied.push(message.sync_id);
        report.changes.merge(changes);
    }

    fn request_resync(&mut self, reason: ResyncReason, report: &mut HandleReport) {
        warn!(%reason, "requesting resynchronization");
        self.parked.clear();
        self.gap_since = None;
        if self.resync == Resync::Idle {
            self.resync = Resync::Requested;
        }
        report.resync = Some(reason);
    }

    /// Requests a resync when a sync id gap has been open for too long.
    pub fn check_gap(&mut self, now: Instant) -> Option<ResyncReason> {
        let since = self.gap_since?;
        let timeout = Duration::from_millis(self.settings.gap_timeout_ms);
        if now.saturating_duration_since(since) < timeout {
            return None;
        }
        let mut report = HandleReport::default();
        self.request_resync(ResyncReason::GapTimeout, &mut report);
        report.resync
    }

    /// Queues a raw response for later processing.
    ///
    /// When the queue is full everything queued is dropped and a resync is
    /// requested instead. [`crate::run`] drains the queue after every
    /// update, so the bound only comes into play for callers that read the
    /// socket themselves and call [`Self::process_next`] on their own
    /// schedule.
    pub fn enqueue(&mut self, raw: String) -> Option<ResyncReason> {
        if self.queue.len() >= self.settings.max_queued_batches {
            self.queue.clear();
            let mut report = HandleReport::default();
            self.request_resync(ResyncReason::QueueOverflow, &mut report);
            return report.resync;
        }
        self.queue.push_back(raw);
        None
    }

    /// Handles the oldest queued response, if any.
    pub fn process_next(&mut self, now: Instant) -> Option<HandleReport> {
        let raw = self.queue.pop_front()?;
        Some(self.handle_text(&raw, now))
    }

    /// Handles every queued response and merges the reports.
    pub fn process_all(&mut self, now: Instant) -> HandleReport {
        let mut total = HandleReport::default();
        while let Some(report) = self.process_next(now) {
            total.applied.extend(report.applied);
            total.duplicates += report.duplicates;
            total.buffered += report.buffered;
            total.changes.merge(report.changes);
            total.resync = report.resync.or(total.resync);
        }
        total
    }

    /// Builds the next outgoing message, if there is anything to say.
    ///
    /// Edits wait while an earlier message is unanswered; a resync request is
    /// sent regardless.
    pub fn build_message(&mut self) -> Option<ClientMessage> {
        let wants_resync = self.resync == Resync::Requested;
        if !wants_resync && (self.in_flight.is_some() || !self.mirror.has_unsent_edits()) {
            return None;
        }
        let seq = self.next_client_seq;
        let message = ClientMessage {
            client_id: seq,
            sync_id: self.last_seen,
            resynchronize: wants_resync,
            rpc: self.mirror.take_unsent(seq),
        };
        self.next_client_seq += 1;
        if wants_resync {
            self.resync = Resync::Sent;
        }
        self.in_flight = Some(message.clone());
        Some(message)
    }

    /// The unanswered message, to be sent again after a reconnect.
    pub fn resend_in_flight(&mut self) -> Option<ClientMessage> {
        if self.resync == Resync::Sent {
            self.resync = Resync::Requested;
            return None;
        }
        self.in_flight.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_proto::{FeatureValue, NodeChange};

    fn put(key: &str, value: i64) -> NodeChange {
        NodeChange::Put {
            node: 1,
            feature: 0,
            key: key.into(),
            value: FeatureValue::Value(json!(value)),
        }
    }

    fn text(sync_id: SyncId, changes: Vec<NodeChange>) -> String {
        ServerMessage::delta(sync_id, changes).encode_wrapped()
    }

    fn seeded(now: Instant) -> MessageHandler {
        let mut handler = MessageHandler::new(ClientSettings::default());
        let snapshot = ServerMessage::snapshot(0, vec![NodeChange::Attach { node: 1 }]);
        handler.handle_text(&snapshot.encode_wrapped(), now);
        handler
    }

    #[test]
    fn first_message_is_accepted_whatever_its_id() {
        let now = Instant::now();
        let mut handler = MessageHandler::new(ClientSettings::default());
        let report = handler.handle_text(
            &ServerMessage::snapshot(41, vec![NodeChange::Attach { node: 1 }]).encode_wrapped(),
            now,
        );
        assert_eq!(report.applied, vec![41]);
        assert_eq!(handler.last_seen_sync_id(), Some(41));
    }

    #[test]
    fn duplicates_are_ignored_and_gaps_parked() {
        let now = Instant::now();
        let mut handler = seeded(now);
        assert_eq!(handler.handle_text(&text(0, vec![put("a", 1)]), now).duplicates, 1);

        let report = handler.handle_text(&text(2, vec![put("b", 2)]), now);
        assert_eq!(report.buffered, 1);
        assert_eq!(handler.parked_len(), 1);

        let report = handler.handle_text(&text(1, vec![put("a", 1)]), now);
        assert_eq!(report.applied, vec![1, 2]);
        assert_eq!(handler.parked_len(), 0);
        assert_eq!(
            handler.mirror().get(1, 0, "b"),
            Some(&FeatureValue::Value(json!(2)))
        );
    }

    #[test]
    fn gap_timeout_requests_resync() {
        let start = Instant::now();
        let mut handler = seeded(start);
        handler.handle_text(&text(3, vec![put("c", 3)]), start);
        assert_eq!(handler.check_gap(start + Duration::from_millis(10)), None);
        assert_eq!(
            handler.check_gap(start + Duration::from_millis(5_000)),
            Some(ResyncReason::GapTimeout)
        );
        let msg = handler.build_message().unwrap();
        assert!(msg.resynchronize);
        assert_eq!(msg.sync_id, Some(0));
        assert_eq!(handler.parked_len(), 0);
    }

    #[test]
    fn snapshot_drops_older_parked_messages_and_clears_resync() {
        let now = Instant::now();
        let mut handler = seeded(now);
        handler.handle_text(&text(2, vec![put("old", 2)]), now);
        handler.handle_text(&text(5, vec![put("new", 5)]), now);
        let snapshot =
            ServerMessage::snapshot(4, vec![NodeChange::Attach { node: 1 }, put("s", 4)]);
        let report = handler.handle_text(&snapshot.encode_wrapped(), now);
        assert_eq!(report.applied, vec![4, 5]);
        assert!(report.changes.resynchronized);
        assert_eq!(handler.mirror().get(1, 0, "old"), None);
        assert!(handler.mirror().get(1, 0, "new").is_some());
    }

    #[test]
    fn rejected_batch_requests_resync_and_blocks_deltas() {
        let now = Instant::now();
        let mut handler = seeded(now);
        let bad = text(
            1,
            vec![NodeChange::Put {
                node: 1,
                feature: 0,
                key: "slot".into(),
                value: FeatureValue::Node(77),
            }],
        );
        let report = handler.handle_text(&bad, now);
        assert_eq!(report.resync, Some(ResyncReason::Apply));
        assert_eq!(handler.last_seen_sync_id(), Some(0));
        assert!(handler.resync_pending());
        assert_eq!(handler.handle_text(&text(2, vec![put("a", 1)]), now).applied, Vec::<u64>::new());
    }

    #[test]
    fn malformed_text_requests_resync() {
        let now = Instant::now();
        let mut handler = seeded(now);
        let report = handler.handle_text("for(;;);[{\"syncId\":1}", now);
        assert_eq!(report.resync, Some(ResyncReason::Decode));
    }

    #[test]
    fn queue_overflow_forces_resync() {
        let now = Instant::now();
        let settings = ClientSettings {
            max_queued_batches: 2,
            ..ClientSettings::default()
        };
        let mut handler = MessageHandler::new(settings);
        assert_eq!(handler.enqueue(text(0, vec![NodeChange::Attach { node: 1 }])), None);
        assert_eq!(handler.enqueue(text(1, vec![])), None);
        assert_eq!(
            handler.enqueue(text(2, vec![])),
            Some(ResyncReason::QueueOverflow)
        );
        assert_eq!(handler.queued_len(), 0);
        assert!(handler.process_next(now).is_none());
    }

    #[test]
    fn edits_round_trip_through_client_ids() {
        let now = Instant::now();
        let mut handler = seeded(now);
        handler
            .mirror_mut()
            .set_local(1, 0, "value", json!("typed"))
            .unwrap();
        let first = handler.build_message().unwrap();
        assert_eq!(first.client_id, 0);
        assert_eq!(first.rpc.len(), 1);

        handler.mirror_mut().set_local(1, 0, "value", json!("more")).unwrap();
        assert!(handler.build_message().is_none());
        assert_eq!(handler.resend_in_flight(), Some(first));

        let mut ack = ServerMessage::delta(1, vec![]);
        ack.client_id = Some(1);
        handler.handle_text(&ack.encode_wrapped(), now);
        let second = handler.build_message().unwrap();
        assert_eq!(second.client_id, 1);
        assert_eq!(second.rpc[0].value, json!("more"));
    }
}
