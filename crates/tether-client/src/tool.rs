// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Tool-facing session adapter: channels + port trait.
//!
//! `ChannelSession` wraps the receivers returned from [`crate::connect_channels`]
//! so tools can follow a mirrored tree and push edits without knowing about
//! sockets, sequencing or reconnects.

use std::sync::mpsc::{Receiver, TryRecvError};

use serde_json::Value;
use tether_proto::{FeatureId, NodeId};
use tokio::sync::mpsc::UnboundedSender;

use crate::connection::ConnectionEvent;
use crate::mirror::MirrorChanges;

/// A local edit handed to the background client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEdit {
    /// Target node.
    pub node: NodeId,
    /// Target map feature.
    pub feature: FeatureId,
    /// Map key.
    pub key: String,
    /// Proposed value.
    pub value: Value,
}

/// Abstract port for following a session.
pub trait SessionPort {
    /// Drain up to `max` change batches.
    fn drain_changes(&mut self, max: usize) -> Vec<MirrorChanges>;
    /// Drain up to `max` connection events.
    fn drain_events(&mut self, max: usize) -> Vec<ConnectionEvent>;
    /// Stop following changes (e.g., after the connection was lost) while
    /// keeping connection events.
    fn clear_changes(&mut self);
    /// Queue a local edit. Returns `false` when the client is gone.
    fn send_edit(&mut self, edit: LocalEdit) -> bool;
}

/// Channel-backed session adapter for tools.
#[derive(Default)]
pub struct ChannelSession {
    changes_rx: Option<Receiver<MirrorChanges>>,
    events_rx: Option<Receiver<ConnectionEvent>>,
    edits_tx: Option<UnboundedSender<LocalEdit>>,
}

impl ChannelSession {
    /// Empty adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the channels returned by [`crate::connect_channels`].
    pub fn set_channels(
        &mut self,
        changes_rx: Receiver<MirrorChanges>,
        events_rx: Receiver<ConnectionEvent>,
        edits_tx: UnboundedSender<LocalEdit>,
    ) {
        self.changes_rx = Some(changes_rx);
        self.events_rx = Some(events_rx);
        self.edits_tx = Some(edits_tx);
    }
}

fn drain<T>(rx: Option<&Receiver<T>>, max: usize) -> Vec<T> {
    let mut out = Vec::new();
    if let Some(rx) = rx {
        for _ in 0..max {
            match rx.try_recv() {
                Ok(item) => out.push(item),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
    }
    out
}

impl SessionPort for ChannelSession {
    fn drain_changes(&mut self, max: usize) -> Vec<MirrorChanges> {
        drain(self.changes_rx.as_ref(), max)
    }

    fn drain_events(&mut self, max: usize) -> Vec<ConnectionEvent> {
        drain(self.events_rx.as_ref(), max)
    }

    fn clear_changes(&mut self) {
        self.changes_rx = None;
    }

    fn send_edit(&mut self, edit: LocalEdit) -> bool {
        self.edits_tx
            .as_ref()
            .is_some_and(|tx| tx.send(edit).is_ok())
    }
}
