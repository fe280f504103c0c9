// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Unix-socket hub: connections, session binding and push fan-out.

use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_app_core::settings::HostSettings;
use tether_proto::wire::{encode_message, encode_segmented, Reassembler};
use tether_proto::{
    ClientMessage, ErrorPayload, HelloPayload, Message, ResponseMeta, WelcomePayload,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc::Sender;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::demo::App;
use crate::session::{Resume, SessionHandle, SyncSession};

/// Host implementation version sent in `welcome`.
pub const SERVER_VERSION: u32 = 1;

/// Hub state shared by every connection task.
pub type SharedHub = Arc<Mutex<HubState>>;

pub(crate) struct ConnState {
    pub(crate) session: Option<String>,
    pub(crate) tx: Sender<Vec<u8>>,
}

struct SessionEntry {
    handle: SessionHandle,
    /// Set while no connection is bound.
    idle_since: Option<Instant>,
}

/// Connections and sessions.
pub struct HubState {
    pub(crate) next_conn_id: u64,
    next_ts: u64,
    next_session: u64,
    pub(crate) conns: HashMap<u64, ConnState>,
    sessions: HashMap<String, SessionEntry>,
    settings: HostSettings,
    app: Arc<dyn App>,
}

impl HubState {
    /// Empty hub serving `app`.
    pub fn new(settings: HostSettings, app: Arc<dyn App>) -> Self {
        Self {
            next_conn_id: 0,
            next_ts: 0,
            next_session: 0,
            conns: HashMap::new(),
            sessions: HashMap::new(),
            settings,
            app,
        }
    }

    /// Wraps the state for sharing.
    pub fn shared(self) -> SharedHub {
        Arc::new(Mutex::new(self))
    }

    /// Host settings.
    pub fn settings(&self) -> &HostSettings {
        &self.settings
    }

    /// Live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Session by id.
    pub fn session(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.get(id).map(|entry| entry.handle.clone())
    }

    /// Drops sessions that have had no connection for `session_idle_ms`.
    /// Returns how many were dropped.
    pub fn evict_idle(&mut self, now: Instant) -> usize {
        let limit = Duration::from_millis(self.settings.session_idle_ms);
        let before = self.sessions.len();
        self.sessions.retain(|id, entry| {
            let keep = entry
                .idle_since
                .is_none_or(|since| now.saturating_duration_since(since) < limit);
            if !keep {
                info!(session = %id, "evicting idle session");
            }
            keep
        });
        before - self.sessions.len()
    }

    fn alloc_ts(&mut self) -> u64 {
        let t = self.next_ts;
        self.next_ts += 1;
        t
    }

    pub(crate) fn add_conn(&mut self, tx: Sender<Vec<u8>>) -> u64 {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        self.conns.insert(id, ConnState { session: None, tx });
        id
    }

    pub(crate) fn remove_conn(&mut self, conn_id: u64, now: Instant) {
        if let Some(session) = self.conns.remove(&conn_id).and_then(|c| c.session) {
            self.mark_idle_if_unbound(&session, now);
        }
    }

    /// Binds a connection to `session` and returns its outbox.
    fn bind(&mut self, conn_id: u64, session: &str, now: Instant) -> Result<Sender<Vec<u8>>> {
        let conn = self
            .conns
            .get_mut(&conn_id)
            .ok_or_else(|| anyhow!("missing conn"))?;
        let previous = conn.session.replace(session.to_owned());
        let tx = conn.tx.clone();
        if let Some(entry) = self.sessions.get_mut(session) {
            entry.idle_since = None;
        }
        if let Some(previous) = previous.filter(|p| p != session) {
            self.mark_idle_if_unbound(&previous, now);
        }
        Ok(tx)
    }

    fn mark_idle_if_unbound(&mut self, session: &str, now: Instant) {
        let bound = self
            .conns
            .values()
            .any(|c| c.session.as_deref() == Some(session));
        if let Some(entry) = self.sessions.get_mut(session) {
            entry.idle_since = if bound {
                None
            } else {
                Some(entry.idle_since.unwrap_or(now))
            };
        }
    }

    fn open_session(&mut self) -> Result<SessionHandle> {
        let id = format!("session-{}", self.next_session);
        self.next_session += 1;
        let tree = self
            .app
            .build()?
            .with_gc_grace(self.settings.gc_grace_cycles);
        let session = SyncSession::new(id.clone(), tree, self.settings.history_capacity);
        let handle = SessionHandle::new(session);
        self.sessions.insert(
            id,
            SessionEntry {
                handle: handle.clone(),
                idle_since: None,
            },
        );
        Ok(handle)
    }

    /// Outboxes of connections bound to `session`, with a fresh timestamp.
    fn outboxes(&mut self, session: &str) -> (u64, Vec<Sender<Vec<u8>>>) {
        let txs = self
            .conns
            .values()
            .filter(|c| c.session.as_deref() == Some(session))
            .map(|c| c.tx.clone())
            .collect();
        (self.alloc_ts(), txs)
    }
}

async fn send_to(
    tx: &Sender<Vec<u8>>,
    msg: &Message,
    ts: u64,
    max_segment: usize,
) -> Result<()> {
    for packet in encode_segmented(msg, ts, max_segment)? {
        tx.send(packet).await.map_err(|_| anyhow!("connection outbox closed"))?;
    }
    Ok(())
}

/// Serves one client connection until it closes or misbehaves.
pub async fn handle_client(stream: UnixStream, hub: SharedHub) -> Result<()> {
    let (mut reader, writer) = tokio::io::split(stream);

    let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(256);
    let (conn_id, max_payload) = {
        let mut h = hub.lock().await;
        (h.add_conn(tx), h.settings.max_payload_bytes)
    };

    tokio::spawn(async move {
        let mut ws = writer;
        while let Some(buf) = rx.recv().await {
            if ws.write_all(&buf).await.is_err() {
                break;
            }
        }
    });

    let mut reassembler = Reassembler::new(max_payload);
    let mut read_buf: Vec<u8> = vec![0u8; 16 * 1024];
    let mut acc: Vec<u8> = Vec::with_capacity(32 * 1024);
    'read: loop {
        let n = reader.read(&mut read_buf).await?;
        if n == 0 {
            break;
        }
        acc.extend_from_slice(&read_buf[..n]);
        let messages = match reassembler.drain(&mut acc) {
            Ok(messages) => messages,
            Err(err) => {
                warn!(?err, conn = conn_id, "failed to decode packet");
                reject(&hub, conn_id, "E_BAD_PACKET", &err.to_string()).await;
                break;
            }
        };
        for (msg, _ts) in messages {
            if let Err(err) = handle_message(msg, conn_id, &hub).await {
                warn!(?err, "dropping connection {}", conn_id);
                reject(&hub, conn_id, "E_BAD_PAYLOAD", &err.to_string()).await;
                break 'read;
            }
        }
    }

    hub.lock().await.remove_conn(conn_id, Instant::now());
    debug!(conn = conn_id, "connection closed");
    Ok(())
}

async fn reject(hub: &SharedHub, conn_id: u64, name: &str, message: &str) {
    let (ts, tx) = {
        let mut h = hub.lock().await;
        let ts = h.alloc_ts();
        (ts, h.conns.get(&conn_id).map(|c| c.tx.clone()))
    };
    if let Some(tx) = tx {
        let err = Message::Error(ErrorPayload::new(400, name, message));
        if let Ok(packet) = encode_message(&err, ts) {
            let _ = tx.send(packet).await;
        }
    }
}

/// Handles a single inbound message from a connection.
pub async fn handle_message(msg: Message, conn_id: u64, hub: &SharedHub) -> Result<()> {
    match msg {
        Message::Hello(hello) => on_hello(hello, conn_id, hub).await,
        Message::Sync { text } => {
            let request = ClientMessage::decode(&text)?;
            let (handle, ts, tx, max_segment) = {
                let mut h = hub.lock().await;
                let max_segment = h.settings.max_segment_bytes;
                let ts = h.alloc_ts();
                let conn = h
                    .conns
                    .get(&conn_id)
                    .ok_or_else(|| anyhow!("missing conn"))?;
                let session = conn
                    .session
                    .clone()
                    .ok_or_else(|| anyhow!("sync before hello"))?;
                let tx = conn.tx.clone();
                let handle = h
                    .session(&session)
                    .ok_or_else(|| anyhow!("unknown session {session}"))?;
                (handle, ts, tx, max_segment)
            };
            let mut session = handle.lock().await;
            let text = session.handle_client(&request);
            send_to(&tx, &Message::Update { text }, ts, max_segment).await
        }
        Message::Welcome(_) | Message::Update { .. } | Message::Error(_) => {
            // host-initiated ops; ignore
            Ok(())
        }
    }
}

async fn on_hello(hello: HelloPayload, conn_id: u64, hub: &SharedHub) -> Result<()> {
    let (handle, resumed, ts, tx, max_segment) = {
        let mut h = hub.lock().await;
        let now = Instant::now();
        h.evict_idle(now);
        let existing = hello.session_id.as_deref().and_then(|id| h.session(id));
        let resumed = existing.is_some();
        let handle = match existing {
            Some(handle) => handle,
            None => h.open_session()?,
        };
        let tx = h.bind(conn_id, handle.id(), now)?;
        let max_segment = h.settings.max_segment_bytes;
        (handle, resumed, h.alloc_ts(), tx, max_segment)
    };
    info!(conn = conn_id, session = handle.id(), resumed, "client bound to session");

    let mut session = handle.lock().await;
    let welcome = Message::Welcome(WelcomePayload {
        session_id: handle.id().to_owned(),
        server_version: SERVER_VERSION,
        resumed,
    });
    send_to(&tx, &welcome, ts, max_segment).await?;
    let catch_up = if resumed {
        session.resume(hello.last_applied)
    } else {
        Resume::Snapshot(session.snapshot().encode_wrapped())
    };
    match catch_up {
        Resume::Replay(text) | Resume::Snapshot(text) => {
            send_to(&tx, &Message::Update { text }, ts, max_segment).await
        }
        Resume::UpToDate => Ok(()),
    }
}

/// Advances every session once and fans the resulting flushes out.
///
/// Returns the number of updates queued.
pub async fn push_tick(hub: &SharedHub) -> Result<usize> {
    let (app, handles, max_segment) = {
        let mut h = hub.lock().await;
        h.evict_idle(Instant::now());
        let handles: Vec<SessionHandle> =
            h.sessions.values().map(|entry| entry.handle.clone()).collect();
        (Arc::clone(&h.app), handles, h.settings.max_segment_bytes)
    };
    let mut sent = 0;
    for handle in handles {
        let (ts, txs) = hub.lock().await.outboxes(handle.id());
        // held until queued so every outbox sees sync ids in order
        let mut session = handle.lock().await;
        if let Err(err) = app.tick(session.tree_mut()) {
            warn!(session = handle.id(), error = %err, "app tick failed");
        }
        let Some(msg) = session.flush(ResponseMeta::pushed()) else {
            continue;
        };
        let update = Message::Update {
            text: msg.encode_wrapped(),
        };
        for tx in &txs {
            if send_to(tx, &update, ts, max_segment).await.is_ok() {
                sent += 1;
            }
        }
    }
    Ok(sent)
}

/// Runs [`push_tick`] every `interval`.
pub fn spawn_push_task(hub: SharedHub, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match push_tick(&hub).await {
                Ok(sent) => debug!(sent, "push tick"),
                Err(err) => warn!(?err, "push tick failed"),
            }
        }
    })
}

/// Rejects a hub configuration that cannot work.
pub fn validate(settings: &HostSettings) -> Result<()> {
    if settings.max_segment_bytes == 0 {
        bail!("max_segment_bytes must be positive");
    }
    if settings.max_segment_bytes > settings.max_payload_bytes {
        bail!("max_segment_bytes exceeds max_payload_bytes");
    }
    Ok(())
}
