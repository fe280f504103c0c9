// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Client side of a Tether session: a mirror of the server tree, the message
//! handler that keeps it in sequence, the reconnect state machine, and an
//! async Unix-socket client that ties them together (plus tool-facing
//! channel adapters).

use anyhow::{bail, Result};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;
use tether_app_core::settings::ClientSettings;
use tether_proto::wire::{encode_segmented, Reassembler};
use tether_proto::{ClientMessage, HelloPayload, Message, SyncId, WelcomePayload};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

pub mod connection;
pub mod handler;
pub mod mirror;
pub mod tool;

pub use connection::{
    Connection, ConnectionEvent, ConnectionState, ReconnectAction, ReconnectPolicy,
};
pub use handler::{HandleReport, MessageHandler, ResyncReason};
pub use mirror::{ApplyError, MirrorChanges, MirrorFeature, MirrorNode, MirrorTree, NodeState};
pub use tool::{ChannelSession, LocalEdit, SessionPort};

/// Implementation version sent in `hello`.
pub const CLIENT_VERSION: u32 = 1;

/// Transport limits for [`SessionClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportLimits {
    /// Largest reassembled payload accepted.
    pub max_payload: usize,
    /// Largest outbound packet payload before segmenting.
    pub max_segment: usize,
}

impl Default for TransportLimits {
    fn default() -> Self {
        Self {
            max_payload: 8 * 1024 * 1024,
            max_segment: 64 * 1024,
        }
    }
}

/// Async client over a Unix socket.
pub struct SessionClient {
    stream: UnixStream,
    reassembler: Reassembler,
    buf: Vec<u8>,
    ready: VecDeque<Message>,
    max_segment: usize,
}

impl SessionClient {
    /// Connect to the host at the given Unix socket path.
    pub async fn connect(path: impl AsRef<Path>, limits: TransportLimits) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_stream(stream, limits))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: UnixStream, limits: TransportLimits) -> Self {
        Self {
            stream,
            reassembler: Reassembler::new(limits.max_payload),
            buf: Vec::new(),
            ready: VecDeque::new(),
            max_segment: limits.max_segment,
        }
    }

    /// Send one message, segmenting large payloads.
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        for packet in encode_segmented(msg, 0, self.max_segment)? {
            self.stream.write_all(&packet).await?;
        }
        Ok(())
    }

    /// Open (or resume) a session.
    pub async fn send_hello(
        &mut self,
        session_id: Option<String>,
        last_applied: Option<SyncId>,
    ) -> Result<()> {
        self.send(&Message::Hello(HelloPayload {
            session_id,
            last_applied,
            client_version: CLIENT_VERSION,
        }))
        .await
    }

    /// Send a client message.
    pub async fn send_sync(&mut self, msg: &ClientMessage) -> Result<()> {
        self.send(&Message::Sync { text: msg.encode()? }).await
    }

    /// Wait for the next complete message. Returns `Ok(None)` when the host
    /// closes the stream between packets.
    ///
    /// Partial reads stay buffered inside the client, so dropping this future
    /// (e.g., in `select!`) never loses bytes.
    pub async fn poll_message(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some(msg) = self.ready.pop_front() {
                return Ok(Some(msg));
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() && !self.reassembler.is_partial() {
                    return Ok(None);
                }
                bail!(
                    "stream closed inside a packet ({} bytes buffered)",
                    self.buf.len()
                );
            }
            self.buf.extend_from_slice(&chunk[..n]);
            for (msg, _ts) in self.reassembler.drain(&mut self.buf)? {
                self.ready.push_back(msg);
            }
        }
    }
}

/// Where to connect and how to behave.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Host socket.
    pub socket_path: PathBuf,
    /// Sync and reconnect tuning.
    pub settings: ClientSettings,
    /// Transport limits.
    pub limits: TransportLimits,
}

/// Sinks the run loop reports into.
#[derive(Debug, Clone)]
pub struct Outputs {
    /// Aggregate mirror changes per processed response.
    pub changes: Sender<MirrorChanges>,
    /// Connection events.
    pub events: Sender<ConnectionEvent>,
}

impl Outputs {
    fn event(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

enum Exit {
    Closed,
    EditsClosed,
}

/// Keeps `handler` in sync with the host until the edit channel closes or the
/// connection is lost.
pub async fn run(
    config: &RunConfig,
    handler: &mut MessageHandler,
    edits: &mut UnboundedReceiver<LocalEdit>,
    outputs: &Outputs,
) -> Result<()> {
    let mut connection = Connection::new(ReconnectPolicy::from(&config.settings));
    let mut session_id = None;
    loop {
        let exit = session_once(
            config,
            handler,
            &mut connection,
            &mut session_id,
            edits,
            outputs,
        )
        .await;
        match exit {
            Ok(Exit::EditsClosed) => return Ok(()),
            Ok(Exit::Closed) => info!("host closed the connection"),
            Err(err) => warn!(error = %err, "session transport failed"),
        }
        match connection.on_transport_error() {
            ReconnectAction::RetryNow => {}
            ReconnectAction::RetryAfter(delay) => tokio::time::sleep(delay).await,
            ReconnectAction::GiveUp => {
                let attempts = config.settings.reconnect_attempts;
                outputs.event(ConnectionEvent::Lost { attempts });
                bail!("connection lost after {attempts} reconnect attempts");
            }
        }
        outputs.event(ConnectionEvent::StateChanged(connection.state()));
    }
}

async fn session_once(
    config: &RunConfig,
    handler: &mut MessageHandler,
    connection: &mut Connection,
    session_id: &mut Option<String>,
    edits: &mut UnboundedReceiver<LocalEdit>,
    outputs: &Outputs,
) -> Result<Exit> {
    let mut client = SessionClient::connect(&config.socket_path, config.limits).await?;
    client
        .send_hello(session_id.clone(), handler.last_seen_sync_id())
        .await?;
    if connection.state() != ConnectionState::Connected {
        connection.on_reconnected();
        outputs.event(ConnectionEvent::StateChanged(connection.state()));
    }
    let period = Duration::from_millis((config.settings.gap_timeout_ms / 4).max(50));
    let mut gap_tick = tokio::time::interval(period);
    loop {
        tokio::select! {
            msg = client.poll_message() => match msg? {
                None => return Ok(Exit::Closed),
                Some(Message::Welcome(welcome)) => {
                    on_welcome(&welcome, &mut client, handler, connection, outputs).await?;
                    *session_id = Some(welcome.session_id);
                }
                Some(Message::Update { text }) => {
                    if let Some(reason) = handler.enqueue(text) {
                        debug!(%reason, "inbound queue overflowed");
                    }
                    let report = handler.process_all(tokio::time::Instant::now().into_std());
                    if !report.changes.is_empty() {
                        let _ = outputs.changes.send(report.changes);
                    }
                    if connection.state() == ConnectionState::Resyncing
                        && !handler.resync_pending()
                        && !report.applied.is_empty()
                    {
                        connection.on_resync_complete();
                        outputs.event(ConnectionEvent::StateChanged(connection.state()));
                    }
                }
                Some(Message::Error(err)) => bail!("host error {}: {}", err.name, err.message),
                Some(other) => debug!(op = other.op_name(), "ignoring unexpected message"),
            },
            edit = edits.recv() => match edit {
                None => return Ok(Exit::EditsClosed),
                Some(edit) => {
                    if let Err(err) = handler
                        .mirror_mut()
                        .set_local(edit.node, edit.feature, &edit.key, edit.value)
                    {
                        warn!(error = %err, "dropping local edit");
                    }
                }
            },
            _ = gap_tick.tick() => {
                handler.check_gap(tokio::time::Instant::now().into_std());
            }
        }
        if let Some(msg) = handler.build_message() {
            client.send_sync(&msg).await?;
        }
    }
}

async fn on_welcome(
    welcome: &WelcomePayload,
    client: &mut SessionClient,
    handler: &mut MessageHandler,
    connection: &mut Connection,
    outputs: &Outputs,
) -> Result<()> {
    info!(session = %welcome.session_id, resumed = welcome.resumed, "session established");
    if !welcome.resumed {
        handler.reset_session();
        return Ok(());
    }
    if let Some(msg) = handler.resend_in_flight() {
        client.send_sync(&msg).await?;
    }
    if connection.state() == ConnectionState::Resyncing && !handler.resync_pending() {
        connection.on_resync_complete();
        outputs.event(ConnectionEvent::StateChanged(connection.state()));
    }
    Ok(())
}

/// Blocking helper: run a client on a background thread.
///
/// Returns the change and event receivers plus the edit sender. Dropping the
/// edit sender stops the client.
pub fn connect_channels(
    path: impl Into<PathBuf>,
    settings: ClientSettings,
) -> (
    Receiver<MirrorChanges>,
    Receiver<ConnectionEvent>,
    UnboundedSender<LocalEdit>,
) {
    let (changes_tx, changes_rx) = mpsc::channel();
    let (events_tx, events_rx) = mpsc::channel();
    let (edits_tx, mut edits_rx) = unbounded_channel();
    let config = RunConfig {
        socket_path: path.into(),
        settings,
        limits: TransportLimits::default(),
    };

    thread::spawn(move || {
        let outputs = Outputs {
            changes: changes_tx,
            events: events_tx,
        };
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!(error = %err, "could not start client runtime");
                outputs.event(ConnectionEvent::Lost { attempts: 0 });
                return;
            }
        };
        let mut handler = MessageHandler::new(config.settings.clone());
        if let Err(err) = runtime.block_on(run(&config, &mut handler, &mut edits_rx, &outputs)) {
            warn!(error = %err, "session client stopped");
        }
    });

    (changes_rx, events_rx, edits_tx)
}
