// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Session wire schema for Tether.
//!
//! Two layers live here. The JSON layer ([`codec`], [`message`], [`framing`])
//! is what the tree and mirror agree on: change records, server/client
//! messages and the `for(;;);[...]` framing. The socket layer ([`wire`]) moves
//! those texts between processes inside CBOR `OpEnvelope`s carried by
//! checksummed, optionally segmented packets.

pub use tether_tree::{FeatureId, FeatureValue, NodeChange, NodeId, SpliceItems};

pub mod codec;
mod error;
pub mod framing;
pub mod message;
pub mod wire;

pub use codec::{decode_change, decode_changes, encode_change, encode_changes};
pub use error::{DecodeError, FrameError};
pub use framing::{decode_response, split_payloads, wrap, PREFIX};
pub use message::{ClientEdit, ClientMessage, ClientSeq, ResponseMeta, ServerMessage, SyncId};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Socket the host listens on unless configured otherwise:
/// `$XDG_RUNTIME_DIR/tether-session.sock`, or the same name under `/tmp`.
pub fn default_socket_path() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map_or_else(|| PathBuf::from("/tmp"), PathBuf::from)
        .join("tether-session.sock")
}

/// CBOR body of every packet: an op tag, the host clock and the op's data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpEnvelope<P> {
    /// One of [`Message::op_name`].
    pub op: String,
    /// Stamp from the sender's clock; the host's clock is the one that counts.
    pub ts: u64,
    /// Data for `op`.
    pub payload: P,
}

/// Why the host is about to hang up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    /// Numeric class of the failure.
    pub code: u32,
    /// Symbolic name such as `E_BAD_PACKET`.
    pub name: String,
    /// Structured context, when there is any.
    #[serde(default)]
    pub details: Option<ciborium::value::Value>,
    /// Text for logs.
    pub message: String,
}

impl ErrorPayload {
    /// Error without details.
    pub fn new(code: u32, name: &str, message: impl Into<String>) -> Self {
        Self {
            code,
            name: name.to_owned(),
            details: None,
            message: message.into(),
        }
    }
}

/// First packet a client sends on a fresh connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
    /// Session to resume; `None` starts a new session.
    pub session_id: Option<String>,
    /// Last server sync id the client applied.
    pub last_applied: Option<SyncId>,
    /// Build number of the client library.
    pub client_version: u32,
}

/// Host reply to a hello, naming the bound session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WelcomePayload {
    /// Session the connection is bound to.
    pub session_id: String,
    /// Build number of the host.
    pub server_version: u32,
    /// `true` when the requested session was found.
    pub resumed: bool,
}

/// Body of `sync` and `update` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextPayload {
    /// JSON client message or framed server response.
    pub text: String,
}

/// Decoded packet contents.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Opens or resumes a session.
    Hello(HelloPayload),
    /// Binds the connection to a session.
    Welcome(WelcomePayload),
    /// Client to host: one [`ClientMessage`] as JSON.
    Sync {
        /// [`ClientMessage`] text.
        text: String,
    },
    /// Host to client: framed server messages.
    Update {
        /// `for(;;);[...]` text.
        text: String,
    },
    /// Fatal failure; the connection closes after it.
    Error(ErrorPayload),
}

impl Message {
    /// Tag written to [`OpEnvelope::op`].
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Welcome(_) => "welcome",
            Self::Sync { .. } => "sync",
            Self::Update { .. } => "update",
            Self::Error(_) => "error",
        }
    }
}
