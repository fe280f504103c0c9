// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Typed settings for the sync client and the session host.
//!
//! Stored as JSON through [`crate::config::ConfigService`]; missing fields
//! take their defaults so older documents keep loading.

use serde::{Deserialize, Serialize};

/// Config key for [`ClientSettings`].
pub const CLIENT_SETTINGS_KEY: &str = "sync_client";
/// Config key for [`HostSettings`].
pub const HOST_SETTINGS_KEY: &str = "session_host";

/// Client-side sync and reconnect tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Reconnect attempts before the connection is declared lost.
    pub reconnect_attempts: u32,
    /// Delay before the second reconnect attempt (the first is immediate).
    pub reconnect_initial_ms: u64,
    /// Upper bound for the exponential back-off.
    pub reconnect_max_ms: u64,
    /// Out-of-order messages buffered while waiting for a gap to fill.
    pub max_pending_messages: usize,
    /// Raw responses queued before processing; overflow forces a resync.
    pub max_queued_batches: usize,
    /// How long a sync id gap may stay open before resynchronizing.
    pub gap_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            reconnect_attempts: 10,
            reconnect_initial_ms: 250,
            reconnect_max_ms: 5_000,
            max_pending_messages: 64,
            max_queued_batches: 256,
            gap_timeout_ms: 5_000,
        }
    }
}

/// Session host settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    /// Unix socket path; `None` uses the runtime-dir default.
    pub socket_path: Option<String>,
    /// Encoded responses kept per session for replay on reconnect.
    pub history_capacity: usize,
    /// Flush cycles a detached node survives before collection.
    pub gc_grace_cycles: u64,
    /// Largest accepted (reassembled) packet payload.
    pub max_payload_bytes: usize,
    /// Largest outbound packet payload before segmentation.
    pub max_segment_bytes: usize,
    /// Interval of the demo push task; `0` disables it.
    pub push_interval_ms: u64,
    /// How long a session with no bound connection is kept for resume.
    pub session_idle_ms: u64,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            socket_path: None,
            history_capacity: 64,
            gc_grace_cycles: 1,
            max_payload_bytes: 8 * 1024 * 1024,
            max_segment_bytes: 64 * 1024,
            push_interval_ms: 1_000,
            session_idle_ms: 300_000,
        }
    }
}
