// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Connection state machine with bounded reconnect attempts.

use std::time::Duration;

use tether_app_core::settings::ClientSettings;
use tracing::{info, warn};

/// Where the connection stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport up and mirror in sync.
    Connected,
    /// Transport failed; `attempt` counts reconnects tried so far.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// Transport back; waiting for the server to bring the mirror up to date.
    Resyncing,
    /// Gave up. Terminal.
    Lost,
}

/// What the caller should do after a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Reconnect immediately.
    RetryNow,
    /// Reconnect after the delay.
    RetryAfter(Duration),
    /// Stop; the connection is lost.
    GiveUp,
}

/// Events reported to tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The state changed.
    StateChanged(ConnectionState),
    /// Reconnecting failed for good after `attempts` tries.
    Lost {
        /// Attempts made.
        attempts: u32,
    },
}

/// Back-off parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial: Duration,
    /// Upper bound for the delay.
    pub max: Duration,
}

impl ReconnectPolicy {
    /// Delay before `attempt` (1-based). The first attempt is immediate.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let shift = (attempt - 2).min(16);
        self.initial.saturating_mul(1 << shift).min(self.max)
    }
}

impl From<&ClientSettings> for ReconnectPolicy {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            max_attempts: settings.reconnect_attempts,
            initial: Duration::from_millis(settings.reconnect_initial_ms),
            max: Duration::from_millis(settings.reconnect_max_ms),
        }
    }
}

/// Tracks [`ConnectionState`] and decides when to retry.
#[derive(Debug, Clone)]
pub struct Connection {
    state: ConnectionState,
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Connection {
    /// A connection assumed up.
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Connected,
            policy,
            attempt: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns `true` once the connection is lost.
    pub fn is_lost(&self) -> bool {
        self.state == ConnectionState::Lost
    }

    /// Records a transport failure (including a failed reconnect attempt).
    pub fn on_transport_error(&mut self) -> ReconnectAction {
        if self.is_lost() {
            return ReconnectAction::GiveUp;
        }
        self.attempt += 1;
        if self.attempt > self.policy.max_attempts {
            warn!(attempts = self.policy.max_attempts, "connection lost");
            self.state = ConnectionState::Lost;
            return ReconnectAction::GiveUp;
        }
        self.state = ConnectionState::Reconnecting {
            attempt: self.attempt,
        };
        let delay = self.policy.delay_for(self.attempt);
        if delay.is_zero() {
            ReconnectAction::RetryNow
        } else {
            ReconnectAction::RetryAfter(delay)
        }
    }

    /// The transport is back; the mirror still has to catch up.
    pub fn on_reconnected(&mut self) {
        if !self.is_lost() {
            info!(attempt = self.attempt, "reconnected");
            self.state = ConnectionState::Resyncing;
        }
    }

    /// The server brought the mirror up to date.
    pub fn on_resync_complete(&mut self) {
        if !self.is_lost() {
            self.state = ConnectionState::Connected;
            self.attempt = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            initial: Duration::from_millis(100),
            max: Duration::from_millis(350),
        }
    }

    #[test]
    fn back_off_starts_immediate_then_doubles_to_the_cap() {
        let mut conn = Connection::new(policy(5));
        assert_eq!(conn.on_transport_error(), ReconnectAction::RetryNow);
        assert_eq!(conn.state(), ConnectionState::Reconnecting { attempt: 1 });
        assert_eq!(
            conn.on_transport_error(),
            ReconnectAction::RetryAfter(Duration::from_millis(100))
        );
        assert_eq!(
            conn.on_transport_error(),
            ReconnectAction::RetryAfter(Duration::from_millis(200))
        );
        assert_eq!(
            conn.on_transport_error(),
            ReconnectAction::RetryAfter(Duration::from_millis(350))
        );
    }

    #[test]
    fn gives_up_after_the_last_attempt_and_stays_lost() {
        let mut conn = Connection::new(policy(2));
        conn.on_transport_error();
        conn.on_transport_error();
        assert_eq!(conn.on_transport_error(), ReconnectAction::GiveUp);
        assert!(conn.is_lost());
        conn.on_reconnected();
        conn.on_resync_complete();
        assert_eq!(conn.state(), ConnectionState::Lost);
    }

    #[test]
    fn successful_resync_resets_the_attempt_counter() {
        let mut conn = Connection::new(policy(2));
        conn.on_transport_error();
        conn.on_transport_error();
        conn.on_reconnected();
        assert_eq!(conn.state(), ConnectionState::Resyncing);
        conn.on_resync_complete();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.on_transport_error(), ReconnectAction::RetryNow);
    }

    #[test]
    fn policy_follows_client_settings() {
        let settings = ClientSettings::default();
        let policy = ReconnectPolicy::from(&settings);
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(2), Duration::from_millis(250));
        assert_eq!(policy.delay_for(30), Duration::from_millis(5_000));
    }
}
