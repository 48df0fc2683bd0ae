// src/network/state.rs
//! Pool session lifecycle states

use crate::utils::error::MinerError;
use std::fmt;

/// Connection state of a pool session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Not started
    Disconnected,
    /// Opening the transport
    Connecting,
    /// Transport open, registration sent, waiting for acknowledgment
    Subscribing,
    /// Registered; receiving work and submitting shares
    Active,
    /// Waiting out the backoff before the next attempt
    Reconnecting,
    /// Shut down for good
    Terminated,
}

impl SessionState {
    /// Every state, in lifecycle order
    pub const ALL: [SessionState; 6] = [
        SessionState::Disconnected,
        SessionState::Connecting,
        SessionState::Subscribing,
        SessionState::Active,
        SessionState::Reconnecting,
        SessionState::Terminated,
    ];

    /// Whether the session may move from `self` to `next`
    ///
    /// Failures while connecting or subscribing back off just like failures
    /// of an active session. Any live state may terminate.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Subscribing)
                | (Subscribing, Active)
                | (Active, Reconnecting)
                | (Connecting, Reconnecting)
                | (Subscribing, Reconnecting)
                | (Reconnecting, Connecting)
                | (Disconnected, Terminated)
                | (Connecting, Terminated)
                | (Subscribing, Terminated)
                | (Active, Terminated)
                | (Reconnecting, Terminated)
        )
    }

    /// Validated transition
    pub fn transition(self, next: SessionState) -> Result<SessionState, MinerError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(MinerError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Subscribing => "subscribing",
            SessionState::Active => "active",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}
