//! # Session State Types
//!
//! The observable record of the currently connected wallet identity and its
//! validated network. UI code reads snapshots; only the session manager
//! mutates them.

use crate::provider::ProviderKind;

/// Wallet session lifecycle state.
///
/// `Disconnected` is the resting state; `Disconnecting` is transient and
/// re-entrant from any state. `NetworkInvalid` is still a live connection,
/// flagged so the caller can prompt a network switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    NetworkInvalid,
    Disconnecting,
}

/// Outcome of the registration lookup for the current account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationStatus {
    /// Lookup not yet resolved (or no account connected).
    Unknown,
    /// The address maps to an application user.
    Registered { username: String },
    /// No user record exists for the address.
    Unregistered,
}

/// Live record of the wallet session.
///
/// Invariant: when not connected, `account` is `None` and `registration` is
/// `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub state: SessionState,
    pub account: Option<String>,
    pub chain_id: Option<u64>,
    pub provider_kind: Option<ProviderKind>,
    /// Display name of the validated network, when on the allow-list.
    pub network_name: Option<&'static str>,
    pub registration: RegistrationStatus,
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            account: None,
            chain_id: None,
            provider_kind: None,
            network_name: None,
            registration: RegistrationStatus::Unknown,
        }
    }

    /// Connected in either network state.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            SessionState::Connected | SessionState::NetworkInvalid
        )
    }

    pub fn is_network_valid(&self) -> bool {
        self.state == SessionState::Connected
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
