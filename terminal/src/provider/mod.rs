//! # Wallet Provider Abstraction
//!
//! One capability surface over the two supported connectivity modes:
//!
//! - **[`injected::InjectedProvider`]**: a wallet the host environment exposes
//!   directly (a local JSON-RPC bridge); detection is synchronous and
//!   connecting is a single account request.
//! - **[`universal::UniversalProvider`]**: a relay-paired wallet reached over
//!   WebSocket, requiring an explicit handshake (project identification plus a
//!   pairing URI the user approves from their wallet).
//!
//! New provider kinds are added by implementing [`WalletProvider`], not by
//! branching on runtime property sniffing.
//!
//! Both variants surface the same events through [`Subscription`] tokens. A
//! token is handed out per subscribe and must be released individually, so a
//! provider swap can never leave a stale handler registered against a
//! discarded connection.

pub mod injected;
pub mod universal;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use crate::core::error::{ConnectError, ProviderError};

/// Which connectivity mode a provider implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Host-provided wallet, always-on in the environment.
    Injected,
    /// Relay-paired wallet (remote or mobile).
    Universal,
}

/// Event delivered by a wallet provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// The wallet's account list changed. Empty means the wallet revoked
    /// access entirely.
    AccountsChanged(Vec<String>),
    /// The wallet switched network; payload is the hex chain id (`"0x1"`).
    ChainChanged(String),
    /// The wallet side ended the connection.
    Disconnected(String),
}

impl ProviderEvent {
    fn kind(&self) -> ProviderEventKind {
        match self {
            ProviderEvent::AccountsChanged(_) => ProviderEventKind::AccountsChanged,
            ProviderEvent::ChainChanged(_) => ProviderEventKind::ChainChanged,
            ProviderEvent::Disconnected(_) => ProviderEventKind::Disconnect,
        }
    }
}

/// Event names a subscriber can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderEventKind {
    AccountsChanged,
    ChainChanged,
    Disconnect,
}

impl ProviderEventKind {
    pub fn all() -> &'static [ProviderEventKind] {
        &[
            ProviderEventKind::AccountsChanged,
            ProviderEventKind::ChainChanged,
            ProviderEventKind::Disconnect,
        ]
    }
}

/// Opaque handle binding one event name to one delivery channel.
///
/// Owned by the session; released exactly once via
/// [`WalletProvider::unsubscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    kind: ProviderEventKind,
}

impl Subscription {
    /// Mint a token. Only provider implementations should call this; the
    /// session treats tokens as opaque.
    pub fn new(id: u64, kind: ProviderEventKind) -> Self {
        Self { id, kind }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ProviderEventKind {
        self.kind
    }
}

/// Result of a successful wallet handshake.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Authorized accounts; the first entry is the primary account.
    pub accounts: Vec<String>,
    /// Numeric chain id of the wallet's current network.
    pub chain_id: u64,
}

/// Capability surface shared by every provider variant.
#[async_trait]
pub trait WalletProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Establish the connection and return accounts plus chain id. For the
    /// injected variant this is a single account request; for the universal
    /// variant it runs the full relay pairing handshake.
    async fn connect(&self) -> Result<Handshake, ConnectError>;

    /// Accounts already authorized for this app, without prompting the user.
    /// Used by startup auto-connect to avoid surprise wallet popups.
    async fn authorized_accounts(&self) -> Result<Vec<String>, ProviderError>;

    /// Current numeric chain id.
    async fn chain_id(&self) -> Result<u64, ProviderError>;

    /// Native balance of `address`, in the chain's smallest unit.
    async fn get_balance(&self, address: &str) -> Result<u128, ProviderError>;

    /// Ask the wallet to sign `message` with `address`; returns the signature
    /// as a hex string.
    async fn sign_message(&self, address: &str, message: &str) -> Result<String, ProviderError>;

    /// Invoke the wallet's token transfer primitive. Returns the transaction
    /// hash. No transaction construction happens client-side beyond the
    /// standard transfer call encoding.
    async fn transfer_token(
        &self,
        token: &str,
        from: &str,
        to: &str,
        amount: u128,
    ) -> Result<String, ProviderError>;

    /// Register `sender` for events of `kind`. The returned token must be
    /// released with [`unsubscribe`](Self::unsubscribe).
    fn subscribe(
        &self,
        kind: ProviderEventKind,
        sender: async_channel::Sender<ProviderEvent>,
    ) -> Subscription;

    /// Release a subscription token. Idempotent per token because tokens are
    /// consumed by value.
    fn unsubscribe(&self, subscription: Subscription);

    /// Tear down the provider-side connection. Best-effort; the session logs
    /// failures rather than propagating them.
    async fn disconnect(&self) -> Result<(), ProviderError>;
}

/// Source of provider instances for the session manager.
///
/// Each call hands out a fresh provider so a reconnect or wallet switch gets
/// a clean handshake; the session owns the instance it adopts.
pub trait ProviderFactory: Send + Sync {
    /// The host-provided wallet, when the environment exposes one.
    fn injected(&self) -> Option<std::sync::Arc<dyn WalletProvider>>;

    /// The relay-paired wallet. Fails only when misconfigured.
    fn universal(&self) -> Result<std::sync::Arc<dyn WalletProvider>, ConnectError>;
}

/// Factory wired from [`Config`](crate::core::Config) and client storage.
pub struct ConfigProviderFactory {
    config: crate::core::Config,
    storage: std::sync::Arc<dyn crate::services::storage::ClientStorage>,
}

impl ConfigProviderFactory {
    pub fn new(
        config: crate::core::Config,
        storage: std::sync::Arc<dyn crate::services::storage::ClientStorage>,
    ) -> Self {
        Self { config, storage }
    }
}

impl ProviderFactory for ConfigProviderFactory {
    fn injected(&self) -> Option<std::sync::Arc<dyn WalletProvider>> {
        injected::InjectedProvider::detect(&self.config)
            .map(|p| std::sync::Arc::new(p) as std::sync::Arc<dyn WalletProvider>)
    }

    fn universal(&self) -> Result<std::sync::Arc<dyn WalletProvider>, ConnectError> {
        if self.config.relay_project_id.is_empty() {
            return Err(ConnectError::Misconfigured(
                "RELAY_PROJECT_ID is not set".to_string(),
            ));
        }
        Ok(std::sync::Arc::new(universal::UniversalProvider::new(
            self.config.relay_url.clone(),
            self.config.relay_project_id.clone(),
            self.config.handshake_timeout,
            std::sync::Arc::clone(&self.storage),
        )))
    }
}

/// Fan-out registry shared by the provider implementations.
///
/// Keeps one sender per subscription token; emitting an event clones it to
/// every sender registered for that event's kind. Dropping the last sender for
/// a receiver closes that receiver, which is how the session's event pump
/// terminates after unsubscribe.
#[derive(Default)]
pub(crate) struct EventRegistry {
    subscribers: Mutex<HashMap<u64, (ProviderEventKind, async_channel::Sender<ProviderEvent>)>>,
    next_id: AtomicU64,
}

impl EventRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(
        &self,
        kind: ProviderEventKind,
        sender: async_channel::Sender<ProviderEvent>,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, (kind, sender));
        Subscription { id, kind }
    }

    pub(crate) fn unsubscribe(&self, subscription: Subscription) {
        let removed = self.subscribers.lock().remove(&subscription.id);
        trace!(
            id = subscription.id,
            kind = ?subscription.kind,
            released = removed.is_some(),
            "subscription released"
        );
    }

    pub(crate) fn emit(&self, event: ProviderEvent) {
        let kind = event.kind();
        let subscribers = self.subscribers.lock();
        for (entry_kind, sender) in subscribers.values() {
            if *entry_kind == kind {
                // try_send on an unbounded channel only fails when the
                // receiver is gone, which just means nobody is listening.
                let _ = sender.try_send(event.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_routes_by_kind() {
        let registry = EventRegistry::new();
        let (tx, rx) = async_channel::unbounded();

        let sub = registry.subscribe(ProviderEventKind::ChainChanged, tx);
        registry.emit(ProviderEvent::AccountsChanged(vec!["0xabc".into()]));
        registry.emit(ProviderEvent::ChainChanged("0x89".into()));

        assert_eq!(
            rx.try_recv().unwrap(),
            ProviderEvent::ChainChanged("0x89".into())
        );
        assert!(rx.try_recv().is_err());

        registry.unsubscribe(sub);
        registry.emit(ProviderEvent::ChainChanged("0x1".into()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe_closes_channel_when_last_sender_dropped() {
        let registry = EventRegistry::new();
        let (tx, rx) = async_channel::unbounded();

        let subs: Vec<_> = ProviderEventKind::all()
            .iter()
            .map(|kind| registry.subscribe(*kind, tx.clone()))
            .collect();
        drop(tx);

        assert!(!rx.is_closed());
        for sub in subs {
            registry.unsubscribe(sub);
        }
        assert!(rx.is_closed());
    }
}
