//! # Session Manager
//!
//! The wallet-session state machine. Owns the active provider and its
//! subscription tokens, reacts to provider events, and orchestrates
//! connect / disconnect / switch / reconnect. The registration lookup is
//! issued through the request scheduler, never called directly.
//!
//! ## Ordering rules
//!
//! - All lifecycle mutations run under one async mutex, so connect, disconnect
//!   and event handlers never interleave mid-transition.
//! - Provider events are pumped by a single task, one at a time; a handler
//!   that needs another state-machine operation queues it behind the same
//!   mutex instead of re-entering synchronously.
//! - Teardown cancels all scheduled backend work before anything else, so a
//!   late response from the old identity can never resurrect state for the
//!   new one. Events from a replaced connection are fenced by an epoch
//!   counter.

pub mod state;

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::core::error::{ConnectError, ProviderError, RequestError};
use crate::network;
use crate::provider::universal::UniversalProvider;
use crate::provider::{
    ProviderEvent, ProviderEventKind, ProviderFactory, ProviderKind, Subscription, WalletProvider,
};
use crate::scheduler::RequestScheduler;
use crate::services::api::RegistrationGate;
use crate::services::storage::{ClientStorage, MANUAL_DISCONNECT_KEY, RELAY_PREFIX};

pub use state::{RegistrationStatus, Session, SessionState};

/// Registration lookups run ahead of dashboard refresh traffic.
const REGISTRATION_PRIORITY: i32 = 5;

/// Everything tied to the currently adopted provider.
struct Lifecycle {
    provider: Option<Arc<dyn WalletProvider>>,
    subscriptions: Vec<Subscription>,
    /// Bumped on every adopt/teardown; events carrying a stale epoch are
    /// dropped by the pump handlers.
    epoch: u64,
}

pub struct SessionManager {
    session: Arc<RwLock<Session>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    scheduler: Arc<RequestScheduler<RegistrationStatus>>,
    gate: Arc<dyn RegistrationGate>,
    factory: Arc<dyn ProviderFactory>,
    storage: Arc<dyn ClientStorage>,
    /// Self-handle for the tasks this manager spawns. Weak, so dropping the
    /// last external `Arc` ends those tasks instead of leaking the manager.
    weak: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(
        scheduler: Arc<RequestScheduler<RegistrationStatus>>,
        gate: Arc<dyn RegistrationGate>,
        factory: Arc<dyn ProviderFactory>,
        storage: Arc<dyn ClientStorage>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            session: Arc::new(RwLock::new(Session::new())),
            lifecycle: tokio::sync::Mutex::new(Lifecycle {
                provider: None,
                subscriptions: Vec::new(),
                epoch: 0,
            }),
            scheduler,
            gate,
            factory,
            storage,
            weak: weak.clone(),
        })
    }

    /// Current session snapshot.
    pub fn session(&self) -> Session {
        self.session.read().clone()
    }

    /// Shared handle for UI code that wants to read state without going
    /// through the manager.
    pub fn session_handle(&self) -> Arc<RwLock<Session>> {
        Arc::clone(&self.session)
    }

    /// Connect a wallet: the injected provider first when the host exposes
    /// one, falling back to the universal provider exactly once. On success
    /// the registration lookup is enqueued without blocking the transition.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let mut order = Vec::new();
        if self.factory.injected().is_some() {
            order.push(ProviderKind::Injected);
        }
        order.push(ProviderKind::Universal);
        self.connect_locked(&mut lifecycle, &order).await
    }

    /// Explicit disconnect. Records the manual-disconnect flag so startup
    /// auto-connect stays quiet until the user connects again.
    pub async fn disconnect(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        self.disconnect_locked(&mut lifecycle, false).await;
    }

    /// Switch to a different wallet. Always lands on a fresh universal
    /// handshake (that flow carries the wallet picker); `force` runs the
    /// handshake even when the current session is already universal and, when
    /// nothing is connected, skips the injected preference a plain
    /// [`connect`](Self::connect) would apply.
    pub async fn switch_wallet(&self, force: bool) -> Result<(), ConnectError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let current = self.session.read().provider_kind;

        let order = match (current, force) {
            // Nothing connected and no force: behave like a plain connect.
            (None, false) => {
                let mut order = Vec::new();
                if self.factory.injected().is_some() {
                    order.push(ProviderKind::Injected);
                }
                order.push(ProviderKind::Universal);
                order
            }
            _ => vec![ProviderKind::Universal],
        };

        self.disconnect_locked(&mut lifecycle, true).await;
        self.connect_locked(&mut lifecycle, &order).await
    }

    /// Recover from a soft provider error: silent teardown, then reconnect
    /// preferring the variant that was active, without discarding user intent.
    pub async fn reconnect(&self) -> Result<(), ConnectError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let previous = self.session.read().provider_kind;

        let order = match previous {
            Some(ProviderKind::Injected) => vec![ProviderKind::Injected, ProviderKind::Universal],
            Some(ProviderKind::Universal) => vec![ProviderKind::Universal],
            None => {
                let mut order = Vec::new();
                if self.factory.injected().is_some() {
                    order.push(ProviderKind::Injected);
                }
                order.push(ProviderKind::Universal);
                order
            }
        };

        self.disconnect_locked(&mut lifecycle, true).await;
        self.connect_locked(&mut lifecycle, &order).await
    }

    /// Startup auto-connect. Skipped entirely after an explicit disconnect;
    /// otherwise attempts the variant that can connect without surprising the
    /// user: injected when it already has an authorized account, universal
    /// when a prior relay session record exists. Returns whether a connection
    /// was established.
    pub async fn auto_connect(&self) -> Result<bool, ConnectError> {
        if self.storage.get(MANUAL_DISCONNECT_KEY).is_some() {
            info!("auto-connect skipped: user disconnected manually");
            return Ok(false);
        }

        let mut order = Vec::new();
        if let Some(injected) = self.factory.injected() {
            match injected.authorized_accounts().await {
                Ok(accounts) if !accounts.is_empty() => order.push(ProviderKind::Injected),
                Ok(_) => {}
                Err(e) => debug!(error = %e, "injected wallet not queryable at startup"),
            }
        }
        if order.is_empty() && UniversalProvider::has_session_record(self.storage.as_ref()) {
            order.push(ProviderKind::Universal);
        }
        if order.is_empty() {
            debug!("auto-connect: no eligible provider");
            return Ok(false);
        }

        let mut lifecycle = self.lifecycle.lock().await;
        self.connect_locked(&mut lifecycle, &order).await?;
        Ok(true)
    }

    /// Native balance of the connected account.
    pub async fn balance(&self) -> Result<u128, ProviderError> {
        let (provider, account) = self.connected_provider().await?;
        provider.get_balance(&account).await
    }

    /// Sign a message with the connected account.
    pub async fn sign_message(&self, message: &str) -> Result<String, ProviderError> {
        let (provider, account) = self.connected_provider().await?;
        provider.sign_message(&account, message).await
    }

    /// Invoke the provider's token transfer primitive from the connected
    /// account. Returns the transaction hash.
    pub async fn transfer_token(
        &self,
        token: &str,
        to: &str,
        amount: u128,
    ) -> Result<String, ProviderError> {
        let (provider, account) = self.connected_provider().await?;
        provider.transfer_token(token, &account, to, amount).await
    }

    async fn connected_provider(&self) -> Result<(Arc<dyn WalletProvider>, String), ProviderError> {
        let provider = self
            .lifecycle
            .lock()
            .await
            .provider
            .clone()
            .ok_or(ProviderError::NotConnected)?;
        let account = self
            .session
            .read()
            .account
            .clone()
            .ok_or(ProviderError::NotConnected)?;
        Ok((provider, account))
    }

    async fn connect_locked(
        &self,
        lifecycle: &mut Lifecycle,
        order: &[ProviderKind],
    ) -> Result<(), ConnectError> {
        if self.session.read().is_connected() {
            return Err(ConnectError::Unknown("already connected".to_string()));
        }

        self.session.write().state = SessionState::Connecting;
        // Any connect attempt clears the manual-disconnect marker.
        self.storage.remove(MANUAL_DISCONNECT_KEY);

        let mut last_error = ConnectError::Misconfigured("no wallet provider available".to_string());
        for kind in order {
            let provider = match kind {
                ProviderKind::Injected => match self.factory.injected() {
                    Some(p) => p,
                    None => continue,
                },
                ProviderKind::Universal => match self.factory.universal() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "universal provider unavailable");
                        last_error = e;
                        continue;
                    }
                },
            };

            match provider.connect().await {
                Ok(handshake) => {
                    return self.adopt(lifecycle, provider, handshake).await;
                }
                Err(e) => {
                    warn!(kind = ?kind, error = %e, "provider connect failed");
                    last_error = e;
                }
            }
        }

        *self.session.write() = Session::new();
        Err(last_error)
    }

    /// Take ownership of a freshly connected provider: subscribe, validate
    /// the network, publish the session, and kick off the registration
    /// lookup.
    async fn adopt(
        &self,
        lifecycle: &mut Lifecycle,
        provider: Arc<dyn WalletProvider>,
        handshake: crate::provider::Handshake,
    ) -> Result<(), ConnectError> {
        let Some(account) = handshake.accounts.first().cloned() else {
            let _ = provider.disconnect().await;
            *self.session.write() = Session::new();
            return Err(ConnectError::Unknown("wallet returned no accounts".to_string()));
        };

        let (tx, rx) = async_channel::unbounded();
        let subscriptions = ProviderEventKind::all()
            .iter()
            .map(|kind| provider.subscribe(*kind, tx.clone()))
            .collect();
        drop(tx);

        lifecycle.provider = Some(Arc::clone(&provider));
        lifecycle.subscriptions = subscriptions;
        lifecycle.epoch += 1;
        let epoch = lifecycle.epoch;

        let network = network::find(handshake.chain_id);
        {
            let mut session = self.session.write();
            session.state = if network.is_some() {
                SessionState::Connected
            } else {
                SessionState::NetworkInvalid
            };
            session.account = Some(account.clone());
            session.chain_id = Some(handshake.chain_id);
            session.provider_kind = Some(provider.kind());
            session.network_name = network.map(|n| n.name);
            session.registration = RegistrationStatus::Unknown;
        }

        info!(
            account = %shared::truncate_address(&account),
            chain_id = handshake.chain_id,
            network = network.map(|n| n.name).unwrap_or("unsupported"),
            kind = ?provider.kind(),
            "wallet connected"
        );

        self.spawn_event_pump(rx, epoch);
        self.spawn_registration_lookup(account);
        Ok(())
    }

    async fn disconnect_locked(&self, lifecycle: &mut Lifecycle, silent: bool) {
        let was_connected = {
            let mut session = self.session.write();
            if session.state == SessionState::Disconnected {
                false
            } else {
                session.state = SessionState::Disconnecting;
                true
            }
        };

        // Cancel scheduled backend work before anything else so no stale
        // response can land after the identity is gone.
        self.scheduler.cancel_all();

        if let Some(provider) = lifecycle.provider.take() {
            for subscription in lifecycle.subscriptions.drain(..) {
                provider.unsubscribe(subscription);
            }
            if let Err(e) = provider.disconnect().await {
                warn!(error = %e, "provider disconnect failed");
            }
        }
        lifecycle.epoch += 1;

        *self.session.write() = Session::new();

        if !silent {
            self.storage.set(MANUAL_DISCONNECT_KEY, "true");
        }
        self.storage.remove_prefix(RELAY_PREFIX);

        if was_connected {
            info!(silent, "wallet disconnected");
        }
    }

    /// Single pump per adopted provider; ends when the last subscription for
    /// its channel is released. Events settle one at a time.
    fn spawn_event_pump(&self, rx: async_channel::Receiver<ProviderEvent>, epoch: u64) {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                let Some(manager) = weak.upgrade() else { return };
                manager.handle_event(event, epoch).await;
            }
            debug!(epoch, "event pump ended");
        });
    }

    async fn handle_event(&self, event: ProviderEvent, epoch: u64) {
        // Fence events queued by a connection that has since been replaced.
        if self.lifecycle.lock().await.epoch != epoch {
            debug!(?event, "dropping event from stale connection");
            return;
        }

        match event {
            ProviderEvent::AccountsChanged(accounts) => self.on_accounts_changed(accounts).await,
            ProviderEvent::ChainChanged(chain_hex) => self.on_chain_changed(&chain_hex),
            ProviderEvent::Disconnected(reason) => {
                info!(reason = %reason, "provider reported disconnect");
                // Provider-driven teardown is not a user decision: keep
                // auto-connect eligible next start.
                let mut lifecycle = self.lifecycle.lock().await;
                self.disconnect_locked(&mut lifecycle, true).await;
            }
        }
    }

    async fn on_accounts_changed(&self, accounts: Vec<String>) {
        if accounts.is_empty() {
            info!("wallet revoked all accounts");
            // The user pulled access from the wallet side; treat it like an
            // explicit disconnect.
            let mut lifecycle = self.lifecycle.lock().await;
            self.disconnect_locked(&mut lifecycle, false).await;
            return;
        }

        let primary = accounts[0].clone();
        let previous = {
            let mut session = self.session.write();
            if !session.is_connected() || session.account.as_deref() == Some(primary.as_str()) {
                return;
            }
            let previous = session.account.replace(primary.clone());
            session.registration = RegistrationStatus::Unknown;
            previous
        };

        info!(
            account = %shared::truncate_address(&primary),
            "wallet switched account"
        );
        if let Some(previous) = previous {
            self.scheduler.cancel(&registration_key(&previous));
        }
        self.spawn_registration_lookup(primary);
    }

    fn on_chain_changed(&self, chain_hex: &str) {
        let Some(chain_id) = network::parse_chain_id_hex(chain_hex) else {
            warn!(chain = %chain_hex, "ignoring malformed chain id");
            return;
        };

        let mut session = self.session.write();
        if !session.is_connected() {
            return;
        }
        session.chain_id = Some(chain_id);
        match network::find(chain_id) {
            Some(network) => {
                session.state = SessionState::Connected;
                session.network_name = Some(network.name);
                info!(chain_id, network = network.name, "switched to supported network");
            }
            None => {
                session.state = SessionState::NetworkInvalid;
                session.network_name = None;
                warn!(chain_id, "switched to unsupported network");
            }
        }
    }

    /// Enqueue the registration lookup for `account` and apply the result
    /// when it arrives, unless the session has moved on to a different
    /// account by then. Never blocks the connect transition.
    fn spawn_registration_lookup(&self, account: String) {
        let gate = Arc::clone(&self.gate);
        let lookup_account = account.clone();
        let pending = self
            .scheduler
            .enqueue(registration_key(&account), REGISTRATION_PRIORITY, move || async move {
                gate.lookup(&lookup_account).await
            });

        let session_handle = Arc::clone(&self.session);
        tokio::spawn(async move {
            match pending.await {
                Ok(status) => {
                    let mut session = session_handle.write();
                    if session.is_connected() && session.account.as_deref() == Some(account.as_str())
                    {
                        debug!(
                            account = %shared::truncate_address(&account),
                            status = ?status,
                            "registration lookup resolved"
                        );
                        session.registration = status;
                    }
                }
                Err(RequestError::Cancelled) => {
                    debug!(
                        account = %shared::truncate_address(&account),
                        "registration lookup superseded"
                    );
                }
                Err(e) => {
                    warn!(
                        account = %shared::truncate_address(&account),
                        error = %e,
                        "registration lookup failed"
                    );
                }
            }
        });
    }
}

fn registration_key(account: &str) -> String {
    format!("registration_{}", account)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{EventRegistry, Handshake};
    use crate::scheduler::SchedulerConfig;
    use crate::services::storage::{MemoryStorage, RELAY_TOPIC_KEY};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct MockProvider {
        kind: ProviderKind,
        registry: Arc<EventRegistry>,
        accounts: Mutex<Vec<String>>,
        chain_id: Mutex<u64>,
        authorized: Mutex<Vec<String>>,
        fail_connect: Mutex<Option<ConnectError>>,
        connect_calls: AtomicUsize,
        disconnect_calls: AtomicUsize,
    }

    impl MockProvider {
        fn new(kind: ProviderKind, accounts: &[&str], chain_id: u64) -> Arc<Self> {
            Arc::new(Self {
                kind,
                registry: Arc::new(EventRegistry::new()),
                accounts: Mutex::new(accounts.iter().map(|s| s.to_string()).collect()),
                chain_id: Mutex::new(chain_id),
                authorized: Mutex::new(Vec::new()),
                fail_connect: Mutex::new(None),
                connect_calls: AtomicUsize::new(0),
                disconnect_calls: AtomicUsize::new(0),
            })
        }

        fn failing(kind: ProviderKind, error: ConnectError) -> Arc<Self> {
            let provider = Self::new(kind, &[], 1);
            *provider.fail_connect.lock() = Some(error);
            provider
        }

        fn emit(&self, event: ProviderEvent) {
            self.registry.emit(event);
        }
    }

    #[async_trait]
    impl WalletProvider for MockProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn connect(&self) -> Result<Handshake, ConnectError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.fail_connect.lock().clone() {
                return Err(error);
            }
            Ok(Handshake {
                accounts: self.accounts.lock().clone(),
                chain_id: *self.chain_id.lock(),
            })
        }

        async fn authorized_accounts(&self) -> Result<Vec<String>, ProviderError> {
            Ok(self.authorized.lock().clone())
        }

        async fn chain_id(&self) -> Result<u64, ProviderError> {
            Ok(*self.chain_id.lock())
        }

        async fn get_balance(&self, _address: &str) -> Result<u128, ProviderError> {
            Ok(1_000_000_000_000_000_000)
        }

        async fn sign_message(&self, _address: &str, message: &str) -> Result<String, ProviderError> {
            Ok(format!("0xsigned:{}", message))
        }

        async fn transfer_token(
            &self,
            _token: &str,
            _from: &str,
            _to: &str,
            _amount: u128,
        ) -> Result<String, ProviderError> {
            Ok("0xtxhash".to_string())
        }

        fn subscribe(
            &self,
            kind: ProviderEventKind,
            sender: async_channel::Sender<ProviderEvent>,
        ) -> Subscription {
            self.registry.subscribe(kind, sender)
        }

        fn unsubscribe(&self, subscription: Subscription) {
            self.registry.unsubscribe(subscription);
        }

        async fn disconnect(&self) -> Result<(), ProviderError> {
            self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockFactory {
        injected: Option<Arc<MockProvider>>,
        universal: Arc<MockProvider>,
    }

    impl ProviderFactory for MockFactory {
        fn injected(&self) -> Option<Arc<dyn WalletProvider>> {
            self.injected
                .as_ref()
                .map(|p| Arc::clone(p) as Arc<dyn WalletProvider>)
        }

        fn universal(&self) -> Result<Arc<dyn WalletProvider>, ConnectError> {
            Ok(Arc::clone(&self.universal) as Arc<dyn WalletProvider>)
        }
    }

    struct MockGate {
        responses: Mutex<HashMap<String, RegistrationStatus>>,
        calls: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl MockGate {
        fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                delay: None,
            }
        }

        fn with(mut self, address: &str, status: RegistrationStatus) -> Self {
            self.responses.lock().insert(address.to_string(), status);
            self
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }
    }

    #[async_trait]
    impl RegistrationGate for MockGate {
        async fn lookup(&self, address: &str) -> Result<RegistrationStatus, RequestError> {
            self.calls.lock().push(address.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self
                .responses
                .lock()
                .get(address)
                .cloned()
                .unwrap_or(RegistrationStatus::Unregistered))
        }
    }

    struct Harness {
        manager: Arc<SessionManager>,
        scheduler: Arc<RequestScheduler<RegistrationStatus>>,
        storage: Arc<MemoryStorage>,
        injected: Option<Arc<MockProvider>>,
        universal: Arc<MockProvider>,
    }

    fn harness(injected: Option<Arc<MockProvider>>, universal: Arc<MockProvider>, gate: MockGate) -> Harness {
        let scheduler = Arc::new(RequestScheduler::new(SchedulerConfig {
            min_interval: Duration::from_millis(100),
            cache_ttl: Duration::from_secs(30),
            rate_limit_backoff: Duration::from_secs(2),
        }));
        let storage = Arc::new(MemoryStorage::new());
        let factory = Arc::new(MockFactory {
            injected: injected.clone(),
            universal: Arc::clone(&universal),
        });
        let manager = SessionManager::new(
            Arc::clone(&scheduler),
            Arc::new(gate),
            factory,
            storage.clone() as Arc<dyn ClientStorage>,
        );
        Harness {
            manager,
            scheduler,
            storage,
            injected,
            universal,
        }
    }

    /// Let spawned tasks (event pump, lookup) run to completion under the
    /// paused clock.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_falls_back_to_universal() {
        let universal = MockProvider::new(ProviderKind::Universal, &["0xabc"], 1);
        let gate = MockGate::new().with(
            "0xabc",
            RegistrationStatus::Registered {
                username: "alice".to_string(),
            },
        );
        let h = harness(None, Arc::clone(&universal), gate);

        h.manager.connect().await.unwrap();
        let session = h.manager.session();
        assert_eq!(session.state, SessionState::Connected);
        assert_eq!(session.account.as_deref(), Some("0xabc"));
        assert_eq!(session.provider_kind, Some(ProviderKind::Universal));
        assert_eq!(session.network_name, Some("Ethereum Mainnet"));

        settle().await;
        assert_eq!(
            h.manager.session().registration,
            RegistrationStatus::Registered {
                username: "alice".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_prefers_injected() {
        let injected = MockProvider::new(ProviderKind::Injected, &["0xabc"], 137);
        let universal = MockProvider::new(ProviderKind::Universal, &["0xdef"], 1);
        let h = harness(Some(Arc::clone(&injected)), Arc::clone(&universal), MockGate::new());

        h.manager.connect().await.unwrap();
        let session = h.manager.session();
        assert_eq!(session.provider_kind, Some(ProviderKind::Injected));
        assert_eq!(session.network_name, Some("Polygon"));
        assert_eq!(universal.connect_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_falls_back_exactly_once() {
        let injected = MockProvider::failing(ProviderKind::Injected, ConnectError::UserRejected);
        let universal = MockProvider::new(ProviderKind::Universal, &["0xabc"], 1);
        let h = harness(Some(Arc::clone(&injected)), Arc::clone(&universal), MockGate::new());

        h.manager.connect().await.unwrap();
        assert_eq!(h.manager.session().provider_kind, Some(ProviderKind::Universal));
        assert_eq!(injected.connect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(universal.connect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_leaves_disconnected() {
        let injected = MockProvider::failing(ProviderKind::Injected, ConnectError::UserRejected);
        let universal = MockProvider::failing(ProviderKind::Universal, ConnectError::Timeout);
        let h = harness(Some(injected), universal, MockGate::new());

        let result = h.manager.connect().await;
        assert_eq!(result, Err(ConnectError::Timeout));
        let session = h.manager.session();
        assert_eq!(session.state, SessionState::Disconnected);
        assert_eq!(session.account, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_on_unsupported_network_is_network_invalid() {
        let universal = MockProvider::new(ProviderKind::Universal, &["0xabc"], 999_999);
        let h = harness(None, universal, MockGate::new());

        h.manager.connect().await.unwrap();
        let session = h.manager.session();
        assert_eq!(session.state, SessionState::NetworkInvalid);
        assert!(session.is_connected());
        assert_eq!(session.account.as_deref(), Some("0xabc"));
        assert_eq!(session.network_name, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_accounts_event_disconnects() {
        let universal = MockProvider::new(ProviderKind::Universal, &["0xabc"], 1);
        let h = harness(None, Arc::clone(&universal), MockGate::new());

        h.manager.connect().await.unwrap();
        settle().await;

        universal.emit(ProviderEvent::AccountsChanged(Vec::new()));
        settle().await;

        let session = h.manager.session();
        assert_eq!(session.state, SessionState::Disconnected);
        assert_eq!(session.account, None);
        assert_eq!(session.registration, RegistrationStatus::Unknown);
        assert_eq!(h.scheduler.pending(), 0);
        assert_eq!(universal.disconnect_calls.load(Ordering::SeqCst), 1);
        // Revocation from the wallet side counts as a manual disconnect.
        assert!(h.storage.get(MANUAL_DISCONNECT_KEY).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_account_switch_reissues_lookup() {
        let universal = MockProvider::new(ProviderKind::Universal, &["0xabc"], 1);
        let gate = MockGate::new()
            .with(
                "0xabc",
                RegistrationStatus::Registered {
                    username: "alice".to_string(),
                },
            )
            .with("0xdef", RegistrationStatus::Unregistered);
        let h = harness(None, Arc::clone(&universal), gate);

        h.manager.connect().await.unwrap();
        settle().await;
        assert_eq!(
            h.manager.session().registration,
            RegistrationStatus::Registered {
                username: "alice".to_string()
            }
        );

        universal.emit(ProviderEvent::AccountsChanged(vec!["0xdef".to_string()]));
        settle().await;

        let session = h.manager.session();
        assert_eq!(session.account.as_deref(), Some("0xdef"));
        assert_eq!(session.registration, RegistrationStatus::Unregistered);
        assert!(session.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_chain_changed_toggles_network_validity() {
        let universal = MockProvider::new(ProviderKind::Universal, &["0xabc"], 1);
        let h = harness(None, Arc::clone(&universal), MockGate::new());

        h.manager.connect().await.unwrap();
        settle().await;

        universal.emit(ProviderEvent::ChainChanged("0x3039".to_string()));
        settle().await;
        let session = h.manager.session();
        assert_eq!(session.state, SessionState::NetworkInvalid);
        // The account survives a network mismatch.
        assert_eq!(session.account.as_deref(), Some("0xabc"));
        assert_eq!(session.chain_id, Some(12345));

        universal.emit(ProviderEvent::ChainChanged("0x89".to_string()));
        settle().await;
        let session = h.manager.session();
        assert_eq!(session.state, SessionState::Connected);
        assert_eq!(session.network_name, Some("Polygon"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_lookup() {
        let universal = MockProvider::new(ProviderKind::Universal, &["0xabc"], 1);
        // Lookup slow enough that disconnect lands while it is in flight.
        let gate = MockGate::new().slow(Duration::from_secs(10));
        let h = harness(None, Arc::clone(&universal), gate);

        h.manager.connect().await.unwrap();
        h.manager.disconnect().await;
        settle().await;

        let session = h.manager.session();
        assert_eq!(session.state, SessionState::Disconnected);
        assert_eq!(session.registration, RegistrationStatus::Unknown);
        assert!(h.storage.get(MANUAL_DISCONNECT_KEY).is_some());
        // Nothing from the cancelled lookup was cached.
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(h.scheduler.cache_len(), 0);
        assert_eq!(h.manager.session().registration, RegistrationStatus::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_sweeps_relay_keys() {
        let universal = MockProvider::new(ProviderKind::Universal, &["0xabc"], 1);
        let h = harness(None, universal, MockGate::new());

        h.manager.connect().await.unwrap();
        h.storage.set(RELAY_TOPIC_KEY, "topic-1");
        h.manager.disconnect().await;

        assert_eq!(h.storage.get(RELAY_TOPIC_KEY), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_connect_respects_manual_flag() {
        let universal = MockProvider::new(ProviderKind::Universal, &["0xabc"], 1);
        let h = harness(None, Arc::clone(&universal), MockGate::new());
        h.storage.set(MANUAL_DISCONNECT_KEY, "true");
        h.storage.set(RELAY_TOPIC_KEY, "topic-1");

        assert_eq!(h.manager.auto_connect().await, Ok(false));
        assert_eq!(h.manager.session().state, SessionState::Disconnected);
        assert_eq!(universal.connect_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_connect_prefers_authorized_injected() {
        let injected = MockProvider::new(ProviderKind::Injected, &["0xabc"], 1);
        *injected.authorized.lock() = vec!["0xabc".to_string()];
        let universal = MockProvider::new(ProviderKind::Universal, &["0xdef"], 1);
        let h = harness(Some(Arc::clone(&injected)), Arc::clone(&universal), MockGate::new());

        assert_eq!(h.manager.auto_connect().await, Ok(true));
        assert_eq!(h.manager.session().provider_kind, Some(ProviderKind::Injected));
        assert_eq!(universal.connect_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_connect_uses_relay_record() {
        let universal = MockProvider::new(ProviderKind::Universal, &["0xabc"], 1);
        let h = harness(None, Arc::clone(&universal), MockGate::new());
        h.storage.set(RELAY_TOPIC_KEY, "topic-1");

        assert_eq!(h.manager.auto_connect().await, Ok(true));
        assert_eq!(h.manager.session().provider_kind, Some(ProviderKind::Universal));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_connect_without_candidates_stays_disconnected() {
        let universal = MockProvider::new(ProviderKind::Universal, &["0xabc"], 1);
        let h = harness(None, Arc::clone(&universal), MockGate::new());

        assert_eq!(h.manager.auto_connect().await, Ok(false));
        assert_eq!(h.manager.session().state, SessionState::Disconnected);
        assert_eq!(universal.connect_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_wallet_lands_on_universal() {
        let injected = MockProvider::new(ProviderKind::Injected, &["0xabc"], 1);
        let universal = MockProvider::new(ProviderKind::Universal, &["0xdef"], 1);
        let h = harness(Some(Arc::clone(&injected)), Arc::clone(&universal), MockGate::new());

        h.manager.connect().await.unwrap();
        assert_eq!(h.manager.session().provider_kind, Some(ProviderKind::Injected));

        h.manager.switch_wallet(false).await.unwrap();
        let session = h.manager.session();
        assert_eq!(session.provider_kind, Some(ProviderKind::Universal));
        assert_eq!(session.account.as_deref(), Some("0xdef"));
        // Switching is silent: no manual-disconnect marker.
        assert!(h.storage.get(MANUAL_DISCONNECT_KEY).is_none());
        assert_eq!(injected.disconnect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_keeps_previous_variant() {
        let injected = MockProvider::new(ProviderKind::Injected, &["0xabc"], 1);
        let universal = MockProvider::new(ProviderKind::Universal, &["0xdef"], 1);
        let h = harness(Some(Arc::clone(&injected)), Arc::clone(&universal), MockGate::new());

        h.manager.connect().await.unwrap();
        h.manager.reconnect().await.unwrap();

        assert_eq!(h.manager.session().provider_kind, Some(ProviderKind::Injected));
        assert_eq!(injected.connect_calls.load(Ordering::SeqCst), 2);
        assert_eq!(universal.connect_calls.load(Ordering::SeqCst), 0);
        assert!(h.storage.get(MANUAL_DISCONNECT_KEY).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_from_replaced_provider_are_dropped() {
        let injected = MockProvider::new(ProviderKind::Injected, &["0xabc"], 1);
        let universal = MockProvider::new(ProviderKind::Universal, &["0xdef"], 1);
        let h = harness(Some(Arc::clone(&injected)), Arc::clone(&universal), MockGate::new());

        h.manager.connect().await.unwrap();
        h.manager.switch_wallet(false).await.unwrap();
        settle().await;

        // The old provider's registry has no live subscriptions left, so a
        // late event can never reach the session.
        injected.emit(ProviderEvent::AccountsChanged(Vec::new()));
        settle().await;

        let session = h.manager.session();
        assert_eq!(session.state, SessionState::Connected);
        assert_eq!(session.account.as_deref(), Some("0xdef"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_reported_disconnect_is_silent() {
        let universal = MockProvider::new(ProviderKind::Universal, &["0xabc"], 1);
        let h = harness(None, Arc::clone(&universal), MockGate::new());

        h.manager.connect().await.unwrap();
        settle().await;

        universal.emit(ProviderEvent::Disconnected("relay closed".to_string()));
        settle().await;

        assert_eq!(h.manager.session().state, SessionState::Disconnected);
        // Infrastructure failure keeps auto-connect eligible.
        assert!(h.storage.get(MANUAL_DISCONNECT_KEY).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_passthroughs_require_connection() {
        let universal = MockProvider::new(ProviderKind::Universal, &["0xabc"], 1);
        let h = harness(None, Arc::clone(&universal), MockGate::new());

        assert_eq!(h.manager.balance().await, Err(ProviderError::NotConnected));

        h.manager.connect().await.unwrap();
        assert_eq!(h.manager.balance().await, Ok(1_000_000_000_000_000_000));
        assert_eq!(
            h.manager.sign_message("hello").await,
            Ok("0xsigned:hello".to_string())
        );
        assert_eq!(
            h.manager.transfer_token("0xtoken", "0xdef", 5).await,
            Ok("0xtxhash".to_string())
        );
    }
}
