//! # Universal Provider
//!
//! Relay-paired wallet connectivity for remote and mobile wallets. The
//! handshake identifies the application to the relay, receives a pairing URI
//! (rendered by the UI as a QR code or deep link), and waits for the user to
//! approve the session from their wallet, under a deadline.
//!
//! After approval, a read task owns the socket: it answers pings, resolves
//! request/response round-trips by correlation id, and forwards wallet events
//! into the subscription registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::{
    EventRegistry, Handshake, ProviderEvent, ProviderEventKind, ProviderKind, Subscription,
    WalletProvider,
};
use crate::core::error::{ConnectError, ProviderError};
use crate::services::storage::{ClientStorage, RELAY_TOPIC_KEY};
use crate::network;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

const APP_NAME: &str = "Vaultline Terminal";

/// Messages exchanged with the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RelayMessage {
    /// Client -> relay: open a pairable session.
    PairingRequest {
        project_id: String,
        topic: String,
        app_name: String,
    },
    /// Relay -> client: pairing URI for QR/deep-link display.
    PairingCreated { uri: String },
    /// Relay -> client: the user approved the session from their wallet.
    SessionApproved {
        topic: String,
        accounts: Vec<String>,
        chain_id: String,
    },
    /// Relay -> client: the user declined the pairing.
    SessionRejected {
        #[serde(default)]
        reason: Option<String>,
    },
    /// Client -> relay: wallet RPC call routed through the session.
    SessionRequest {
        id: u64,
        method: String,
        params: Value,
    },
    /// Relay -> client: response to a [`RelayMessage::SessionRequest`].
    SessionResponse {
        id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    /// Relay -> client: wallet-side account switch.
    AccountsChanged { accounts: Vec<String> },
    /// Relay -> client: wallet-side network switch (hex chain id).
    ChainChanged { chain_id: String },
    /// Either direction: the session is over.
    SessionDisconnected {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Live relay session owned by a connected provider.
struct RelayLink {
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    pending: PendingMap,
    next_id: AtomicU64,
    read_task: JoinHandle<()>,
    topic: String,
}

pub struct UniversalProvider {
    relay_url: String,
    project_id: String,
    handshake_timeout: Duration,
    registry: Arc<EventRegistry>,
    storage: Arc<dyn ClientStorage>,
    pairing_uri: Mutex<Option<String>>,
    link: Mutex<Option<RelayLink>>,
}

impl UniversalProvider {
    pub fn new(
        relay_url: String,
        project_id: String,
        handshake_timeout: Duration,
        storage: Arc<dyn ClientStorage>,
    ) -> Self {
        Self {
            relay_url,
            project_id,
            handshake_timeout,
            registry: Arc::new(EventRegistry::new()),
            storage,
            pairing_uri: Mutex::new(None),
            link: Mutex::new(None),
        }
    }

    /// Pairing URI received during the handshake, for QR/deep-link display.
    /// Populated while `connect()` is still pending; poll from another task.
    pub fn pairing_uri(&self) -> Option<String> {
        self.pairing_uri.lock().clone()
    }

    /// Whether a previous relay session record exists in client storage.
    /// Startup auto-connect uses this to decide the universal variant is
    /// worth attempting.
    pub fn has_session_record(storage: &dyn ClientStorage) -> bool {
        storage.get(RELAY_TOPIC_KEY).is_some()
    }

    /// Run a wallet RPC call through the relay session.
    async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        let (id, sink, pending) = {
            let link = self.link.lock();
            let link = link.as_ref().ok_or(ProviderError::NotConnected)?;
            (
                link.next_id.fetch_add(1, Ordering::Relaxed),
                Arc::clone(&link.sink),
                Arc::clone(&link.pending),
            )
        };

        let (tx, rx) = oneshot::channel();
        pending.lock().insert(id, tx);

        let message = RelayMessage::SessionRequest {
            id,
            method: method.to_string(),
            params,
        };
        let send_result = send_message(&sink, &message).await;
        if let Err(e) = send_result {
            pending.lock().remove(&id);
            return Err(ProviderError::Relay(e));
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(ProviderError::Rpc(message)),
            Err(_) => Err(ProviderError::Relay("relay session closed".to_string())),
        }
    }
}

#[async_trait]
impl WalletProvider for UniversalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Universal
    }

    async fn connect(&self) -> Result<Handshake, ConnectError> {
        if self.project_id.is_empty() {
            return Err(ConnectError::Misconfigured(
                "RELAY_PROJECT_ID is not set".to_string(),
            ));
        }

        info!(url = %self.relay_url, "connecting to relay");
        let (ws_stream, _response) = connect_async(&self.relay_url)
            .await
            .map_err(|e| ConnectError::Misconfigured(format!("relay unreachable: {}", e)))?;
        let (mut sink, mut stream) = ws_stream.split();

        let topic = uuid::Uuid::new_v4().to_string();
        let request = RelayMessage::PairingRequest {
            project_id: self.project_id.clone(),
            topic: topic.clone(),
            app_name: APP_NAME.to_string(),
        };
        let payload = serde_json::to_string(&request)
            .map_err(|e| ConnectError::Unknown(format!("encode pairing request: {}", e)))?;
        sink.send(Message::Text(payload))
            .await
            .map_err(|e| ConnectError::Unknown(format!("relay send failed: {}", e)))?;

        // Drive the handshake to approval or rejection under the deadline.
        let approved = tokio::time::timeout(
            self.handshake_timeout,
            self.await_approval(&mut stream),
        )
        .await
        .map_err(|_| ConnectError::Timeout)??;

        let chain_id = network::parse_chain_id_hex(&approved.chain_id)
            .ok_or_else(|| ConnectError::Unknown(format!("bad chain id {}", approved.chain_id)))?;

        info!(
            topic = %approved.topic,
            account = %shared::truncate_address(
                approved.accounts.first().map(String::as_str).unwrap_or("")
            ),
            chain_id,
            "relay session approved"
        );
        self.storage.set(RELAY_TOPIC_KEY, &approved.topic);

        let sink = Arc::new(tokio::sync::Mutex::new(sink));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let read_task = tokio::spawn(read_relay(
            stream,
            Arc::clone(&sink),
            Arc::clone(&pending),
            Arc::clone(&self.registry),
        ));

        let mut link = self.link.lock();
        if let Some(old) = link.take() {
            old.read_task.abort();
        }
        *link = Some(RelayLink {
            sink,
            pending,
            next_id: AtomicU64::new(1),
            read_task,
            topic: approved.topic,
        });

        Ok(Handshake {
            accounts: approved.accounts,
            chain_id,
        })
    }

    async fn authorized_accounts(&self) -> Result<Vec<String>, ProviderError> {
        if self.link.lock().is_none() {
            // No live session means nothing is authorized without a pairing.
            return Ok(Vec::new());
        }
        let result = self.request("eth_accounts", json!([])).await?;
        Ok(result
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn chain_id(&self) -> Result<u64, ProviderError> {
        let result = self.request("eth_chainId", json!([])).await?;
        result
            .as_str()
            .and_then(network::parse_chain_id_hex)
            .ok_or_else(|| ProviderError::Rpc("malformed chain id".to_string()))
    }

    async fn get_balance(&self, address: &str) -> Result<u128, ProviderError> {
        let result = self
            .request("eth_getBalance", json!([address, "latest"]))
            .await?;
        result
            .as_str()
            .and_then(|s| u128::from_str_radix(s.strip_prefix("0x")?, 16).ok())
            .ok_or_else(|| ProviderError::Rpc("malformed balance".to_string()))
    }

    async fn sign_message(&self, address: &str, message: &str) -> Result<String, ProviderError> {
        let result = self
            .request("personal_sign", json!([message, address]))
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Rpc("malformed signature".to_string()))
    }

    async fn transfer_token(
        &self,
        token: &str,
        from: &str,
        to: &str,
        amount: u128,
    ) -> Result<String, ProviderError> {
        let params = json!([{
            "token": token,
            "from": from,
            "to": to,
            "amount": format!("0x{:x}", amount),
        }]);
        let result = self.request("wallet_transferToken", params).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Rpc("malformed transaction hash".to_string()))
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
        let link = self.link.lock().take();
        let Some(link) = link else {
            return Ok(());
        };

        debug!(topic = %link.topic, "closing relay session");
        let goodbye = RelayMessage::SessionDisconnected {
            reason: Some("client disconnect".to_string()),
        };
        if let Err(e) = send_message(&link.sink, &goodbye).await {
            warn!(error = %e, "failed to send relay goodbye");
        }
        link.read_task.abort();

        // Settle any RPC still waiting on the dead session.
        for (_, tx) in link.pending.lock().drain() {
            let _ = tx.send(Err("relay session closed".to_string()));
        }
        Ok(())
    }
}

struct Approved {
    topic: String,
    accounts: Vec<String>,
    chain_id: String,
}

impl UniversalProvider {
    async fn await_approval(
        &self,
        stream: &mut SplitStream<WsStream>,
    ) -> Result<Approved, ConnectError> {
        while let Some(message) = stream.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => {
                    return Err(ConnectError::Unknown("relay closed the socket".to_string()))
                }
                Ok(_) => continue,
                Err(e) => return Err(ConnectError::Unknown(format!("relay read error: {}", e))),
            };

            match serde_json::from_str::<RelayMessage>(&text) {
                Ok(RelayMessage::PairingCreated { uri }) => {
                    debug!("pairing URI received");
                    *self.pairing_uri.lock() = Some(uri);
                }
                Ok(RelayMessage::SessionApproved {
                    topic,
                    accounts,
                    chain_id,
                }) => {
                    return Ok(Approved {
                        topic,
                        accounts,
                        chain_id,
                    })
                }
                Ok(RelayMessage::SessionRejected { reason }) => {
                    debug!(reason = ?reason, "pairing rejected");
                    return Err(ConnectError::UserRejected);
                }
                Ok(other) => {
                    warn!(message = ?other, "unexpected relay message during handshake");
                }
                Err(e) => {
                    warn!(error = %e, "unparseable relay message during handshake");
                }
            }
        }
        Err(ConnectError::Unknown("relay stream ended".to_string()))
    }
}

async fn send_message(
    sink: &tokio::sync::Mutex<WsSink>,
    message: &RelayMessage,
) -> Result<(), String> {
    let payload = serde_json::to_string(message).map_err(|e| e.to_string())?;
    sink.lock()
        .await
        .send(Message::Text(payload))
        .await
        .map_err(|e| e.to_string())
}

/// Socket owner after the handshake: answers pings, resolves responses,
/// forwards wallet events, and reports a provider-side disconnect when the
/// stream ends.
async fn read_relay(
    mut stream: SplitStream<WsStream>,
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    pending: PendingMap,
    registry: Arc<EventRegistry>,
) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<RelayMessage>(&text) {
                Ok(RelayMessage::SessionResponse { id, result, error }) => {
                    if let Some(tx) = pending.lock().remove(&id) {
                        let outcome = match (result, error) {
                            (_, Some(message)) => Err(message),
                            (Some(value), None) => Ok(value),
                            (None, None) => Ok(Value::Null),
                        };
                        let _ = tx.send(outcome);
                    }
                }
                Ok(RelayMessage::AccountsChanged { accounts }) => {
                    registry.emit(ProviderEvent::AccountsChanged(accounts));
                }
                Ok(RelayMessage::ChainChanged { chain_id }) => {
                    registry.emit(ProviderEvent::ChainChanged(chain_id));
                }
                Ok(RelayMessage::SessionDisconnected { reason }) => {
                    let reason = reason.unwrap_or_else(|| "wallet disconnected".to_string());
                    info!(reason = %reason, "relay session ended by wallet");
                    registry.emit(ProviderEvent::Disconnected(reason));
                    break;
                }
                Ok(other) => {
                    debug!(message = ?other, "ignoring relay message");
                }
                Err(e) => {
                    warn!(error = %e, "unparseable relay message");
                }
            },
            Ok(Message::Ping(data)) => {
                if let Err(e) = sink.lock().await.send(Message::Pong(data)).await {
                    error!(error = %e, "failed to send pong");
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                info!(frame = ?frame, "relay closed the connection");
                registry.emit(ProviderEvent::Disconnected("relay closed".to_string()));
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "relay read error");
                registry.emit(ProviderEvent::Disconnected(format!("relay error: {}", e)));
                break;
            }
        }
    }

    // Settle callers still waiting on a response.
    for (_, tx) in pending.lock().drain() {
        let _ = tx.send(Err("relay session closed".to_string()));
    }
}
