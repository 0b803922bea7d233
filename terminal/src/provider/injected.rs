//! # Injected Provider
//!
//! Wallet exposed directly by the host environment through a local JSON-RPC
//! bridge. Detection is synchronous (the bridge endpoint is either configured
//! or it is not) and connecting is a single account request.
//!
//! The bridge has no push channel, so after a successful connect a watcher
//! task polls accounts and chain id and emits change events through the
//! shared registry. A bridge that stops answering is reported as a
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    EventRegistry, Handshake, ProviderEvent, ProviderEventKind, ProviderKind, Subscription,
    WalletProvider,
};
use crate::core::error::{ConnectError, ProviderError};
use crate::core::Config;
use crate::network;

/// How often the watcher polls the bridge for account/chain changes.
const POLL_INTERVAL: Duration = Duration::from_secs(4);
/// Consecutive poll failures tolerated before reporting a disconnect.
const MAX_POLL_FAILURES: u32 = 3;

/// ERC-20 `transfer(address,uint256)` selector.
const TRANSFER_SELECTOR: &str = "a9059cbb";

pub struct InjectedProvider {
    client: reqwest::Client,
    rpc_url: String,
    registry: Arc<EventRegistry>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl InjectedProvider {
    /// Synchronous detection: present only when the host configured a bridge
    /// endpoint.
    pub fn detect(config: &Config) -> Option<Self> {
        let rpc_url = config.injected_rpc_url.clone()?;
        debug!(url = %rpc_url, "injected wallet bridge detected");
        Some(Self::new(rpc_url))
    }

    pub fn new(rpc_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            rpc_url,
            registry: Arc::new(EventRegistry::new()),
            watcher: Mutex::new(None),
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        rpc_call(&self.client, &self.rpc_url, method, params)
            .await
            .map_err(|e| match e {
                RpcFailure::Transport(msg) => ProviderError::Rpc(msg),
                RpcFailure::Wallet { message, .. } => ProviderError::Rpc(message),
            })
    }

    fn start_watcher(&self, accounts: Vec<String>, chain_hex: String) {
        let mut watcher = self.watcher.lock();
        if let Some(handle) = watcher.take() {
            handle.abort();
        }
        let client = self.client.clone();
        let url = self.rpc_url.clone();
        let registry = Arc::clone(&self.registry);
        *watcher = Some(tokio::spawn(watch_bridge(
            client, url, registry, accounts, chain_hex,
        )));
    }
}

#[async_trait]
impl WalletProvider for InjectedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Injected
    }

    async fn connect(&self) -> Result<Handshake, ConnectError> {
        let accounts = rpc_call(&self.client, &self.rpc_url, "eth_requestAccounts", json!([]))
            .await
            .map_err(connect_error)
            .and_then(parse_accounts)?;

        let chain_hex = rpc_call(&self.client, &self.rpc_url, "eth_chainId", json!([]))
            .await
            .map_err(connect_error)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ConnectError::Unknown("malformed chain id".to_string()))?;

        let chain_id = network::parse_chain_id_hex(&chain_hex)
            .ok_or_else(|| ConnectError::Unknown(format!("bad chain id {}", chain_hex)))?;

        info!(
            account = %shared::truncate_address(accounts.first().map(String::as_str).unwrap_or("")),
            chain_id,
            "injected wallet connected"
        );
        self.start_watcher(accounts.clone(), chain_hex);

        Ok(Handshake { accounts, chain_id })
    }

    async fn authorized_accounts(&self) -> Result<Vec<String>, ProviderError> {
        let result = self.rpc("eth_accounts", json!([])).await?;
        parse_accounts(result).map_err(|e| ProviderError::Rpc(e.to_string()))
    }

    async fn chain_id(&self) -> Result<u64, ProviderError> {
        let result = self.rpc("eth_chainId", json!([])).await?;
        result
            .as_str()
            .and_then(network::parse_chain_id_hex)
            .ok_or_else(|| ProviderError::Rpc("malformed chain id".to_string()))
    }

    async fn get_balance(&self, address: &str) -> Result<u128, ProviderError> {
        let result = self.rpc("eth_getBalance", json!([address, "latest"])).await?;
        result
            .as_str()
            .and_then(parse_hex_u128)
            .ok_or_else(|| ProviderError::Rpc("malformed balance".to_string()))
    }

    async fn sign_message(&self, address: &str, message: &str) -> Result<String, ProviderError> {
        let data = hex_encode(message.as_bytes());
        let result = self.rpc("personal_sign", json!([data, address])).await?;
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
        let data = encode_transfer_call(to, amount)
            .ok_or_else(|| ProviderError::Rpc(format!("invalid recipient address {}", to)))?;
        let tx = json!([{ "from": from, "to": token, "data": data }]);
        let result = self.rpc("eth_sendTransaction", tx).await?;
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
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
        // The host wallet stays available; there is nothing to tear down on
        // the bridge side.
        Ok(())
    }
}

/// Poll the bridge for account and chain changes and forward them as events.
async fn watch_bridge(
    client: reqwest::Client,
    url: String,
    registry: Arc<EventRegistry>,
    mut last_accounts: Vec<String>,
    mut last_chain_hex: String,
) {
    let mut failures = 0u32;
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;

        let accounts = rpc_call(&client, &url, "eth_accounts", json!([]))
            .await
            .map_err(|e| e.to_string())
            .and_then(|v| parse_accounts(v).map_err(|e| e.to_string()));
        let chain = rpc_call(&client, &url, "eth_chainId", json!([]))
            .await
            .map_err(|e| e.to_string())
            .map(|v| v.as_str().unwrap_or_default().to_string());

        match (accounts, chain) {
            (Ok(accounts), Ok(chain_hex)) => {
                failures = 0;
                if accounts != last_accounts {
                    debug!(count = accounts.len(), "bridge account list changed");
                    registry.emit(ProviderEvent::AccountsChanged(accounts.clone()));
                    last_accounts = accounts;
                }
                if !chain_hex.is_empty() && chain_hex != last_chain_hex {
                    debug!(chain = %chain_hex, "bridge chain changed");
                    registry.emit(ProviderEvent::ChainChanged(chain_hex.clone()));
                    last_chain_hex = chain_hex;
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                failures += 1;
                warn!(error = %e, failures, "bridge poll failed");
                if failures >= MAX_POLL_FAILURES {
                    registry.emit(ProviderEvent::Disconnected(
                        "wallet bridge unreachable".to_string(),
                    ));
                    return;
                }
            }
        }
    }
}

/// JSON-RPC failure, before mapping to the caller-facing error type.
#[derive(Debug)]
enum RpcFailure {
    Transport(String),
    Wallet { code: i64, message: String },
}

impl std::fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcFailure::Transport(msg) => write!(f, "transport error: {}", msg),
            RpcFailure::Wallet { code, message } => write!(f, "wallet error {}: {}", code, message),
        }
    }
}

async fn rpc_call(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Value,
) -> Result<Value, RpcFailure> {
    let body = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    });

    let response = client
        .post(url)
        .json(&body)
        .send()
        .await
        .map_err(|e| RpcFailure::Transport(format!("{}", e)))?;

    let payload: Value = response
        .json()
        .await
        .map_err(|e| RpcFailure::Transport(format!("bad response: {}", e)))?;

    if let Some(error) = payload.get("error") {
        return Err(RpcFailure::Wallet {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown wallet error")
                .to_string(),
        });
    }

    payload
        .get("result")
        .cloned()
        .ok_or_else(|| RpcFailure::Transport("response missing result".to_string()))
}

/// EIP-1193 code 4001 is the user declining the prompt.
fn connect_error(failure: RpcFailure) -> ConnectError {
    match failure {
        RpcFailure::Wallet { code: 4001, .. } => ConnectError::UserRejected,
        RpcFailure::Wallet { message, .. } => ConnectError::Unknown(message),
        RpcFailure::Transport(msg) => ConnectError::Misconfigured(msg),
    }
}

fn parse_accounts(value: Value) -> Result<Vec<String>, ConnectError> {
    value
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .ok_or_else(|| ConnectError::Unknown("malformed account list".to_string()))
}

fn parse_hex_u128(value: &str) -> Option<u128> {
    u128::from_str_radix(value.strip_prefix("0x")?, 16).ok()
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// ABI-encode `transfer(address,uint256)` calldata.
fn encode_transfer_call(to: &str, amount: u128) -> Option<String> {
    let addr = to.strip_prefix("0x")?;
    if addr.len() != 40 || !addr.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!(
        "0x{}{:0>64}{:064x}",
        TRANSFER_SELECTOR,
        addr.to_ascii_lowercase(),
        amount
    ))
}
