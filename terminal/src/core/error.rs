//! # Common Error Types
//!
//! Consolidated error handling for the client.
//!
//! Errors are categorized by their source:
//!
//! - **[`ConnectError`]**: wallet handshake failures, carrying a reason code
//!   the UI can act on (prompt again, fix configuration, retry)
//! - **[`RequestError`]**: scheduled backend request failures, including the
//!   cancellation and rate-limit cases the scheduler handles internally
//! - **[`ProviderError`]**: wallet provider calls after a connection exists
//!   (balance queries, signing, token transfers)
//!
//! A wrong network is deliberately NOT an error: it is the `NetworkInvalid`
//! session state, surfaced to the caller as data.

use thiserror::Error;

/// Wallet handshake failure, returned by `connect()` and `switch_wallet()`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    /// The user rejected the connection prompt in their wallet.
    #[error("connection rejected by user")]
    UserRejected,

    /// The provider cannot be used as configured (missing project id,
    /// unreachable bridge endpoint, malformed relay URL).
    #[error("wallet provider misconfigured: {0}")]
    Misconfigured(String),

    /// The relay handshake did not complete within its deadline.
    #[error("wallet handshake timed out")]
    Timeout,

    /// Anything else the provider reported during the handshake.
    #[error("wallet connection failed: {0}")]
    Unknown(String),
}

/// Failure of a request routed through the [`RequestScheduler`].
///
/// [`RequestScheduler`]: crate::scheduler::RequestScheduler
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    /// The request was superseded by a newer request under the same key, or
    /// swept by a bulk cancellation during session teardown.
    #[error("request cancelled")]
    Cancelled,

    /// The backend signalled rate-limiting pressure. The scheduler retries
    /// this once via backoff-then-cache-fallback before surfacing it.
    #[error("backend rate limited")]
    RateLimited,

    /// Any other backend failure, surfaced as-is.
    #[error("request failed: {0}")]
    Backend(String),
}

/// Wallet provider call failure after a connection is established.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// No wallet is connected.
    #[error("wallet not connected")]
    NotConnected,

    /// The wallet's RPC surface rejected or failed the call.
    #[error("provider RPC error: {0}")]
    Rpc(String),

    /// The relay transport failed (socket closed, send failure).
    #[error("relay transport error: {0}")]
    Relay(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            ConnectError::Timeout.to_string(),
            "wallet handshake timed out"
        );
        assert_eq!(RequestError::Cancelled.to_string(), "request cancelled");
        assert_eq!(
            ProviderError::Rpc("eth_getBalance failed".into()).to_string(),
            "provider RPC error: eth_getBalance failed"
        );
    }
}
