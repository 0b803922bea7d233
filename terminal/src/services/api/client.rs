//! # API Client
//!
//! Main HTTP client for backend API communication.

use std::time::Duration;

use reqwest::Client;

/// HTTP client for communicating with the backend API server.
///
/// Holds a connection pool; construct once and share via `Arc`.
pub struct ApiClient {
    pub(crate) client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new API client with default configuration.
    ///
    /// The client is configured with a 10 second timeout so a stalled backend
    /// cannot hang a scheduled request indefinitely.
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }
}
