//! # Registration Lookup Endpoint
//!
//! Identity check mapping a wallet address to an application user record.
//! A missing record is a normal outcome ("unregistered"), not an error; only
//! transport and server failures surface as [`RequestError`].

use async_trait::async_trait;
use reqwest::StatusCode;
use shared::RegistrationLookupResponse;

use super::client::ApiClient;
use crate::core::error::RequestError;
use crate::session::state::RegistrationStatus;

/// Identity lookup keyed by wallet address. Consumed through the request
/// scheduler; the trait exists so tests can inject a mock backend.
#[async_trait]
pub trait RegistrationGate: Send + Sync {
    async fn lookup(&self, address: &str) -> Result<RegistrationStatus, RequestError>;
}

#[async_trait]
impl RegistrationGate for ApiClient {
    async fn lookup(&self, address: &str) -> Result<RegistrationStatus, RequestError> {
        lookup_registration(self, address).await
    }
}

/// Look up the registration record for a wallet address.
#[tracing::instrument(skip(client), fields(address = %shared::truncate_address(address)))]
pub async fn lookup_registration(
    client: &ApiClient,
    address: &str,
) -> Result<RegistrationStatus, RequestError> {
    let url = format!(
        "{}/api/users/lookup?address={}",
        client.base_url(),
        address
    );

    let response = client.client.get(&url).send().await.map_err(|e| {
        tracing::error!(error = %e, "registration lookup network error");
        RequestError::Backend(format!("network error: {}", e))
    })?;

    match response.status() {
        StatusCode::NOT_FOUND => Ok(RegistrationStatus::Unregistered),
        StatusCode::TOO_MANY_REQUESTS => Err(RequestError::RateLimited),
        status if status.is_success() => {
            let body = response
                .json::<RegistrationLookupResponse>()
                .await
                .map_err(|e| RequestError::Backend(format!("failed to parse response: {}", e)))?;
            match body.user {
                Some(user) if body.success => Ok(RegistrationStatus::Registered {
                    username: user.username,
                }),
                _ => Ok(RegistrationStatus::Unregistered),
            }
        }
        status => Err(RequestError::Backend(format!(
            "registration lookup failed: {}",
            status
        ))),
    }
}
