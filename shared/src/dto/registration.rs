//! # Registration Lookup DTOs
//!
//! Identity check mapping a wallet address to an application user record.

use serde::{Deserialize, Serialize};

/// Registration lookup response (`GET /api/users/lookup?address=...`).
///
/// A missing user record is reported with `success: false` (or an HTTP 404),
/// which the client treats as "unregistered", not as an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrationLookupResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<RegisteredUser>,
}

/// Registered user record (public, safe to send to the client).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisteredUser {
    pub username: String,
}
