//! # Data Transfer Objects
//!
//! JSON types exchanged with the backend API.

pub mod registration;

use serde::{Deserialize, Serialize};

/// Error response envelope returned by the backend on failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
}
