//! # Shared Data Transfer Objects Library
//!
//! This library defines the JSON contract between the client and the backend
//! API. All DTOs use `serde` for serialization.
//!
//! ## Structure
//!
//! - **[`dto`]**: Data Transfer Objects for API communication
//!   - **[`dto::registration`]**: Wallet registration lookup DTOs
//! - **[`utils`]**: Shared utility functions
//!   - **[`utils::format_address`]**: Format wallet addresses for display
//!   - **[`utils::truncate_address`]**: Truncate addresses with ellipsis
//!
//! ## Wire Format
//!
//! All DTOs serialize to JSON using the default `serde` behavior: snake_case
//! field names, optional fields skipped when `None`, and both `Serialize` and
//! `Deserialize` derived for bidirectional use.

pub mod dto;
pub mod utils;

// Re-export commonly used types at crate root for convenience
pub use dto::registration::{RegisteredUser, RegistrationLookupResponse};
pub use dto::ErrorResponse;
pub use utils::{format_address, truncate_address};
