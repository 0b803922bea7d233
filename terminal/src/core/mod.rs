//! # Core Types
//!
//! Error taxonomy and configuration shared by every subsystem.

pub mod config;
pub mod error;

pub use config::Config;
pub use error::{ConnectError, ProviderError, RequestError};
