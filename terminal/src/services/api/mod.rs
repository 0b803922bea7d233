//! # Backend API Services
//!
//! HTTP endpoints consumed by the client. Everything here is called through
//! the request scheduler, never directly from session code.

pub mod client;
pub mod registration;

pub use client::ApiClient;
pub use registration::RegistrationGate;
