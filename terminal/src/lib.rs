//! # Vaultline Terminal - Library Root
//!
//! Client runtime for the Vaultline deposit and earnings dashboard. This
//! library crate contains all modules used by the binary crate (`main.rs`).
//!
//! ## Features
//!
//! - **Wallet Sessions**: Connect, disconnect, switch and reconnect across
//!   injected and relay-paired wallets
//! - **Request Coordination**: Priority scheduling, rate limiting, response
//!   caching and cancellation for backend traffic
//! - **Registration Lookup**: Resolves the connected address to a Vaultline
//!   user through the backend API
//! - **Network Validation**: Connected chain checked against the supported
//!   network allow-list
//!
//! ## Module Structure
//!
//! - **core**: Configuration and the error taxonomy
//! - **scheduler**: The prioritized request scheduler
//! - **provider**: The [`provider::WalletProvider`] trait and its injected
//!   and universal implementations
//! - **session**: The [`session::SessionManager`] state machine
//! - **services**: Backend HTTP client and persistent client storage
//! - **network**: Supported network allow-list
//!
//! ## Architecture
//!
//! ```text
//! SessionManager ──owns──▶ WalletProvider (injected | universal)
//!       │                        │
//!       │ enqueue                │ events (accounts / chain / disconnect)
//!       ▼                        ▼
//! RequestScheduler ──────▶ event pump ──▶ session state
//!       │
//!       ▼ HTTP
//! Backend API (registration lookup)
//! ```

pub mod core;
pub mod logging;
pub mod network;
pub mod provider;
pub mod scheduler;
pub mod services;
pub mod session;
