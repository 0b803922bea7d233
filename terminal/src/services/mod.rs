//! # External Service Integrations
//!
//! - **[`api`]**: backend HTTP client (registration lookup)
//! - **[`storage`]**: persisted client flags

pub mod api;
pub mod storage;
