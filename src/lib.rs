//! OAuth token lifecycle management for multi-provider connectors.
//!
//! [`lifecycle::TokenLifecycleManager`] hands out access tokens that stay valid
//! for a safety margin, refreshing them at most once in flight per
//! (account, provider). [`credentials`] holds the versioned token records.

pub mod config;
pub mod credentials;
pub mod error;
pub mod lifecycle;
pub mod oauth;

pub use error::TokenError;
