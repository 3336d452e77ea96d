//! Connector Manager - capability connectors and operation dispatch on top of tokenhub.
//!
//! Connectors wrap third-party APIs (file stores, chat, issue trackers) behind
//! three capability interfaces. Callers never handle tokens directly: the
//! dispatcher obtains a valid token from the lifecycle manager for every call.
//!
//! # Architecture
//!
//! ```text
//!   caller: invoke(account, provider, operation)
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │       OperationDispatcher                │
//! │  - Capability check                      │
//! │  - Valid token (single-flight refresh)   │
//! │  - Scope check, timeout, read retry      │
//! └─────────────────────────────────────────┘
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │       ConnectorRegistry                  │
//! │  - provider id → constructor             │
//! └─────────────────────────────────────────┘
//!          ↓
//!   Data / Communication / Project connector
//!          ↓
//!   Provider HTTP API
//! ```
//!
//! # Core Types
//!
//! - [`Connector`] - Base trait, exposes capability interfaces
//! - [`DataConnector`], [`CommunicationConnector`], [`ProjectConnector`]
//! - [`Operation`] - Capability-tagged request
//! - [`DispatchError`] - Normalized failure returned to callers
//! - [`ConnectorManager`] - Dispatcher plus background token sweep

mod connector;
mod types;
pub mod connectors;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod manager;
pub mod registry;

pub use connector::{CommunicationConnector, Connector, DataConnector, ProjectConnector};
pub use dispatcher::OperationDispatcher;
pub use error::{DispatchError, ProviderError};
pub use manager::ConnectorManager;
pub use registry::{ConnectorDescriptor, ConnectorRegistry};
pub use types::{
    Capability, CapabilitySet, Filter, Operation, OperationOutput, Page, Payload, ProjectSummary,
};
