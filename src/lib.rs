//! Multi-Cloud Discovery Engine
//!
//! Concurrent resource discovery across cloud and virtualization providers,
//! with declarative filtering, result caching and lifecycle events.

pub mod cache;
pub mod config;
pub mod connector;
pub mod engine;
pub mod error;
pub mod events;
pub mod filter;
pub mod options;
pub mod telemetry;
pub mod types;

pub use cache::{Cache, MemoryCache};
pub use config::EngineConfig;
pub use connector::{
    ConnectorError, CredentialProvider, CredentialValue, Credentials, ProviderConnector,
    ProviderReport,
};
pub use engine::DiscoveryEngine;
pub use error::EngineError;
pub use events::{EventBus, EventHandler, TracingEventHandler};
pub use filter::{FilterOperator, FilterSet, FilterType, ResourceFilter};
pub use options::{DiscoveryOptions, ProviderDiscoveryOptions};
pub use telemetry::{init_tracing, LogFormat};
pub use types::{
    CloudProvider, DiscoveryError, DiscoveryMetadata, DiscoveryResult, MetadataValue, Resource,
    Severity,
};

/// Re-exported so connector implementations share the engine's token type
pub use tokio_util::sync::CancellationToken;
