//! Engine errors
//!
//! Only configuration-class errors escape a discovery run in the common
//! case. Provider failures are recorded in the result's `errors` list.
//! Cancellation and fatal provider errors are the two cases that return
//! an error while still carrying usable partial data.

use thiserror::Error;

use crate::types::{CloudProvider, DiscoveryResult};

/// Errors returned by [`crate::DiscoveryEngine`] operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// No providers were requested
    #[error("at least one provider must be requested")]
    NoProviders,

    /// Provider name is not one of the known clouds
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),

    /// Provider is known but has no registered connector
    #[error("no connector registered for provider {0}")]
    ConnectorNotRegistered(CloudProvider),

    /// A filter rule failed validation
    #[error("invalid filter at index {index}: {reason}")]
    InvalidFilter { index: usize, reason: String },

    /// Request options are out of range
    #[error("invalid discovery options: {0}")]
    InvalidOptions(String),

    /// The caller cancelled the run; completed work is kept
    #[error("discovery cancelled")]
    Cancelled { partial: Box<DiscoveryResult> },

    /// A connector reported a fatal error and sibling calls were aborted
    #[error("fatal error from {provider}: {message}")]
    FatalProviderError {
        provider: CloudProvider,
        message: String,
        partial: Box<DiscoveryResult>,
    },

    /// A direct connector call failed
    #[error("{provider} connector failed: {source:#}")]
    Connector {
        provider: CloudProvider,
        #[source]
        source: anyhow::Error,
    },
}

impl EngineError {
    /// True for errors raised before any connector is called
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EngineError::NoProviders
                | EngineError::UnsupportedProvider(_)
                | EngineError::ConnectorNotRegistered(_)
                | EngineError::InvalidFilter { .. }
                | EngineError::InvalidOptions(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled { .. })
    }

    /// Partial result assembled before the run was interrupted
    pub fn partial_result(&self) -> Option<&DiscoveryResult> {
        match self {
            EngineError::Cancelled { partial } => Some(partial),
            EngineError::FatalProviderError { partial, .. } => Some(partial),
            _ => None,
        }
    }

    pub fn into_partial_result(self) -> Option<DiscoveryResult> {
        match self {
            EngineError::Cancelled { partial } => Some(*partial),
            EngineError::FatalProviderError { partial, .. } => Some(*partial),
            _ => None,
        }
    }
}
