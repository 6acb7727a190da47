//! Cloud Provider Connectors
//!
//! Trait-based abstractions the engine consumes. Concrete connectors bind
//! vendor SDKs and live outside this crate; the engine only depends on
//! these contracts.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::options::ProviderDiscoveryOptions;
use crate::types::{CloudProvider, DiscoveryError, Resource, Severity};

/// Resources returned by one connector call plus any non-fatal warnings
#[derive(Debug, Clone, Default)]
pub struct ProviderReport {
    pub resources: Vec<Resource>,
    /// Non-fatal notes, e.g. resource types that could not be listed.
    /// The engine records them with severity `warning` regardless of what is set here.
    pub warnings: Vec<DiscoveryError>,
}

impl ProviderReport {
    pub fn new(resources: Vec<Resource>) -> Self {
        Self {
            resources,
            warnings: Vec::new(),
        }
    }

    pub fn with_warning(mut self, warning: DiscoveryError) -> Self {
        self.warnings.push(warning);
        self
    }
}

/// Trait for per-cloud resource enumeration.
///
/// Every method receives the run's cancellation token and must return
/// promptly once it fires.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    /// Get the provider type
    fn provider(&self) -> CloudProvider;

    async fn connect(&self, ctx: &CancellationToken) -> Result<()>;

    async fn disconnect(&self, ctx: &CancellationToken) -> Result<()>;

    /// Called by the engine before the first discovery call of each run
    async fn validate_credentials(&self, ctx: &CancellationToken) -> Result<()>;

    /// Discover all resources matching the projected options
    async fn discover_resources(
        &self,
        ctx: &CancellationToken,
        options: &ProviderDiscoveryOptions,
    ) -> Result<Vec<Resource>>;

    async fn get_regions(&self, ctx: &CancellationToken) -> Result<Vec<String>>;

    async fn get_resource_types(&self, ctx: &CancellationToken) -> Result<Vec<String>>;

    async fn get_resources_by_type(
        &self,
        ctx: &CancellationToken,
        resource_type: &str,
        region: &str,
    ) -> Result<Vec<Resource>>;

    /// Discovery entry point used by the engine.
    ///
    /// Connectors that can partially succeed override this to attach
    /// warnings; the default reports none.
    async fn discover_report(
        &self,
        ctx: &CancellationToken,
        options: &ProviderDiscoveryOptions,
    ) -> Result<ProviderReport> {
        Ok(ProviderReport::new(self.discover_resources(ctx, options).await?))
    }
}

/// Structured connector failure.
///
/// Connectors may return this through `anyhow` to set the severity and
/// scope of the recorded `DiscoveryError`. A plain `anyhow` error is
/// recorded with severity `error` and no region or resource type.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConnectorError {
    pub severity: Severity,
    pub region: Option<String>,
    pub resource_type: Option<String>,
    pub message: String,
}

impl ConnectorError {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            region: None,
            resource_type: None,
            message: message.into(),
        }
    }

    /// Abort every sibling provider in the run
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(Severity::Fatal, message)
    }

    pub fn in_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn for_resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    /// Build the `DiscoveryError` recorded for `provider`
    pub fn into_discovery_error(self, provider: CloudProvider) -> DiscoveryError {
        DiscoveryError {
            provider,
            region: self.region,
            resource_type: self.resource_type,
            message: self.message,
            severity: self.severity,
            timestamp: Utc::now(),
        }
    }
}

/// Convert a connector failure into its recorded form
pub(crate) fn discovery_error_from(provider: CloudProvider, err: anyhow::Error) -> DiscoveryError {
    match err.downcast::<ConnectorError>() {
        Ok(structured) => structured.into_discovery_error(provider),
        Err(err) => DiscoveryError::error(provider, format!("{:#}", err)),
    }
}

/// Cloud credential material
#[derive(Debug, Clone)]
pub enum CredentialValue {
    Token(String),
    KeyPair {
        access_key_id: String,
        secret_access_key: String,
        session_token: Option<String>,
    },
}

/// Credentials handed to a connector, with optional expiry
#[derive(Debug, Clone)]
pub struct Credentials {
    pub provider: CloudProvider,
    pub value: CredentialValue,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn token(provider: CloudProvider, token: impl Into<String>) -> Self {
        Self {
            provider,
            value: CredentialValue::Token(token.into()),
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn access_token(&self) -> Option<&str> {
        match &self.value {
            CredentialValue::Token(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }

    pub fn time_until_expiry(&self) -> Option<std::time::Duration> {
        self.expires_at
            .map(|at| (at - Utc::now()).to_std().unwrap_or_default())
    }
}

/// Source of credentials consulted by connectors, never by the engine
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_credentials(&self, provider: CloudProvider) -> Result<Credentials>;

    async fn validate_credentials(&self, provider: CloudProvider) -> Result<()>;

    async fn refresh_credentials(&self, provider: CloudProvider) -> Result<Credentials>;
}
