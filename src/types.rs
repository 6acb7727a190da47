//! Discovery Types
//!
//! Core types for representing discovered cloud resources, per-provider
//! failures and the aggregated result of a discovery run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::EngineError;
use crate::filter::ResourceFilter;

/// Cloud provider identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Aws,
    Azure,
    Gcp,
    Vmware,
    Kvm,
    Openstack,
}

impl CloudProvider {
    /// Every known provider, in canonical order
    pub const ALL: [CloudProvider; 6] = [
        CloudProvider::Aws,
        CloudProvider::Azure,
        CloudProvider::Gcp,
        CloudProvider::Vmware,
        CloudProvider::Kvm,
        CloudProvider::Openstack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CloudProvider::Aws => "aws",
            CloudProvider::Azure => "azure",
            CloudProvider::Gcp => "gcp",
            CloudProvider::Vmware => "vmware",
            CloudProvider::Kvm => "kvm",
            CloudProvider::Openstack => "openstack",
        }
    }
}

impl std::fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CloudProvider {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        CloudProvider::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| EngineError::UnsupportedProvider(s.to_string()))
    }
}

/// Open-ended value carried in resource metadata and filter operands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<String>),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::String(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Number(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Number(value as f64)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

impl From<Vec<String>> for MetadataValue {
    fn from(value: Vec<String>) -> Self {
        MetadataValue::List(value)
    }
}

/// A normalized infrastructure resource reported by a connector.
///
/// Identity is the pair `(provider, id)`; `id` is only unique within a
/// provider. The engine never mutates a resource once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub provider: CloudProvider,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, MetadataValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

impl Resource {
    pub fn new(
        provider: CloudProvider,
        id: impl Into<String>,
        name: impl Into<String>,
        resource_type: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            resource_type: resource_type.into(),
            provider,
            region: region.into(),
            zone: None,
            status: None,
            metadata: BTreeMap::new(),
            tags: BTreeMap::new(),
            created_at: None,
            updated_at: None,
            dependencies: Vec::new(),
        }
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }

    /// Record a dependency on another resource by id
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    /// Identity key of the resource across providers
    pub fn key(&self) -> (CloudProvider, &str) {
        (self.provider, &self.id)
    }
}

/// Severity of a discovery error
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Fatal => write!(f, "fatal"),
        }
    }
}

/// A provider-scoped failure recorded in the result instead of aborting the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryError {
    pub provider: CloudProvider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

impl DiscoveryError {
    pub fn new(provider: CloudProvider, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            provider,
            region: None,
            resource_type: None,
            message: message.into(),
            severity,
            timestamp: Utc::now(),
        }
    }

    pub fn warning(provider: CloudProvider, message: impl Into<String>) -> Self {
        Self::new(provider, Severity::Warning, message)
    }

    pub fn error(provider: CloudProvider, message: impl Into<String>) -> Self {
        Self::new(provider, Severity::Error, message)
    }

    pub fn fatal(provider: CloudProvider, message: impl Into<String>) -> Self {
        Self::new(provider, Severity::Fatal, message)
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    pub fn is_warning(&self) -> bool {
        self.severity == Severity::Warning
    }
}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.severity, self.provider)?;
        if let Some(region) = &self.region {
            write!(f, "/{}", region)?;
        }
        if let Some(resource_type) = &self.resource_type {
            write!(f, " ({})", resource_type)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Summary derived from the final resource and error lists of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryMetadata {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Wall-clock span of the fan-out, serialized as milliseconds
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub resource_count: usize,
    pub provider_stats: BTreeMap<CloudProvider, usize>,
    pub error_count: usize,
    pub warning_count: usize,
    /// Rules applied to the run, including the implicit `tags.<key>` includes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<ResourceFilter>,
}

impl DiscoveryMetadata {
    pub fn compute(
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        resources: &[Resource],
        errors: &[DiscoveryError],
        filters: &[ResourceFilter],
    ) -> Self {
        let mut provider_stats = BTreeMap::new();
        for resource in resources {
            *provider_stats.entry(resource.provider).or_insert(0) += 1;
        }

        let warning_count = errors.iter().filter(|e| e.is_warning()).count();

        // Truncated to the wire precision so a JSON round trip is lossless
        let millis = (end_time - start_time).num_milliseconds().max(0) as u64;

        Self {
            start_time,
            end_time,
            duration: Duration::from_millis(millis),
            resource_count: resources.len(),
            provider_stats,
            error_count: errors.len() - warning_count,
            warning_count,
            filters: filters.to_vec(),
        }
    }
}

/// The sole return value of a discovery run; cached as a whole
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub resources: Vec<Resource>,
    pub errors: Vec<DiscoveryError>,
    pub metadata: DiscoveryMetadata,
}

impl DiscoveryResult {
    pub fn resources_for(&self, provider: CloudProvider) -> impl Iterator<Item = &Resource> {
        self.resources.iter().filter(move |r| r.provider == provider)
    }

    pub fn find(&self, provider: CloudProvider, id: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.key() == (provider, id))
    }

    /// True if any error or fatal entry was recorded; warnings don't count
    pub fn has_errors(&self) -> bool {
        self.metadata.error_count > 0
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
