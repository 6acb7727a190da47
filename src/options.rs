//! Discovery request options
//!
//! `DiscoveryOptions` is immutable for the duration of one run. Each
//! connector only sees its own `ProviderDiscoveryOptions` projection.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::error::EngineError;
use crate::filter::{FilterOperator, FilterSet, ResourceFilter};
use crate::types::CloudProvider;

/// Default number of concurrently active connector calls
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Default wall-clock budget for one connector call
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default lifetime of a cached result
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(900);

const FINGERPRINT_PREFIX: &str = "discovery:";

/// Request-scoped discovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryOptions {
    pub providers: BTreeSet<CloudProvider>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_types: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<ResourceFilter>,
    pub include_managed: bool,
    pub include_defaults: bool,
    pub max_concurrency: usize,
    #[serde(with = "secs")]
    pub timeout: Duration,
    pub use_cache: bool,
    #[serde(rename = "cacheTTL", with = "secs")]
    pub cache_ttl: Duration,
}

impl DiscoveryOptions {
    /// Create options for the given providers with default limits
    pub fn new(providers: impl IntoIterator<Item = CloudProvider>) -> Self {
        Self {
            providers: providers.into_iter().collect(),
            regions: Vec::new(),
            resource_types: Vec::new(),
            tags: BTreeMap::new(),
            filters: Vec::new(),
            include_managed: false,
            include_defaults: false,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            timeout: DEFAULT_TIMEOUT,
            use_cache: false,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.regions = regions.into_iter().map(Into::into).collect();
        self
    }

    pub fn resource_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resource_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Require a tag on every returned resource
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn filter(mut self, filter: ResourceFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn include_managed(mut self, include: bool) -> Self {
        self.include_managed = include;
        self
    }

    pub fn include_defaults(mut self, include: bool) -> Self {
        self.include_defaults = include;
        self
    }

    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Check limits that must hold before any connector is touched
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.providers.is_empty() {
            return Err(EngineError::NoProviders);
        }
        if self.max_concurrency == 0 {
            return Err(EngineError::InvalidOptions(
                "maxConcurrency must be at least 1".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(EngineError::InvalidOptions(
                "timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// User filters followed by one `include equals tags.<k>` rule per required tag
    pub fn effective_filters(&self) -> Vec<ResourceFilter> {
        self.filters
            .iter()
            .cloned()
            .chain(self.tags.iter().map(|(key, value)| {
                ResourceFilter::include(format!("tags.{}", key), FilterOperator::Equals)
                    .value(value.as_str())
            }))
            .collect()
    }

    /// Validate and compile the effective filters
    pub fn compile_filters(&self) -> Result<FilterSet, EngineError> {
        FilterSet::compile(&self.effective_filters())
    }

    /// Project the options onto a single provider
    pub fn for_provider(&self, provider: CloudProvider) -> ProviderDiscoveryOptions {
        ProviderDiscoveryOptions {
            provider,
            regions: self.regions.clone(),
            resource_types: self.resource_types.clone(),
            tags: self.tags.clone(),
            include_managed: self.include_managed,
            include_defaults: self.include_defaults,
            timeout: self.timeout,
        }
    }

    /// Deterministic cache key for the content-affecting fields.
    ///
    /// Provider, region, type and filter order don't change the key, and
    /// neither do the execution limits or cache settings.
    pub fn fingerprint(&self) -> String {
        let mut regions = self.regions.clone();
        regions.sort();
        regions.dedup();

        let mut resource_types = self.resource_types.clone();
        resource_types.sort();
        resource_types.dedup();

        let mut filters: Vec<String> = self
            .filters
            .iter()
            .map(|f| serde_json::to_string(f).unwrap_or_default())
            .collect();
        filters.sort();

        let canonical = CanonicalOptions {
            providers: &self.providers,
            regions,
            resource_types,
            tags: &self.tags,
            filters,
            include_managed: self.include_managed,
            include_defaults: self.include_defaults,
        };

        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(&canonical).unwrap_or_default());
        format!("{}{}", FINGERPRINT_PREFIX, hex::encode(hasher.finalize()))
    }
}

#[derive(Serialize)]
struct CanonicalOptions<'a> {
    providers: &'a BTreeSet<CloudProvider>,
    regions: Vec<String>,
    resource_types: Vec<String>,
    tags: &'a BTreeMap<String, String>,
    filters: Vec<String>,
    include_managed: bool,
    include_defaults: bool,
}

/// Per-provider projection handed to a connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDiscoveryOptions {
    pub provider: CloudProvider,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_types: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    pub include_managed: bool,
    pub include_defaults: bool,
    #[serde(with = "secs")]
    pub timeout: Duration,
}

impl ProviderDiscoveryOptions {
    /// True if the connector should enumerate `resource_type`
    pub fn wants_type(&self, resource_type: &str) -> bool {
        self.resource_types.is_empty() || self.resource_types.iter().any(|t| t == resource_type)
    }

    /// True if the connector should scan `region`
    pub fn wants_region(&self, region: &str) -> bool {
        self.regions.is_empty() || self.regions.iter().any(|r| r == region)
    }
}

pub(crate) mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterOperator;

    #[test]
    fn test_defaults() {
        let opts = DiscoveryOptions::new([CloudProvider::Aws]);
        assert_eq!(opts.max_concurrency, 10);
        assert_eq!(opts.timeout, DEFAULT_TIMEOUT);
        assert!(!opts.use_cache);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            DiscoveryOptions::new([]).validate(),
            Err(EngineError::NoProviders)
        ));
        assert!(matches!(
            DiscoveryOptions::new([CloudProvider::Gcp]).max_concurrency(0).validate(),
            Err(EngineError::InvalidOptions(_))
        ));
        assert!(matches!(
            DiscoveryOptions::new([CloudProvider::Gcp]).timeout(Duration::ZERO).validate(),
            Err(EngineError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = DiscoveryOptions::new([CloudProvider::Aws, CloudProvider::Azure])
            .regions(["us-east-1", "eu-west-1"])
            .filter(ResourceFilter::include("type", FilterOperator::Equals).value("vpc"))
            .filter(ResourceFilter::exclude("name", FilterOperator::Contains).value("tmp"));

        let b = DiscoveryOptions::new([CloudProvider::Azure, CloudProvider::Aws, CloudProvider::Aws])
            .regions(["eu-west-1", "us-east-1"])
            .filter(ResourceFilter::exclude("name", FilterOperator::Contains).value("tmp"))
            .filter(ResourceFilter::include("type", FilterOperator::Equals).value("vpc"))
            .max_concurrency(2)
            .use_cache(true);

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert!(a.fingerprint().starts_with("discovery:"));
        assert_eq!(a.fingerprint().len(), "discovery:".len() + 64);
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let base = DiscoveryOptions::new([CloudProvider::Aws]);
        assert_ne!(base.fingerprint(), base.clone().include_managed(true).fingerprint());
        assert_ne!(base.fingerprint(), base.clone().tag("env", "prod").fingerprint());
        assert_ne!(
            base.fingerprint(),
            DiscoveryOptions::new([CloudProvider::Aws, CloudProvider::Gcp]).fingerprint()
        );
    }

    #[test]
    fn test_tags_become_include_filters() {
        let opts = DiscoveryOptions::new([CloudProvider::Aws])
            .filter(ResourceFilter::include("type", FilterOperator::Equals).value("instance"))
            .tag("env", "prod");

        let filters = opts.effective_filters();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[1].field, "tags.env");
        assert_eq!(opts.compile_filters().unwrap().len(), 2);
    }

    #[test]
    fn test_provider_projection() {
        let opts = DiscoveryOptions::new([CloudProvider::Aws, CloudProvider::Gcp])
            .regions(["us-east-1"])
            .resource_types(["instance"])
            .include_defaults(true);

        let projected = opts.for_provider(CloudProvider::Gcp);
        assert_eq!(projected.provider, CloudProvider::Gcp);
        assert!(projected.include_defaults);
        assert!(projected.wants_type("instance"));
        assert!(!projected.wants_type("bucket"));
        assert!(projected.wants_region("us-east-1"));
        assert!(!projected.wants_region("eu-west-1"));
    }

    #[test]
    fn test_options_wire_names() {
        let json = serde_json::to_value(
            DiscoveryOptions::new([CloudProvider::Kvm]).cache_ttl(Duration::from_secs(60)),
        )
        .unwrap();
        assert_eq!(json["providers"][0], "kvm");
        assert_eq!(json["cacheTTL"], 60);
        assert_eq!(json["maxConcurrency"], 10);
        assert!(json.get("regions").is_none());
    }
}
