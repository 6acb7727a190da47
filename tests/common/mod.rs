#![allow(dead_code)]
//! Scripted connector shared by the integration tests

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use multicloud_discovery::{
    CancellationToken, CloudProvider, ConnectorError, DiscoveryError, DiscoveryResult,
    EventHandler, ProviderConnector, ProviderDiscoveryOptions, ProviderReport, Resource,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Tracks how many connector calls are in flight at once
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(self: &Arc<Self>) -> GaugeGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard(Arc::clone(self))
    }
}

struct GaugeGuard(Arc<ConcurrencyGauge>);

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
enum Failure {
    Plain(String),
    Structured(ConnectorError),
    Panic,
}

pub struct MockConnector {
    provider: CloudProvider,
    resources: Vec<Resource>,
    warnings: Vec<DiscoveryError>,
    failure: Option<Failure>,
    credentials_error: Option<Failure>,
    delay: Duration,
    cooperative: bool,
    calls: AtomicUsize,
    gauge: Option<Arc<ConcurrencyGauge>>,
    tokens: Mutex<Vec<CancellationToken>>,
}

impl MockConnector {
    pub fn new(provider: CloudProvider) -> Self {
        Self {
            provider,
            resources: Vec::new(),
            warnings: Vec::new(),
            failure: None,
            credentials_error: None,
            delay: Duration::ZERO,
            cooperative: true,
            calls: AtomicUsize::new(0),
            gauge: None,
            tokens: Mutex::new(Vec::new()),
        }
    }

    pub fn with_resources(mut self, resources: Vec<Resource>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_warning(mut self, message: &str) -> Self {
        self.warnings.push(DiscoveryError::warning(self.provider, message));
        self
    }

    /// Report an entry of any severity through `ProviderReport::warnings`
    pub fn with_report_entry(mut self, entry: DiscoveryError) -> Self {
        self.warnings.push(entry);
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(Failure::Plain(message.to_string()));
        self
    }

    pub fn failing_with(mut self, error: ConnectorError) -> Self {
        self.failure = Some(Failure::Structured(error));
        self
    }

    pub fn panicking(mut self) -> Self {
        self.failure = Some(Failure::Panic);
        self
    }

    pub fn rejecting_credentials(mut self, message: &str) -> Self {
        self.credentials_error = Some(Failure::Plain(message.to_string()));
        self
    }

    pub fn rejecting_credentials_with(mut self, error: ConnectorError) -> Self {
        self.credentials_error = Some(Failure::Structured(error));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Keep sleeping after the token fires
    pub fn ignoring_cancellation(mut self) -> Self {
        self.cooperative = false;
        self
    }

    pub fn with_gauge(mut self, gauge: Arc<ConcurrencyGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    /// Number of discovery calls received
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// True once every token handed to a discovery call has been cancelled
    pub fn calls_cancelled(&self) -> bool {
        let tokens = self.tokens.lock().unwrap();
        !tokens.is_empty() && tokens.iter().all(|t| t.is_cancelled())
    }
}

#[async_trait]
impl ProviderConnector for MockConnector {
    fn provider(&self) -> CloudProvider {
        self.provider
    }

    async fn connect(&self, _ctx: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self, _ctx: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn validate_credentials(&self, _ctx: &CancellationToken) -> Result<()> {
        match &self.credentials_error {
            Some(Failure::Plain(message)) => Err(anyhow!("{}", message)),
            Some(Failure::Structured(error)) => Err(error.clone().into()),
            Some(Failure::Panic) => panic!("credential check bug"),
            None => Ok(()),
        }
    }

    async fn discover_resources(
        &self,
        ctx: &CancellationToken,
        options: &ProviderDiscoveryOptions,
    ) -> Result<Vec<Resource>> {
        Ok(self.discover_report(ctx, options).await?.resources)
    }

    async fn get_regions(&self, _ctx: &CancellationToken) -> Result<Vec<String>> {
        Ok(vec!["us-east-1".to_string()])
    }

    async fn get_resource_types(&self, _ctx: &CancellationToken) -> Result<Vec<String>> {
        Ok(vec!["vm".to_string(), "network".to_string()])
    }

    async fn get_resources_by_type(
        &self,
        _ctx: &CancellationToken,
        resource_type: &str,
        region: &str,
    ) -> Result<Vec<Resource>> {
        Ok(self
            .resources
            .iter()
            .filter(|r| r.resource_type == resource_type && r.region == region)
            .cloned()
            .collect())
    }

    async fn discover_report(
        &self,
        ctx: &CancellationToken,
        _options: &ProviderDiscoveryOptions,
    ) -> Result<ProviderReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(ctx.clone());
        let _guard = self.gauge.as_ref().map(|g| g.enter());

        if !self.delay.is_zero() {
            if self.cooperative {
                tokio::select! {
                    _ = ctx.cancelled() => return Err(anyhow!("interrupted")),
                    _ = tokio::time::sleep(self.delay) => {}
                }
            } else {
                tokio::time::sleep(self.delay).await;
            }
        }

        match &self.failure {
            Some(Failure::Plain(message)) => Err(anyhow!("{}", message)),
            Some(Failure::Structured(error)) => Err(error.clone().into()),
            Some(Failure::Panic) => panic!("connector bug"),
            None => Ok(ProviderReport {
                resources: self.resources.clone(),
                warnings: self.warnings.clone(),
            }),
        }
    }
}

pub fn resource(provider: CloudProvider, id: &str, resource_type: &str) -> Resource {
    Resource::new(provider, id, id, resource_type, "us-east-1")
}

/// Records every event as a short string
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<String>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn push(&self, event: String) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

impl EventHandler for RecordingHandler {
    fn on_discovery_start(&self, options: &multicloud_discovery::DiscoveryOptions) -> Result<()> {
        self.push(format!("discovery_start:{}", options.providers.len()))
    }

    fn on_discovery_complete(&self, result: &DiscoveryResult) -> Result<()> {
        self.push(format!("discovery_complete:{}", result.resources.len()))
    }

    fn on_provider_start(&self, provider: CloudProvider) -> Result<()> {
        self.push(format!("provider_start:{}", provider))
    }

    fn on_provider_complete(
        &self,
        provider: CloudProvider,
        resource_count: usize,
        error: Option<&DiscoveryError>,
    ) -> Result<()> {
        self.push(format!(
            "provider_complete:{}:{}:{}",
            provider,
            resource_count,
            error.is_some()
        ))
    }

    fn on_resource_discovered(&self, resource: &Resource) -> Result<()> {
        self.push(format!("resource:{}", resource.id))
    }

    fn on_error(&self, error: &DiscoveryError) -> Result<()> {
        self.push(format!("error:{}", error.provider))
    }

    fn on_cache_hit(&self, key: &str, _result: &DiscoveryResult) -> Result<()> {
        self.push(format!("cache_hit:{}", key))
    }
}

/// Handler whose every hook fails
pub struct BrokenHandler;

impl EventHandler for BrokenHandler {
    fn on_provider_start(&self, _provider: CloudProvider) -> Result<()> {
        Err(anyhow!("sink unavailable"))
    }

    fn on_resource_discovered(&self, _resource: &Resource) -> Result<()> {
        panic!("handler bug")
    }

    fn on_discovery_complete(&self, _result: &DiscoveryResult) -> Result<()> {
        Err(anyhow!("sink unavailable"))
    }
}
