//! Discovery lifecycle events
//!
//! Observers are invoked synchronously, in registration order. A handler
//! that returns an error or panics is logged and skipped; it never
//! affects the run.

use anyhow::Result;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::options::DiscoveryOptions;
use crate::types::{CloudProvider, DiscoveryError, DiscoveryResult, Resource};

/// Observer hooks fired at orchestration milestones.
///
/// Every hook defaults to a no-op so handlers implement only what they need.
pub trait EventHandler: Send + Sync {
    fn on_discovery_start(&self, _options: &DiscoveryOptions) -> Result<()> {
        Ok(())
    }

    fn on_discovery_complete(&self, _result: &DiscoveryResult) -> Result<()> {
        Ok(())
    }

    fn on_provider_start(&self, _provider: CloudProvider) -> Result<()> {
        Ok(())
    }

    /// `error` is set when the provider contributed no resources because it failed
    fn on_provider_complete(
        &self,
        _provider: CloudProvider,
        _resource_count: usize,
        _error: Option<&DiscoveryError>,
    ) -> Result<()> {
        Ok(())
    }

    /// Fired for every resource retained after filtering
    fn on_resource_discovered(&self, _resource: &Resource) -> Result<()> {
        Ok(())
    }

    fn on_error(&self, _error: &DiscoveryError) -> Result<()> {
        Ok(())
    }

    /// The only event fired when a run is served from cache
    fn on_cache_hit(&self, _key: &str, _result: &DiscoveryResult) -> Result<()> {
        Ok(())
    }
}

/// Ordered list of observers with error and panic isolation
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Invoke `hook` on every handler, swallowing failures
    pub fn emit<F>(&self, event: &'static str, hook: F)
    where
        F: Fn(&dyn EventHandler) -> Result<()>,
    {
        for (index, handler) in self.handlers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| hook(handler.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(event, handler = index, error = %e, "Event handler failed"),
                Err(_) => warn!(event, handler = index, "Event handler panicked"),
            }
        }
    }

    pub fn discovery_start(&self, options: &DiscoveryOptions) {
        self.emit("discovery_start", |h| h.on_discovery_start(options));
    }

    pub fn discovery_complete(&self, result: &DiscoveryResult) {
        self.emit("discovery_complete", |h| h.on_discovery_complete(result));
    }

    pub fn provider_start(&self, provider: CloudProvider) {
        self.emit("provider_start", |h| h.on_provider_start(provider));
    }

    pub fn provider_complete(
        &self,
        provider: CloudProvider,
        resource_count: usize,
        error: Option<&DiscoveryError>,
    ) {
        self.emit("provider_complete", |h| {
            h.on_provider_complete(provider, resource_count, error)
        });
    }

    pub fn resource_discovered(&self, resource: &Resource) {
        self.emit("resource_discovered", |h| h.on_resource_discovered(resource));
    }

    pub fn error(&self, error: &DiscoveryError) {
        self.emit("error", |h| h.on_error(error));
    }

    pub fn cache_hit(&self, key: &str, result: &DiscoveryResult) {
        self.emit("cache_hit", |h| h.on_cache_hit(key, result));
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Event handler that logs milestones through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventHandler;

impl EventHandler for TracingEventHandler {
    fn on_discovery_start(&self, options: &DiscoveryOptions) -> Result<()> {
        info!(
            providers = options.providers.len(),
            filters = options.filters.len(),
            "Discovery started"
        );
        Ok(())
    }

    fn on_discovery_complete(&self, result: &DiscoveryResult) -> Result<()> {
        info!(
            resources = result.metadata.resource_count,
            errors = result.metadata.error_count,
            warnings = result.metadata.warning_count,
            duration_ms = result.metadata.duration.as_millis() as u64,
            "Discovery complete"
        );
        Ok(())
    }

    fn on_provider_start(&self, provider: CloudProvider) -> Result<()> {
        debug!(%provider, "Provider discovery started");
        Ok(())
    }

    fn on_provider_complete(
        &self,
        provider: CloudProvider,
        resource_count: usize,
        error: Option<&DiscoveryError>,
    ) -> Result<()> {
        match error {
            Some(e) => warn!(%provider, error = %e.message, "Provider discovery failed"),
            None => debug!(%provider, resources = resource_count, "Provider discovery complete"),
        }
        Ok(())
    }

    fn on_error(&self, error: &DiscoveryError) -> Result<()> {
        debug!(error = %error, "Discovery error recorded");
        Ok(())
    }

    fn on_cache_hit(&self, key: &str, result: &DiscoveryResult) -> Result<()> {
        info!(key, resources = result.resources.len(), "Discovery served from cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl EventHandler for Recorder {
        fn on_provider_start(&self, provider: CloudProvider) -> Result<()> {
            self.seen.lock().unwrap().push(format!("start:{}", provider));
            Ok(())
        }
    }

    struct Failing;

    impl EventHandler for Failing {
        fn on_provider_start(&self, _provider: CloudProvider) -> Result<()> {
            anyhow::bail!("sink unavailable")
        }
    }

    struct Panicking;

    impl EventHandler for Panicking {
        fn on_provider_start(&self, _provider: CloudProvider) -> Result<()> {
            panic!("handler bug")
        }
    }

    #[test]
    fn test_failures_are_isolated_and_order_is_kept() {
        let first = Arc::new(Recorder::default());
        let last = Arc::new(Recorder::default());

        let mut bus = EventBus::new();
        bus.subscribe(first.clone());
        bus.subscribe(Arc::new(Failing));
        bus.subscribe(Arc::new(Panicking));
        bus.subscribe(last.clone());
        assert_eq!(bus.len(), 4);

        bus.provider_start(CloudProvider::Aws);
        bus.provider_start(CloudProvider::Gcp);

        assert_eq!(*first.seen.lock().unwrap(), vec!["start:aws", "start:gcp"]);
        assert_eq!(*last.seen.lock().unwrap(), vec!["start:aws", "start:gcp"]);
    }

    #[test]
    fn test_default_hooks_are_noops() {
        let mut bus = EventBus::new();
        bus.subscribe(Arc::new(TracingEventHandler));
        bus.error(&DiscoveryError::error(CloudProvider::Kvm, "libvirt unreachable"));
        bus.resource_discovered(&Resource::new(CloudProvider::Kvm, "d1", "vm", "domain", "local"));
    }
}
