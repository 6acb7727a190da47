//! Discovery Orchestrator
//!
//! Fans a discovery request out to one connector per provider, bounded by
//! `maxConcurrency`, and merges the results into a single
//! `DiscoveryResult`.
//!
//! ## Execution model
//!
//! - **Registry**: written before runs start; each run takes a snapshot,
//!   so registrations during a run never affect it
//! - **Worker pool**: `min(maxConcurrency, providers)` tasks pull jobs from
//!   a shared queue and run one connector call at a time
//! - **Fan-in**: workers send outcomes over a channel to the coordinating
//!   routine, which alone owns the resource and error lists
//! - **Isolation**: a failing, timed-out or panicking connector yields one
//!   `DiscoveryError` and zero resources; siblings are unaffected unless
//!   the error is `fatal`

use async_channel as chan;
use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::cache::Cache;
use crate::connector::{discovery_error_from, ProviderConnector, ProviderReport};
use crate::error::EngineError;
use crate::events::{EventBus, EventHandler};
use crate::filter::FilterSet;
use crate::options::{DiscoveryOptions, ProviderDiscoveryOptions};
use crate::types::{
    CloudProvider, DiscoveryError, DiscoveryMetadata, DiscoveryResult, Resource, Severity,
};

/// Message recorded for calls stopped by caller cancellation
pub const CANCELLED_MESSAGE: &str = "cancelled";

type ConnectorRegistry = HashMap<CloudProvider, Arc<dyn ProviderConnector>>;

/// Multi-cloud discovery engine
pub struct DiscoveryEngine {
    connectors: RwLock<ConnectorRegistry>,
    cache: Option<Arc<dyn Cache>>,
    events: EventBus,
}

/// One queued connector call
struct Job {
    provider: CloudProvider,
    connector: Arc<dyn ProviderConnector>,
    options: ProviderDiscoveryOptions,
}

enum CallOutcome {
    Completed(ProviderReport),
    Failed(DiscoveryError),
    TimedOut,
    Cancelled,
}

struct ProviderOutcome {
    provider: CloudProvider,
    /// False when the job was dequeued after the run was already cancelled
    started: bool,
    outcome: CallOutcome,
}

impl DiscoveryEngine {
    pub fn new() -> Self {
        Self {
            connectors: RwLock::new(HashMap::new()),
            cache: None,
            events: EventBus::new(),
        }
    }

    /// Memoize results in `cache` for runs with `useCache` set
    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Append an observer; handlers fire in registration order
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events.subscribe(handler);
        self
    }

    /// Register a connector under its provider key, replacing any previous one
    pub fn register(&self, connector: Arc<dyn ProviderConnector>) -> Option<Arc<dyn ProviderConnector>> {
        let provider = connector.provider();
        let previous = self
            .connectors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(provider, connector);

        if previous.is_some() {
            info!(%provider, "Replaced registered connector");
        } else {
            info!(%provider, "Registered connector");
        }
        previous
    }

    pub fn unregister(&self, provider: CloudProvider) -> Option<Arc<dyn ProviderConnector>> {
        self.connectors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&provider)
    }

    pub fn is_registered(&self, provider: CloudProvider) -> bool {
        self.registry().contains_key(&provider)
    }

    /// Registered providers in canonical order
    pub fn registered_providers(&self) -> Vec<CloudProvider> {
        let mut providers: Vec<CloudProvider> = self.registry().keys().copied().collect();
        providers.sort();
        providers
    }

    pub fn connector(&self, provider: CloudProvider) -> Result<Arc<dyn ProviderConnector>, EngineError> {
        self.registry()
            .get(&provider)
            .cloned()
            .ok_or(EngineError::ConnectorNotRegistered(provider))
    }

    fn registry(&self) -> std::sync::RwLockReadGuard<'_, ConnectorRegistry> {
        self.connectors.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve every requested provider, failing on the first unregistered one
    fn resolve(
        &self,
        providers: &BTreeSet<CloudProvider>,
    ) -> Result<Vec<(CloudProvider, Arc<dyn ProviderConnector>)>, EngineError> {
        let registry = self.registry();
        providers
            .iter()
            .map(|p| {
                registry
                    .get(p)
                    .cloned()
                    .map(|c| (*p, c))
                    .ok_or(EngineError::ConnectorNotRegistered(*p))
            })
            .collect()
    }

    /// Discover resources across every requested provider.
    ///
    /// Configuration errors are returned before any connector is called.
    /// Provider failures land in `result.errors`. If `ctx` is cancelled
    /// mid-run, or a connector reports a `fatal` error, the partial result
    /// is returned inside the error.
    pub async fn discover(
        &self,
        ctx: &CancellationToken,
        options: &DiscoveryOptions,
    ) -> Result<DiscoveryResult, EngineError> {
        options.validate()?;
        let filters = options.compile_filters()?;
        let connectors = self.resolve(&options.providers)?;

        let cache_key = options.use_cache.then(|| options.fingerprint());

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            match cache.get(ctx, key).await {
                Ok(Some(result)) => {
                    info!(key = %key, resources = result.resources.len(), "Serving discovery from cache");
                    self.events.cache_hit(key, &result);
                    return Ok(result);
                }
                Ok(None) => debug!(key = %key, "Cache miss"),
                Err(e) => warn!(key = %key, error = %e, "Cache lookup failed, discovering"),
            }
        }

        info!(
            providers = connectors.len(),
            max_concurrency = options.max_concurrency,
            "Starting discovery"
        );
        self.events.discovery_start(options);

        let start_time = Utc::now();
        let run = ctx.child_token();
        // Dropping this future stops in-flight connector calls
        let _run_guard = run.clone().drop_guard();
        let mut outcomes = self.spawn_workers(&run, options, connectors);

        let mut pending: BTreeSet<CloudProvider> = options.providers.clone();
        let mut resources: Vec<Resource> = Vec::new();
        let mut errors: Vec<DiscoveryError> = Vec::new();
        let mut fatal: Option<(CloudProvider, String)> = None;
        let mut cancelled_by_caller = false;

        while let Some(ProviderOutcome { provider, started, outcome }) = outcomes.recv().await {
            pending.remove(&provider);

            let failure = match outcome {
                CallOutcome::Completed(report) => {
                    let discovered = report.resources.len();
                    let kept: Vec<Resource> = report
                        .resources
                        .into_iter()
                        .filter(|r| filters.matches(r))
                        .collect();

                    debug!(%provider, discovered, retained = kept.len(), "Provider discovery complete");

                    for mut warning in report.warnings {
                        warning.provider = provider;
                        warning.severity = Severity::Warning;
                        self.record(&mut errors, warning);
                    }
                    for resource in &kept {
                        self.events.resource_discovered(resource);
                    }
                    self.events.provider_complete(provider, kept.len(), None);
                    resources.extend(kept);
                    continue;
                }
                CallOutcome::Failed(err) => {
                    if err.severity == Severity::Fatal && fatal.is_none() {
                        error!(%provider, error = %err.message, "Fatal provider error, aborting run");
                        fatal = Some((provider, err.message.clone()));
                        run.cancel();
                    } else {
                        warn!(%provider, error = %err.message, "Provider discovery failed");
                    }
                    err
                }
                CallOutcome::TimedOut => {
                    warn!(%provider, timeout_ms = options.timeout.as_millis() as u64, "Provider discovery timed out");
                    DiscoveryError::error(provider, timeout_message(options.timeout))
                }
                CallOutcome::Cancelled => {
                    let message = match &fatal {
                        Some((origin, _)) if !ctx.is_cancelled() => {
                            format!("aborted after fatal error from {}", origin)
                        }
                        _ => {
                            cancelled_by_caller = true;
                            CANCELLED_MESSAGE.to_string()
                        }
                    };
                    debug!(%provider, %message, "Provider discovery stopped");
                    DiscoveryError::error(provider, message)
                }
            };

            if started {
                self.events.provider_complete(provider, 0, Some(&failure));
            }
            self.record(&mut errors, failure);
        }

        // Workers exited without reporting; only possible if a task was torn down
        for provider in pending {
            cancelled_by_caller |= ctx.is_cancelled();
            let message = if ctx.is_cancelled() {
                CANCELLED_MESSAGE.to_string()
            } else {
                "worker exited without reporting".to_string()
            };
            self.record(&mut errors, DiscoveryError::error(provider, message));
        }

        let end_time = Utc::now();
        let metadata = DiscoveryMetadata::compute(
            start_time,
            end_time,
            &resources,
            &errors,
            &options.effective_filters(),
        );
        let result = DiscoveryResult {
            resources,
            errors,
            metadata,
        };

        self.events.discovery_complete(&result);

        if cancelled_by_caller {
            info!(resources = result.resources.len(), "Discovery cancelled, returning partial result");
            return Err(EngineError::Cancelled {
                partial: Box::new(result),
            });
        }

        if let Some((provider, message)) = fatal {
            return Err(EngineError::FatalProviderError {
                provider,
                message,
                partial: Box::new(result),
            });
        }

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Err(e) = cache.set(ctx, key, &result, options.cache_ttl).await {
                warn!(key = %key, error = %e, "Failed to cache discovery result");
            }
        }

        info!(
            resources = result.metadata.resource_count,
            errors = result.metadata.error_count,
            warnings = result.metadata.warning_count,
            duration_ms = result.metadata.duration.as_millis() as u64,
            "Discovery finished"
        );

        Ok(result)
    }

    fn record(&self, errors: &mut Vec<DiscoveryError>, error: DiscoveryError) {
        self.events.error(&error);
        errors.push(error);
    }

    /// Queue one job per provider and start the worker pool
    fn spawn_workers(
        &self,
        run: &CancellationToken,
        options: &DiscoveryOptions,
        connectors: Vec<(CloudProvider, Arc<dyn ProviderConnector>)>,
    ) -> mpsc::UnboundedReceiver<ProviderOutcome> {
        let worker_count = options.max_concurrency.min(connectors.len()).max(1);
        let (jobs_tx, jobs_rx) = chan::bounded(connectors.len().max(1));
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        for (provider, connector) in connectors {
            let job = Job {
                provider,
                options: options.for_provider(provider),
                connector,
            };
            // Capacity equals the job count and the receiver is alive
            if jobs_tx.try_send(job).is_err() {
                warn!(%provider, "Failed to queue provider job");
            }
        }
        drop(jobs_tx);

        for worker in 0..worker_count {
            tokio::spawn(
                run_worker(
                    jobs_rx.clone(),
                    results_tx.clone(),
                    run.clone(),
                    options.timeout,
                    self.events.clone(),
                )
                .instrument(info_span!("discovery_worker", worker)),
            );
        }

        results_rx
    }

    /// Connect every registered connector concurrently
    pub async fn connect_all(&self, ctx: &CancellationToken) -> Vec<DiscoveryError> {
        let connectors = self.snapshot();
        let calls = connectors.iter().map(|(provider, connector)| async move {
            (*provider, connector.connect(ctx).await.map_err(|e| e.context("connect failed")))
        });
        Self::collect_failures(join_all(calls).await)
    }

    /// Disconnect every registered connector concurrently
    pub async fn disconnect_all(&self, ctx: &CancellationToken) -> Vec<DiscoveryError> {
        let connectors = self.snapshot();
        let calls = connectors.iter().map(|(provider, connector)| async move {
            (*provider, connector.disconnect(ctx).await.map_err(|e| e.context("disconnect failed")))
        });
        Self::collect_failures(join_all(calls).await)
    }

    fn snapshot(&self) -> Vec<(CloudProvider, Arc<dyn ProviderConnector>)> {
        let mut connectors: Vec<_> = self
            .registry()
            .iter()
            .map(|(p, c)| (*p, Arc::clone(c)))
            .collect();
        connectors.sort_by_key(|(p, _)| *p);
        connectors
    }

    fn collect_failures(results: Vec<(CloudProvider, anyhow::Result<()>)>) -> Vec<DiscoveryError> {
        results
            .into_iter()
            .filter_map(|(provider, result)| {
                result.err().map(|e| {
                    let err = discovery_error_from(provider, e);
                    warn!(%provider, error = %err.message, "Connector lifecycle call failed");
                    err
                })
            })
            .collect()
    }

    /// Regions the provider's connector can scan
    pub async fn regions(
        &self,
        ctx: &CancellationToken,
        provider: CloudProvider,
    ) -> Result<Vec<String>, EngineError> {
        self.connector(provider)?
            .get_regions(ctx)
            .await
            .map_err(|source| EngineError::Connector { provider, source })
    }

    /// Resource types the provider's connector can enumerate
    pub async fn resource_types(
        &self,
        ctx: &CancellationToken,
        provider: CloudProvider,
    ) -> Result<Vec<String>, EngineError> {
        self.connector(provider)?
            .get_resource_types(ctx)
            .await
            .map_err(|source| EngineError::Connector { provider, source })
    }

    /// Resources of one type in one region, unfiltered and uncached
    pub async fn resources_by_type(
        &self,
        ctx: &CancellationToken,
        provider: CloudProvider,
        resource_type: &str,
        region: &str,
    ) -> Result<Vec<Resource>, EngineError> {
        self.connector(provider)?
            .get_resources_by_type(ctx, resource_type, region)
            .await
            .map_err(|source| EngineError::Connector { provider, source })
    }

    /// Drop the cached result for `options`, if any
    pub async fn invalidate(&self, ctx: &CancellationToken, options: &DiscoveryOptions) -> anyhow::Result<()> {
        match &self.cache {
            Some(cache) => cache.delete(ctx, &options.fingerprint()).await,
            None => Ok(()),
        }
    }

    pub async fn clear_cache(&self, ctx: &CancellationToken) -> anyhow::Result<()> {
        match &self.cache {
            Some(cache) => cache.clear(ctx).await,
            None => Ok(()),
        }
    }
}

impl Default for DiscoveryEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn timeout_message(timeout: Duration) -> String {
    format!("discovery timed out after {:?}", timeout)
}

/// Pull jobs until the queue is drained, one connector call at a time
async fn run_worker(
    jobs: chan::Receiver<Job>,
    results: mpsc::UnboundedSender<ProviderOutcome>,
    run: CancellationToken,
    timeout: Duration,
    events: EventBus,
) {
    while let Ok(job) = jobs.recv().await {
        let provider = job.provider;

        let outcome = if run.is_cancelled() {
            ProviderOutcome {
                provider,
                started: false,
                outcome: CallOutcome::Cancelled,
            }
        } else {
            events.provider_start(provider);
            let outcome = call_connector(&run, &job, timeout)
                .instrument(info_span!("provider", %provider))
                .await;
            ProviderOutcome {
                provider,
                started: true,
                outcome,
            }
        };

        if results.send(outcome).is_err() {
            break;
        }
    }
}

/// Validate credentials then discover, bounded by `timeout` and the run token
async fn call_connector(run: &CancellationToken, job: &Job, timeout: Duration) -> CallOutcome {
    let provider = job.provider;
    let call_ctx = run.child_token();

    let call = async {
        if let Err(e) = job.connector.validate_credentials(&call_ctx).await {
            // Never fatal, whatever severity the connector attached
            let mut err = discovery_error_from(provider, e.context("credential validation failed"));
            err.severity = Severity::Error;
            return Err(err);
        }

        job.connector
            .discover_report(&call_ctx, &job.options)
            .await
            .map_err(|e| discovery_error_from(provider, e))
    };

    let outcome = tokio::select! {
        biased;
        _ = run.cancelled() => CallOutcome::Cancelled,
        res = tokio::time::timeout(timeout, AssertUnwindSafe(call).catch_unwind()) => match res {
            Ok(Ok(Ok(report))) => CallOutcome::Completed(report),
            Ok(Ok(Err(err))) => CallOutcome::Failed(err),
            Ok(Err(_panic)) => CallOutcome::Failed(DiscoveryError::error(provider, "connector panicked")),
            Err(_elapsed) => CallOutcome::TimedOut,
        },
    };

    // Tell a cooperative connector to stop; a non-cooperative one is no longer awaited
    call_ctx.cancel();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;

    struct FixedConnector {
        provider: CloudProvider,
        ids: Vec<&'static str>,
    }

    #[async_trait]
    impl ProviderConnector for FixedConnector {
        fn provider(&self) -> CloudProvider {
            self.provider
        }

        async fn connect(&self, _ctx: &CancellationToken) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self, _ctx: &CancellationToken) -> Result<()> {
            anyhow::bail!("session already closed")
        }

        async fn validate_credentials(&self, _ctx: &CancellationToken) -> Result<()> {
            Ok(())
        }

        async fn discover_resources(
            &self,
            _ctx: &CancellationToken,
            options: &ProviderDiscoveryOptions,
        ) -> Result<Vec<Resource>> {
            Ok(self
                .ids
                .iter()
                .map(|id| Resource::new(options.provider, *id, *id, "network", "r1"))
                .collect())
        }

        async fn get_regions(&self, _ctx: &CancellationToken) -> Result<Vec<String>> {
            Ok(vec!["r1".to_string()])
        }

        async fn get_resource_types(&self, _ctx: &CancellationToken) -> Result<Vec<String>> {
            Ok(vec!["network".to_string()])
        }

        async fn get_resources_by_type(
            &self,
            _ctx: &CancellationToken,
            _resource_type: &str,
            _region: &str,
        ) -> Result<Vec<Resource>> {
            anyhow::bail!("not supported")
        }
    }

    fn fixed(provider: CloudProvider, ids: Vec<&'static str>) -> Arc<dyn ProviderConnector> {
        Arc::new(FixedConnector { provider, ids })
    }

    #[test]
    fn test_registration_last_wins() {
        let engine = DiscoveryEngine::new();
        assert!(engine.register(fixed(CloudProvider::Gcp, vec!["a"])).is_none());
        assert!(engine.register(fixed(CloudProvider::Gcp, vec!["b"])).is_some());
        engine.register(fixed(CloudProvider::Aws, vec![]));

        assert_eq!(engine.registered_providers(), vec![CloudProvider::Aws, CloudProvider::Gcp]);
        assert!(engine.unregister(CloudProvider::Aws).is_some());
        assert!(!engine.is_registered(CloudProvider::Aws));
        assert!(matches!(
            engine.connector(CloudProvider::Aws),
            Err(EngineError::ConnectorNotRegistered(CloudProvider::Aws))
        ));
    }

    #[tokio::test]
    async fn test_unregistered_provider_is_a_configuration_error() {
        let engine = DiscoveryEngine::new();
        engine.register(fixed(CloudProvider::Aws, vec!["vpc-1"]));

        let ctx = CancellationToken::new();
        let err = engine
            .discover(&ctx, &DiscoveryOptions::new([CloudProvider::Aws, CloudProvider::Openstack]))
            .await
            .unwrap_err();

        assert!(err.is_configuration());
        assert!(matches!(err, EngineError::ConnectorNotRegistered(CloudProvider::Openstack)));
    }

    #[tokio::test]
    async fn test_single_worker_drains_queue() {
        let engine = DiscoveryEngine::new();
        for provider in [CloudProvider::Aws, CloudProvider::Azure, CloudProvider::Gcp] {
            engine.register(fixed(provider, vec!["x", "y"]));
        }

        let ctx = CancellationToken::new();
        let opts = DiscoveryOptions::new([CloudProvider::Aws, CloudProvider::Azure, CloudProvider::Gcp])
            .max_concurrency(1);
        let result = engine.discover(&ctx, &opts).await.unwrap();

        assert_eq!(result.resources.len(), 6);
        assert!(result.errors.is_empty());
        assert_eq!(result.metadata.provider_stats.len(), 3);
    }

    #[tokio::test]
    async fn test_passthroughs_and_lifecycle() {
        let engine = DiscoveryEngine::new();
        engine.register(fixed(CloudProvider::Vmware, vec![]));
        let ctx = CancellationToken::new();

        assert_eq!(engine.regions(&ctx, CloudProvider::Vmware).await.unwrap(), vec!["r1"]);
        assert_eq!(
            engine.resource_types(&ctx, CloudProvider::Vmware).await.unwrap(),
            vec!["network"]
        );
        assert!(matches!(
            engine.resources_by_type(&ctx, CloudProvider::Vmware, "network", "r1").await,
            Err(EngineError::Connector { provider: CloudProvider::Vmware, .. })
        ));

        assert!(engine.connect_all(&ctx).await.is_empty());
        let failures = engine.disconnect_all(&ctx).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].message, "disconnect failed: session already closed");
    }
}
