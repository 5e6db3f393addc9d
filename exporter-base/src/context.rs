//! The process-wide application context: the one composition point where
//! settings, metric registry, connection pool, health registry and the
//! poller manager meet. Constructed once in `main` (tests build their own
//! with a fake RPC factory) and shared behind an `Arc`.

use std::sync::Arc;

use prometheus::Registry;
use serde_json::json;
use tracing::info;

use exporter_core::RpcFactory;
use exporter_ethereum::{ProviderPool, RpcClientMetrics};

use crate::health::{epoch_now, HealthRegistry};
use crate::metrics::ExporterMetrics;
use crate::poller::{PollerConfig, PollerManager};
use crate::readiness;
use crate::reload::{compute_plan, ReloadError, ReloadSummary};
use crate::settings::{load_chain_specs, Settings};

pub const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

pub struct ApplicationContext {
    pub settings: Settings,
    pub metrics: Arc<ExporterMetrics>,
    pub health: Arc<HealthRegistry>,
    pub manager: Arc<PollerManager>,
    reload_lock: tokio::sync::Mutex<()>,
}

impl ApplicationContext {
    /// Build the production context with the ethers-backed connection pool.
    pub fn new(settings: Settings) -> eyre::Result<Arc<Self>> {
        let registry = Registry::new();
        let rpc_metrics = RpcClientMetrics::new(&registry)?;
        let factory: Arc<dyn RpcFactory> = Arc::new(ProviderPool::new(
            settings.rpc_request_timeout,
            rpc_metrics,
        ));
        Self::with_factory(settings, registry, factory)
    }

    /// Build a context around an arbitrary RPC factory. Tests inject scripted
    /// fakes through this.
    pub fn with_factory(
        settings: Settings,
        registry: Registry,
        factory: Arc<dyn RpcFactory>,
    ) -> eyre::Result<Arc<Self>> {
        let metrics = Arc::new(ExporterMetrics::new(registry)?);
        let health = Arc::new(HealthRegistry::default());
        let manager = Arc::new(PollerManager::new(
            PollerConfig {
                default_poll_interval: settings.poll_default_interval,
                max_failure_backoff: settings.max_failure_backoff,
                shutdown_grace: SHUTDOWN_GRACE,
            },
            metrics.clone(),
            health.clone(),
            factory,
        ));
        Ok(Arc::new(Self {
            settings,
            metrics,
            health,
            manager,
            reload_lock: tokio::sync::Mutex::new(()),
        }))
    }

    /// Start polling the given chains. With warm poll enabled this returns
    /// only after every chain has completed its first tick, so readiness is
    /// meaningful from the first probe.
    pub async fn start(&self, chains: Vec<exporter_core::ChainSpec>) {
        self.metrics.set_up(true);
        self.metrics.set_configured_blockchains(chains.len() as i64);
        self.manager.start(chains);
        if self.settings.warm_poll {
            info!("warm poll enabled, waiting for first tick of every chain");
            self.manager.wait_first_attempts().await;
        }
    }

    /// Re-read the configuration and reconcile the running chains with it.
    /// Serialised: a second caller gets `InFlight` instead of queueing.
    /// Atomic: an invalid config leaves the running system untouched.
    pub async fn reload(&self) -> Result<ReloadSummary, ReloadError> {
        let _guard = self
            .reload_lock
            .try_lock()
            .map_err(|_| ReloadError::InFlight)?;

        let desired = load_chain_specs(&self.settings)?;
        let current = self.manager.current_specs();
        let plan = compute_plan(&current, &desired);
        let summary = ReloadSummary {
            added: plan.add.len(),
            removed: plan.remove.len(),
            replaced: plan.replace.len(),
        };
        info!(
            added = summary.added,
            removed = summary.removed,
            replaced = summary.replaced,
            "applying config reload"
        );
        self.manager.apply_plan(plan).await;
        self.metrics.set_configured_blockchains(desired.len() as i64);
        Ok(summary)
    }

    pub fn liveness(&self) -> bool {
        readiness::liveness(&self.health)
    }

    pub fn readiness(&self) -> bool {
        readiness::readiness(
            &self.health,
            epoch_now(),
            self.settings.readiness_stale_threshold,
        )
    }

    /// Structured per-chain report for `/health/details`.
    pub fn health_details(&self) -> serde_json::Value {
        let chains = self
            .health
            .snapshot(epoch_now(), self.settings.readiness_stale_threshold);
        json!({
            "status": if self.readiness() { "ready" } else { "not_ready" },
            "chains": chains,
        })
    }

    pub async fn shutdown(&self) {
        self.metrics.set_up(false);
        self.manager.stop_all().await;
    }
}
