//! Per-chain poll loops and their manager.
//!
//! Every active chain has exactly one loop task: created on startup or
//! reload-add, cancelled on reload-remove or shutdown. The manager's map is
//! guarded by an advisory lock held only across set mutations, never across
//! RPC calls; a loop mutates only its own state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use exporter_core::{ChainSpec, ErrorCategory, RpcFactory};

use crate::collector::{CollectOutcome, Collector};
use crate::health::{epoch_now, ChainHealth, HealthRegistry};
use crate::metrics::{families, ExporterMetrics, LabelCache};
use crate::reload::ReloadPlan;

/// Tuning shared by every loop.
#[derive(Clone, Debug)]
pub struct PollerConfig {
    pub default_poll_interval: Duration,
    pub max_failure_backoff: Duration,
    pub shutdown_grace: Duration,
}

struct ChainHandle {
    spec: Arc<RwLock<ChainSpec>>,
    cache: Arc<LabelCache>,
    health: Arc<ChainHealth>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Owns the set of active chains and their loop tasks.
pub struct PollerManager {
    config: PollerConfig,
    metrics: Arc<ExporterMetrics>,
    health: Arc<HealthRegistry>,
    factory: Arc<dyn RpcFactory>,
    chains: Mutex<HashMap<String, ChainHandle>>,
}

impl PollerManager {
    pub fn new(
        config: PollerConfig,
        metrics: Arc<ExporterMetrics>,
        health: Arc<HealthRegistry>,
        factory: Arc<dyn RpcFactory>,
    ) -> Self {
        Self {
            config,
            metrics,
            health,
            factory,
            chains: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn one poll loop per spec. Must run inside a tokio runtime.
    pub fn start(&self, specs: Vec<ChainSpec>) {
        let mut chains = self.chains.lock();
        for spec in specs {
            let name = spec.name.clone();
            if chains.contains_key(&name) {
                warn!(chain = %name, "poll loop already running, skipping start");
                continue;
            }
            chains.insert(name, self.spawn_chain(spec));
        }
    }

    fn spawn_chain(&self, spec: ChainSpec) -> ChainHandle {
        info!(chain = %spec.name, rpc_url = %spec.rpc_url, "starting poll loop");
        let cancel = CancellationToken::new();
        let cache = Arc::new(LabelCache::default());
        let health = self.health.register(&spec.name);
        let spec_cell = Arc::new(RwLock::new(spec));
        let worker = PollWorker {
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            factory: self.factory.clone(),
            spec: spec_cell.clone(),
            cache: cache.clone(),
            health: health.clone(),
            cancel: cancel.clone(),
        };
        let join = tokio::spawn(worker.run());
        ChainHandle {
            spec: spec_cell,
            cache,
            health,
            cancel,
            join,
        }
    }

    pub fn active_chains(&self) -> Vec<String> {
        self.chains.lock().keys().cloned().collect()
    }

    pub fn current_specs(&self) -> Vec<ChainSpec> {
        self.chains
            .lock()
            .values()
            .map(|handle| handle.spec.read().clone())
            .collect()
    }

    /// Block until every active chain has completed at least one poll tick.
    /// Used by warm-poll startup so readiness is meaningful immediately.
    pub async fn wait_first_attempts(&self) {
        loop {
            let pending = {
                let chains = self.chains.lock();
                chains
                    .values()
                    .filter(|handle| !handle.health.has_attempted())
                    .count()
            };
            if pending == 0 {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Apply a reload plan: removals first (cancel, drain, prune), then
    /// additions, then in-place spec swaps.
    pub async fn apply_plan(&self, plan: ReloadPlan) {
        let removed: Vec<(String, ChainHandle)> = {
            let mut chains = self.chains.lock();
            plan.remove
                .iter()
                .filter_map(|name| chains.remove_entry(name))
                .collect()
        };
        for (name, handle) in removed {
            handle.cancel.cancel();
            if timeout(self.config.shutdown_grace, handle.join).await.is_err() {
                warn!(chain = %name, "poll loop did not stop within grace period, abandoning");
            }
            let old_url = handle.spec.read().rpc_url.clone();
            self.metrics.prune_all(&handle.cache);
            self.factory.invalidate(&old_url);
            self.health.deregister(&name);
            info!(chain = %name, "removed chain");
        }

        {
            let mut chains = self.chains.lock();
            for spec in plan.add {
                let name = spec.name.clone();
                chains.insert(name, self.spawn_chain(spec));
            }
        }

        {
            let chains = self.chains.lock();
            for spec in plan.replace {
                if let Some(handle) = chains.get(&spec.name) {
                    info!(chain = %spec.name, "replacing chain spec in place");
                    *handle.spec.write() = spec;
                } else {
                    error!(chain = %spec.name, "replace target has no running loop");
                }
            }
        }
    }

    /// Cancel every loop and wait up to the grace period. Loops stuck in an
    /// RPC round trip are abandoned to drain on their own; state is cleared
    /// regardless.
    pub async fn stop_all(&self) {
        let handles: Vec<(String, ChainHandle)> = self.chains.lock().drain().collect();
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "stopping poll loops");
        for (_, handle) in &handles {
            handle.cancel.cancel();
        }
        let grace = self.config.shutdown_grace;
        let joins = handles.into_iter().map(|(name, handle)| async move {
            if timeout(grace, handle.join).await.is_err() {
                warn!(chain = %name, "poll loop still draining at shutdown");
            }
        });
        futures::future::join_all(joins).await;
    }
}

struct PollWorker {
    config: PollerConfig,
    metrics: Arc<ExporterMetrics>,
    factory: Arc<dyn RpcFactory>,
    spec: Arc<RwLock<ChainSpec>>,
    cache: Arc<LabelCache>,
    health: Arc<ChainHealth>,
    cancel: CancellationToken,
}

impl PollWorker {
    async fn run(self) {
        self.health.mark_started();
        let mut collector: Option<Collector> = None;
        let mut consecutive_failures: u64 = 0;
        let mut backoff = {
            let spec = self.spec.read();
            spec.poll_interval_or(self.config.default_poll_interval)
        };

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let spec = self.spec.read().clone();
            let interval = spec.poll_interval_or(self.config.default_poll_interval);

            let started = Instant::now();
            let outcome = self.tick(&mut collector, &spec).await;
            let elapsed = started.elapsed();
            let now = epoch_now();

            if outcome.success {
                consecutive_failures = 0;
                backoff = interval;
                self.health.record_success(now, backoff);
            } else {
                consecutive_failures += 1;
                // The first failure keeps the regular cadence; doubling only
                // starts once failures repeat.
                backoff = if consecutive_failures == 1 {
                    interval
                } else {
                    (backoff * 2).min(self.config.max_failure_backoff.max(interval))
                };
                self.health.record_failure(
                    now,
                    outcome.first_error.unwrap_or(ErrorCategory::Unknown),
                    consecutive_failures,
                    backoff,
                );
            }

            let chain = spec.name.as_str();
            self.metrics.set_int(
                &self.cache,
                families::POLL_SUCCESS,
                &[chain],
                outcome.success as i64,
            );
            self.metrics
                .set_int(&self.cache, families::POLL_TIMESTAMP, &[chain], now as i64);
            self.metrics.set_float(
                &self.cache,
                families::POLL_DURATION,
                &[chain],
                elapsed.as_secs_f64(),
            );
            self.metrics.set_float(
                &self.cache,
                families::POLL_BACKOFF,
                &[chain],
                backoff.as_secs_f64(),
            );
            self.metrics.set_int(
                &self.cache,
                families::POLL_CONSECUTIVE_FAILURES,
                &[chain],
                consecutive_failures as i64,
            );

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(backoff) => {}
            }
        }
        debug!(chain = %self.spec.read().name, "poll loop stopped");
    }

    async fn tick(&self, collector: &mut Option<Collector>, spec: &ChainSpec) -> CollectOutcome {
        if collector.is_none() {
            match self.factory.client(&spec.name, &spec.rpc_url) {
                Ok(rpc) => {
                    *collector = Some(Collector::new(
                        rpc,
                        self.metrics.clone(),
                        self.cache.clone(),
                    ));
                }
                Err(err) => {
                    error!(chain = %spec.name, error = %err, "failed to create rpc client");
                    return CollectOutcome {
                        success: false,
                        first_error: Some(err.category()),
                    };
                }
            }
        }
        match collector.as_mut() {
            Some(collector) => collector.collect(spec).await,
            None => CollectOutcome {
                success: false,
                first_error: Some(ErrorCategory::Unknown),
            },
        }
    }
}
