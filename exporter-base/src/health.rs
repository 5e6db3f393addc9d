//! Per-chain health state. Pure data: the poll loop mutates it, the
//! readiness evaluator and `/health/details` read snapshots.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::Serialize;

use exporter_core::ErrorCategory;

pub fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainStatus {
    Healthy,
    Degraded,
    Failed,
    Unknown,
}

#[derive(Default)]
struct HealthInner {
    loop_started: bool,
    last_success_ts: Option<u64>,
    last_attempt_ts: Option<u64>,
    last_error: Option<ErrorCategory>,
    consecutive_failures: u64,
    current_backoff: Duration,
}

/// Health cell for one chain. Mutated only by that chain's poll loop.
#[derive(Default)]
pub struct ChainHealth {
    inner: RwLock<HealthInner>,
}

impl ChainHealth {
    pub fn mark_started(&self) {
        self.inner.write().loop_started = true;
    }

    pub fn record_success(&self, now: u64, backoff: Duration) {
        let mut inner = self.inner.write();
        // Wall clock jumping backwards counts as "no update" for freshness.
        let now = now.max(inner.last_attempt_ts.unwrap_or(0));
        inner.last_success_ts = Some(now.max(inner.last_success_ts.unwrap_or(0)));
        inner.last_attempt_ts = Some(now);
        inner.last_error = None;
        inner.consecutive_failures = 0;
        inner.current_backoff = backoff;
    }

    pub fn record_failure(
        &self,
        now: u64,
        category: ErrorCategory,
        consecutive_failures: u64,
        backoff: Duration,
    ) {
        let mut inner = self.inner.write();
        let now = now.max(inner.last_attempt_ts.unwrap_or(0));
        inner.last_attempt_ts = Some(now);
        inner.last_error = Some(category);
        inner.consecutive_failures = consecutive_failures;
        inner.current_backoff = backoff;
    }

    pub fn loop_started(&self) -> bool {
        self.inner.read().loop_started
    }

    /// Whether at least one poll tick has completed (success or failure).
    pub fn has_attempted(&self) -> bool {
        self.inner.read().last_attempt_ts.is_some()
    }

    pub fn last_success_ts(&self) -> Option<u64> {
        self.inner.read().last_success_ts
    }

    pub fn snapshot(&self, now: u64, stale_after: Duration) -> ChainHealthSnapshot {
        let inner = self.inner.read();
        let stale = inner
            .last_success_ts
            .map(|ts| now.saturating_sub(ts) > stale_after.as_secs())
            .unwrap_or(false);
        let status = match (inner.last_attempt_ts, inner.last_success_ts) {
            (None, _) => ChainStatus::Unknown,
            (Some(_), None) => {
                if inner.consecutive_failures > 0 {
                    ChainStatus::Failed
                } else {
                    ChainStatus::Unknown
                }
            }
            (Some(_), Some(_)) if stale => {
                if inner.consecutive_failures > 0 {
                    ChainStatus::Failed
                } else {
                    ChainStatus::Degraded
                }
            }
            (Some(_), Some(_)) => {
                if inner.consecutive_failures > 0 {
                    ChainStatus::Degraded
                } else {
                    ChainStatus::Healthy
                }
            }
        };
        ChainHealthSnapshot {
            status,
            last_success_ts: inner.last_success_ts,
            last_error_kind: inner.last_error.map(|c| c.to_string()),
            consecutive_failures: inner.consecutive_failures,
            current_backoff_s: inner.current_backoff.as_secs_f64(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ChainHealthSnapshot {
    pub status: ChainStatus,
    pub last_success_ts: Option<u64>,
    pub last_error_kind: Option<String>,
    pub consecutive_failures: u64,
    pub current_backoff_s: f64,
}

/// All chains' health cells, keyed by chain name.
#[derive(Default)]
pub struct HealthRegistry {
    chains: RwLock<HashMap<String, Arc<ChainHealth>>>,
}

impl HealthRegistry {
    pub fn register(&self, name: &str) -> Arc<ChainHealth> {
        let cell = Arc::new(ChainHealth::default());
        self.chains.write().insert(name.to_string(), cell.clone());
        cell
    }

    pub fn deregister(&self, name: &str) {
        self.chains.write().remove(name);
    }

    pub fn cells(&self) -> Vec<(String, Arc<ChainHealth>)> {
        self.chains
            .read()
            .iter()
            .map(|(name, cell)| (name.clone(), cell.clone()))
            .collect()
    }

    pub fn snapshot(&self, now: u64, stale_after: Duration) -> BTreeMap<String, ChainHealthSnapshot> {
        self.chains
            .read()
            .iter()
            .map(|(name, cell)| (name.clone(), cell.snapshot(now, stale_after)))
            .collect()
    }
}
