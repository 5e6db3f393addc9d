//! Probe verdicts derived from per-chain freshness.

use std::time::Duration;

use crate::health::HealthRegistry;

/// Liveness: the process is up and at least one poll loop has started.
/// Never depends on RPC reachability.
pub fn liveness(health: &HealthRegistry) -> bool {
    health.cells().iter().any(|(_, cell)| cell.loop_started())
}

/// Readiness: at least one chain polled successfully within the staleness
/// threshold, and no chain that has ever succeeded has gone stale. Chains
/// that never succeeded stop gating once their first tick has completed, so
/// a permanently broken endpoint cannot hold startup hostage — but a chain
/// that went from healthy to stale does flip readiness.
pub fn readiness(health: &HealthRegistry, now: u64, stale_after: Duration) -> bool {
    let cells = health.cells();
    if cells.is_empty() {
        return false;
    }

    let mut any_fresh = false;
    for (_, cell) in &cells {
        match cell.last_success_ts() {
            Some(ts) => {
                if now.saturating_sub(ts) > stale_after.as_secs() {
                    return false;
                }
                any_fresh = true;
            }
            None => {
                if !cell.has_attempted() {
                    return false;
                }
            }
        }
    }
    any_fresh
}
