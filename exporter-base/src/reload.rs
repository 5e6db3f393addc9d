//! Diffing a new spec set against the running one.
//!
//! `name` and `rpc_url` are identity-bearing: a change to either is a
//! remove-then-add so the connection pool entry is refreshed and the old
//! series are pruned. Everything else is a replace-in-place that keeps the
//! loop, its label cache and its continuous series.

use std::collections::HashMap;

use exporter_core::ChainSpec;

use crate::settings::ConfigError;

#[derive(Clone, Debug, Default)]
pub struct ReloadPlan {
    pub add: Vec<ChainSpec>,
    pub remove: Vec<String>,
    pub replace: Vec<ChainSpec>,
}

impl ReloadPlan {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty() && self.replace.is_empty()
    }
}

/// Result summary surfaced to the reload caller.
#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct ReloadSummary {
    pub added: usize,
    pub removed: usize,
    pub replaced: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("a reload is already in flight")]
    InFlight,

    #[error("invalid configuration: {0}")]
    Invalid(#[from] ConfigError),
}

/// Compute the disjoint add / remove / replace sets taking `current` to
/// `desired`. Applying the same transition twice yields an empty plan.
pub fn compute_plan(current: &[ChainSpec], desired: &[ChainSpec]) -> ReloadPlan {
    let current_by_name: HashMap<&str, &ChainSpec> =
        current.iter().map(|spec| (spec.name.as_str(), spec)).collect();
    let desired_by_name: HashMap<&str, &ChainSpec> =
        desired.iter().map(|spec| (spec.name.as_str(), spec)).collect();

    let mut plan = ReloadPlan::default();

    for spec in current {
        match desired_by_name.get(spec.name.as_str()) {
            None => plan.remove.push(spec.name.clone()),
            Some(new_spec) if !spec.same_identity(new_spec) => {
                // Identity change: tear down and rebuild.
                plan.remove.push(spec.name.clone());
                plan.add.push((*new_spec).clone());
            }
            Some(new_spec) if *new_spec != spec => plan.replace.push((*new_spec).clone()),
            Some(_) => {}
        }
    }

    for spec in desired {
        if !current_by_name.contains_key(spec.name.as_str()) {
            plan.add.push(spec.clone());
        }
    }

    plan
}
