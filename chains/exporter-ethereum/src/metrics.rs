//! Per-call instrumentation for the RPC client. The metric vecs are created
//! against the process registry and cloned into every client so all chains
//! report through the same two families.

use std::time::Duration;

use maplit::hashmap;
use prometheus::{
    histogram_opts, opts, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, HistogramVec, IntCounterVec, Registry,
};

use exporter_core::RpcError;

/// Expected label names for the duration histogram.
pub const CALL_DURATION_LABELS: &[&str] = &["chain", "operation"];
/// Expected label names for the error counter.
pub const CALL_ERRORS_LABELS: &[&str] = &["chain", "operation", "category"];

const DURATION_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Container for the rpc client metric families.
#[derive(Clone)]
pub struct RpcClientMetrics {
    /// Seconds spent on each request attempt.
    /// - `chain`: chain name the request was made for.
    /// - `operation`: logical operation, e.g. `balance` or `logs`.
    call_duration_seconds: HistogramVec,

    /// Failed request attempts by error category.
    /// - `chain`, `operation`: as above.
    /// - `category`: `timeout`, `connection`, `rpc`, `value` or `unknown`.
    call_errors_total: IntCounterVec,
}

impl RpcClientMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let call_duration_seconds = register_histogram_vec_with_registry!(
            histogram_opts!(
                "rpc_call_duration_seconds",
                "Seconds spent on each RPC request attempt",
                DURATION_BUCKETS.to_vec()
            ),
            CALL_DURATION_LABELS,
            registry
        )?;
        let call_errors_total = register_int_counter_vec_with_registry!(
            opts!(
                "rpc_call_errors_total",
                "Failed RPC request attempts by error category"
            ),
            CALL_ERRORS_LABELS,
            registry
        )?;
        Ok(Self {
            call_duration_seconds,
            call_errors_total,
        })
    }

    /// Record one attempt. Called per attempt, not per logical operation, so
    /// retries are visible.
    pub fn record_attempt(
        &self,
        chain: &str,
        operation: &str,
        elapsed: Duration,
        error: Option<&RpcError>,
    ) {
        self.call_duration_seconds
            .with(&hashmap! {
                "chain" => chain,
                "operation" => operation,
            })
            .observe(elapsed.as_secs_f64());
        if let Some(err) = error {
            let category = err.category();
            self.call_errors_total
                .with(&hashmap! {
                    "chain" => chain,
                    "operation" => operation,
                    "category" => category.as_ref(),
                })
                .inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_duration_and_categorised_errors() {
        let registry = Registry::new();
        let metrics = RpcClientMetrics::new(&registry).unwrap();

        metrics.record_attempt("c1", "balance", Duration::from_millis(80), None);
        metrics.record_attempt(
            "c1",
            "balance",
            Duration::from_millis(120),
            Some(&RpcError::Connection("refused".into())),
        );

        let families = registry.gather();
        let errors = families
            .iter()
            .find(|f| f.get_name() == "rpc_call_errors_total")
            .unwrap();
        let metric = &errors.get_metric()[0];
        assert_eq!(metric.get_counter().get_value(), 1.0);
        assert!(metric
            .get_label()
            .iter()
            .any(|l| l.get_name() == "category" && l.get_value() == "connection"));
    }
}
