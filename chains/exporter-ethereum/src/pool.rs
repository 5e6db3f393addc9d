use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use url::Url;

use exporter_core::{EvmRpc, RpcError, RpcFactory};

use crate::metrics::RpcClientMetrics;
use crate::provider::EthereumRpc;

/// One reqwest client for the whole process. reqwest pools keep-alive
/// connections per host internally, so polling ten chains reuses sockets
/// instead of opening ten new ones every cycle.
static SHARED_HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .build()
        .expect("failed to build shared http client")
});

pub(crate) fn shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Caches one [`EthereumRpc`] per endpoint URL. Get-or-create is idempotent;
/// reload invalidates entries whose chains were removed or re-pointed.
pub struct ProviderPool {
    request_timeout: Duration,
    metrics: RpcClientMetrics,
    clients: Mutex<HashMap<String, Arc<EthereumRpc>>>,
}

impl ProviderPool {
    pub fn new(request_timeout: Duration, metrics: RpcClientMetrics) -> Self {
        Self {
            request_timeout,
            metrics,
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl RpcFactory for ProviderPool {
    fn client(&self, chain_name: &str, rpc_url: &str) -> Result<Arc<dyn EvmRpc>, RpcError> {
        let mut clients = self.clients.lock();
        if let Some(existing) = clients.get(rpc_url) {
            return Ok(existing.clone());
        }
        let url = Url::parse(rpc_url)
            .map_err(|e| RpcError::Value(format!("invalid rpc url {rpc_url}: {e}")))?;
        let client = Arc::new(EthereumRpc::new(
            chain_name,
            url,
            self.request_timeout,
            self.metrics.clone(),
        ));
        clients.insert(rpc_url.to_string(), client.clone());
        Ok(client)
    }

    fn invalidate(&self, rpc_url: &str) {
        self.clients.lock().remove(rpc_url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;

    fn pool() -> ProviderPool {
        let metrics = RpcClientMetrics::new(&Registry::new()).unwrap();
        ProviderPool::new(Duration::from_secs(10), metrics)
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let pool = pool();
        let a = pool.client("c1", "http://localhost:8545").unwrap();
        let b = pool.client("c1", "http://localhost:8545").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn invalidate_forces_a_fresh_client() {
        let pool = pool();
        let a = pool.client("c1", "http://localhost:8545").unwrap();
        pool.invalidate("http://localhost:8545");
        let b = pool.client("c1", "http://localhost:8545").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn malformed_urls_are_value_errors() {
        let pool = pool();
        let err = match pool.client("c1", "not a url") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.category(), exporter_core::ErrorCategory::Value);
    }
}
