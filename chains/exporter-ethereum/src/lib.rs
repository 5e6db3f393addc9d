//! Ethers-backed implementation of the exporter's RPC capability set:
//! a retrying, timeout-bounded, metric-instrumented JSON-RPC client, a
//! keep-alive-sharing connection pool, and the token-standard probing used
//! to classify contracts.

pub mod categorize;
pub mod metrics;
pub mod pool;
pub mod provider;
pub mod token;

pub use metrics::RpcClientMetrics;
pub use pool::ProviderPool;
pub use provider::EthereumRpc;
