use async_trait::async_trait;
use ethers_core::types::{Bytes, H160, H256, U256};

use crate::error::RpcError;
use crate::types::{BlockTag, LogEntry};

/// The capability set the collector needs from an EVM JSON-RPC endpoint.
///
/// Any implementation providing these six operations with the categorised
/// error contract of [`RpcError`] is a valid collaborator, including
/// in-memory fakes for testing. Implementations own their retry policy for
/// transient errors; callers see either a final value or a final categorised
/// error.
#[async_trait]
pub trait EvmRpc: Send + Sync {
    /// `eth_chainId`.
    async fn chain_id(&self) -> Result<u64, RpcError>;

    /// Height of the block the tag resolves to. `Number(n)` resolves to `n`.
    async fn block_number(&self, tag: BlockTag) -> Result<u64, RpcError>;

    /// Native balance in wei.
    async fn balance(&self, address: H160, tag: BlockTag) -> Result<U256, RpcError>;

    /// Deployed bytecode; empty for plain accounts.
    async fn code(&self, address: H160, tag: BlockTag) -> Result<Bytes, RpcError>;

    /// `eth_call` of pre-encoded calldata against `to`.
    async fn call(&self, to: H160, data: Bytes, tag: BlockTag) -> Result<Bytes, RpcError>;

    /// `eth_getLogs` over an inclusive block range, filtered by emitting
    /// address and topic positions (index 0 = topic0).
    async fn logs(
        &self,
        from_block: u64,
        to_block: u64,
        address: H160,
        topics: &[H256],
    ) -> Result<Vec<LogEntry>, RpcError>;
}

/// Hands out one [`EvmRpc`] per endpoint. The production implementation is a
/// connection pool; tests substitute scripted fakes.
pub trait RpcFactory: Send + Sync {
    fn client(
        &self,
        chain_name: &str,
        rpc_url: &str,
    ) -> Result<std::sync::Arc<dyn EvmRpc>, RpcError>;

    /// Drop any cached client for `rpc_url`. Called when a chain is removed
    /// or its endpoint replaced.
    fn invalidate(&self, rpc_url: &str);
}
