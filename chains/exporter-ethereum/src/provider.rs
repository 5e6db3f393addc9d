use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ethers::providers::{Http, JsonRpcClient, Middleware, Provider, ProviderError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{BlockId, BlockNumber, Filter, TransactionRequest, U64};
use ethers_core::types::{Bytes, H160, H256, U256};
use tokio::time::{sleep, timeout};
use tracing::debug;
use url::Url;

use exporter_core::{BlockTag, EvmRpc, LogEntry, RpcError};

use crate::categorize::categorize_provider_error;
use crate::metrics::RpcClientMetrics;
use crate::pool::shared_http_client;

/// Attempts per logical operation, including the first.
const RETRY_ATTEMPTS: u32 = 3;
/// Delay before the second attempt; doubles per retry.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// One instance per chain endpoint. Every operation is bounded by the
/// configured request timeout and retried on transient errors within the
/// per-call budget; errors come out categorised.
pub struct EthereumRpc<C: JsonRpcClient = Http> {
    provider: Provider<C>,
    chain: String,
    request_timeout: Duration,
    metrics: RpcClientMetrics,
}

impl EthereumRpc<Http> {
    pub fn new(
        chain: &str,
        url: Url,
        request_timeout: Duration,
        metrics: RpcClientMetrics,
    ) -> Self {
        let transport = Http::new_with_client(url, shared_http_client().clone());
        Self::from_client(chain, transport, request_timeout, metrics)
    }
}

impl<C: JsonRpcClient + 'static> EthereumRpc<C> {
    pub fn from_client(
        chain: &str,
        client: C,
        request_timeout: Duration,
        metrics: RpcClientMetrics,
    ) -> Self {
        Self {
            provider: Provider::new(client),
            chain: chain.to_string(),
            request_timeout,
            metrics,
        }
    }

    /// Run `f` with timeout, per-attempt metrics and transient-error retry.
    async fn request<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, RpcError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let start = Instant::now();
            let result = match timeout(self.request_timeout, f()).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(categorize_provider_error(err)),
                Err(_) => Err(RpcError::Timeout(self.request_timeout)),
            };
            self.metrics.record_attempt(
                &self.chain,
                operation,
                start.elapsed(),
                result.as_ref().err(),
            );
            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < RETRY_ATTEMPTS => {
                    debug!(
                        chain = %self.chain,
                        operation,
                        attempt,
                        error = %err,
                        "transient rpc error, retrying"
                    );
                    sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn block_id(tag: BlockTag) -> BlockId {
    match tag {
        BlockTag::Latest => BlockId::Number(BlockNumber::Latest),
        BlockTag::Finalized => BlockId::Number(BlockNumber::Finalized),
        BlockTag::Number(n) => BlockId::Number(BlockNumber::Number(U64::from(n))),
    }
}

#[async_trait]
impl<C: JsonRpcClient + 'static> EvmRpc for EthereumRpc<C> {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        let id: U256 = self
            .request("chain_id", || self.provider.get_chainid())
            .await?;
        Ok(id.as_u64())
    }

    async fn block_number(&self, tag: BlockTag) -> Result<u64, RpcError> {
        match tag {
            BlockTag::Latest => {
                let number = self
                    .request("block_number", || self.provider.get_block_number())
                    .await?;
                Ok(number.as_u64())
            }
            BlockTag::Finalized => {
                let block = self
                    .request("finalized_block", || {
                        self.provider.get_block(BlockNumber::Finalized)
                    })
                    .await?;
                block
                    .and_then(|b| b.number)
                    .map(|n| n.as_u64())
                    .ok_or_else(|| {
                        RpcError::Value("endpoint returned no finalized block".into())
                    })
            }
            BlockTag::Number(n) => Ok(n),
        }
    }

    async fn balance(&self, address: H160, tag: BlockTag) -> Result<U256, RpcError> {
        let block = block_id(tag);
        self.request("balance", || self.provider.get_balance(address, Some(block)))
            .await
    }

    async fn code(&self, address: H160, tag: BlockTag) -> Result<Bytes, RpcError> {
        let block = block_id(tag);
        self.request("code", || self.provider.get_code(address, Some(block)))
            .await
    }

    async fn call(&self, to: H160, data: Bytes, tag: BlockTag) -> Result<Bytes, RpcError> {
        let block = block_id(tag);
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.request("call", || self.provider.call(&tx, Some(block)))
            .await
    }

    async fn logs(
        &self,
        from_block: u64,
        to_block: u64,
        address: H160,
        topics: &[H256],
    ) -> Result<Vec<LogEntry>, RpcError> {
        let mut filter = Filter::new()
            .from_block(from_block)
            .to_block(to_block)
            .address(address);
        for (position, topic) in topics.iter().enumerate() {
            filter = match position {
                0 => filter.topic0(*topic),
                1 => filter.topic1(*topic),
                2 => filter.topic2(*topic),
                _ => filter.topic3(*topic),
            };
        }
        let logs = self
            .request("logs", || self.provider.get_logs(&filter))
            .await?;
        Ok(logs
            .into_iter()
            .map(|log| LogEntry {
                address: log.address,
                block_number: log.block_number.map(|n| n.as_u64()).unwrap_or_default(),
                topics: log.topics,
            })
            .collect())
    }
}
