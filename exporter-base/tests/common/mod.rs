//! Scripted in-memory chain used by the collector and lifecycle tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ethers_core::abi::{self, Token};
use ethers_core::types::{Bytes, H160, H256, U256};
use parking_lot::Mutex;

use exporter_base::metrics::ExporterMetrics;
use exporter_core::{BlockTag, EvmRpc, LogEntry, RpcError, RpcFactory};

#[derive(Default)]
pub struct FakeChainState {
    pub chain_id: u64,
    pub latest_block: u64,
    pub finalized_block: Option<u64>,
    pub balances: HashMap<H160, U256>,
    pub code: HashMap<H160, Bytes>,
    pub call_responses: HashMap<(H160, [u8; 4]), Bytes>,
    /// Block numbers carrying one Transfer log each, per contract.
    pub transfer_blocks: HashMap<H160, Vec<u64>>,
    /// Addresses whose balance reads fail with a connection error.
    pub failing_balances: Vec<H160>,
    /// When set, every operation fails with a connection error.
    pub down: bool,
    /// Operation log, for asserting what was (not) called.
    pub operations: Vec<String>,
}

#[derive(Clone, Default)]
pub struct FakeChain {
    pub state: Arc<Mutex<FakeChainState>>,
}

impl FakeChain {
    pub fn new(chain_id: u64, latest_block: u64) -> Self {
        let chain = Self::default();
        {
            let mut state = chain.state.lock();
            state.chain_id = chain_id;
            state.latest_block = latest_block;
            state.finalized_block = Some(latest_block.saturating_sub(2));
        }
        chain
    }

    pub fn set_down(&self, down: bool) {
        self.state.lock().down = down;
    }

    pub fn set_balance(&self, address: H160, wei: u64) {
        self.state.lock().balances.insert(address, U256::from(wei));
    }

    pub fn set_chain_id(&self, chain_id: u64) {
        self.state.lock().chain_id = chain_id;
    }

    /// Script an ERC-20: bytecode present, decimals and totalSupply respond.
    pub fn script_erc20(&self, address: H160, decimals: u8, supply: u64) {
        let mut state = self.state.lock();
        state.code.insert(address, Bytes::from(vec![0x60, 0x80]));
        state.call_responses.insert(
            (address, [0x31, 0x3c, 0xe5, 0x67]),
            encode_uint(decimals as u64),
        );
        state
            .call_responses
            .insert((address, [0x18, 0x16, 0x0d, 0xdd]), encode_uint(supply));
    }

    /// Script a contract with bytecode and a totalSupply but no decimals.
    pub fn script_supply_only(&self, address: H160, supply: u64) {
        let mut state = self.state.lock();
        state.code.insert(address, Bytes::from(vec![0x60, 0x80]));
        state
            .call_responses
            .insert((address, [0x18, 0x16, 0x0d, 0xdd]), encode_uint(supply));
    }

    pub fn script_erc20_balance(&self, contract: H160, balance: u64) {
        self.state.lock().call_responses.insert(
            (contract, [0x70, 0xa0, 0x82, 0x31]),
            encode_uint(balance),
        );
    }

    pub fn operations(&self) -> Vec<String> {
        self.state.lock().operations.clone()
    }
}

pub fn encode_uint(value: u64) -> Bytes {
    Bytes::from(abi::encode(&[Token::Uint(U256::from(value))]))
}

fn down_error() -> RpcError {
    RpcError::Connection("connection refused".into())
}

#[async_trait]
impl EvmRpc for FakeChain {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        let mut state = self.state.lock();
        state.operations.push("chain_id".into());
        if state.down {
            return Err(down_error());
        }
        Ok(state.chain_id)
    }

    async fn block_number(&self, tag: BlockTag) -> Result<u64, RpcError> {
        let mut state = self.state.lock();
        state.operations.push(format!("block_number:{tag:?}"));
        if state.down {
            return Err(down_error());
        }
        match tag {
            BlockTag::Latest => Ok(state.latest_block),
            BlockTag::Finalized => state
                .finalized_block
                .ok_or_else(|| RpcError::Value("no finalized block".into())),
            BlockTag::Number(n) => Ok(n),
        }
    }

    async fn balance(&self, address: H160, _tag: BlockTag) -> Result<U256, RpcError> {
        let mut state = self.state.lock();
        state.operations.push("balance".into());
        if state.down || state.failing_balances.contains(&address) {
            return Err(down_error());
        }
        Ok(state.balances.get(&address).copied().unwrap_or_default())
    }

    async fn code(&self, address: H160, _tag: BlockTag) -> Result<Bytes, RpcError> {
        let mut state = self.state.lock();
        state.operations.push("code".into());
        if state.down {
            return Err(down_error());
        }
        Ok(state.code.get(&address).cloned().unwrap_or_default())
    }

    async fn call(&self, to: H160, data: Bytes, _tag: BlockTag) -> Result<Bytes, RpcError> {
        let mut state = self.state.lock();
        state.operations.push("call".into());
        if state.down {
            return Err(down_error());
        }
        let mut selector = [0u8; 4];
        selector.copy_from_slice(&data[..4]);
        state
            .call_responses
            .get(&(to, selector))
            .cloned()
            .ok_or_else(|| RpcError::Value("execution reverted".into()))
    }

    async fn logs(
        &self,
        from_block: u64,
        to_block: u64,
        address: H160,
        _topics: &[H256],
    ) -> Result<Vec<LogEntry>, RpcError> {
        let mut state = self.state.lock();
        state
            .operations
            .push(format!("logs:{from_block}-{to_block}"));
        if state.down {
            return Err(down_error());
        }
        Ok(state
            .transfer_blocks
            .get(&address)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| (from_block..=to_block).contains(b))
                    .map(|&block_number| LogEntry {
                        address,
                        block_number,
                        topics: vec![],
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Factory handing out pre-registered fake chains by chain name.
#[derive(Default)]
pub struct FakeFactory {
    pub chains: Mutex<HashMap<String, FakeChain>>,
    pub invalidated: Mutex<Vec<String>>,
}

impl FakeFactory {
    pub fn with_chain(self, name: &str, chain: FakeChain) -> Self {
        self.chains.lock().insert(name.to_string(), chain);
        self
    }
}

impl RpcFactory for FakeFactory {
    fn client(&self, chain_name: &str, _rpc_url: &str) -> Result<Arc<dyn EvmRpc>, RpcError> {
        self.chains
            .lock()
            .get(chain_name)
            .map(|chain| Arc::new(chain.clone()) as Arc<dyn EvmRpc>)
            .ok_or_else(|| RpcError::Connection(format!("no fake chain named {chain_name}")))
    }

    fn invalidate(&self, rpc_url: &str) {
        self.invalidated.lock().push(rpc_url.to_string());
    }
}

/// Read one gauge value out of the registry, matching all given labels.
pub fn gauge_value(
    metrics: &ExporterMetrics,
    family: &str,
    labels: &[(&str, &str)],
) -> Option<f64> {
    metrics
        .registry()
        .gather()
        .iter()
        .find(|f| f.get_name() == family)?
        .get_metric()
        .iter()
        .find(|m| {
            labels.iter().all(|(name, value)| {
                m.get_label()
                    .iter()
                    .any(|l| l.get_name() == *name && l.get_value() == *value)
            })
        })
        .map(|m| m.get_gauge().get_value())
}

/// Whether any series in the payload carries the given label value.
pub fn has_series_with_label(metrics: &ExporterMetrics, name: &str, value: &str) -> bool {
    metrics.registry().gather().iter().any(|family| {
        family.get_metric().iter().any(|metric| {
            metric
                .get_label()
                .iter()
                .any(|l| l.get_name() == name && l.get_value() == value)
        })
    })
}
