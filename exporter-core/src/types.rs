use std::time::Duration;

use ethers_core::types::{H160, H256, U256};

/// Description of one chain to poll. Immutable once loaded; a config reload
/// produces a fresh set of specs and diffs it against the running one.
#[derive(Clone, Debug, PartialEq)]
pub struct ChainSpec {
    /// Symbolic chain name, unique and case-sensitive across the config.
    pub name: String,
    /// HTTP JSON-RPC endpoint. Identity-bearing: changing it is treated as
    /// removing and re-adding the chain.
    pub rpc_url: String,
    /// Per-chain poll interval; falls back to the process-wide default.
    pub poll_interval: Option<Duration>,
    /// Trailing block window over which Transfer logs are counted for every
    /// contract on this chain. Zero disables the window.
    pub transfer_lookback_blocks: u64,
    pub accounts: Vec<AccountSpec>,
    pub contracts: Vec<ContractSpec>,
}

impl ChainSpec {
    /// Effective poll interval given the process-wide fallback.
    pub fn poll_interval_or(&self, fallback: Duration) -> Duration {
        self.poll_interval.unwrap_or(fallback)
    }

    /// Whether `other` describes the same chain identity. Non-identity fields
    /// (intervals, accounts, contracts) may still differ.
    pub fn same_identity(&self, other: &ChainSpec) -> bool {
        self.name == other.name && self.rpc_url == other.rpc_url
    }
}

/// A plain account whose native balance is published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountSpec {
    pub name: String,
    pub address: H160,
}

/// A contract to classify and observe.
#[derive(Clone, Debug, PartialEq)]
pub struct ContractSpec {
    pub name: String,
    pub address: H160,
    /// Overrides the chain-level lookback for this contract's Transfer window.
    pub transfer_lookback_blocks: Option<u64>,
    pub accounts: Vec<ContractAccountSpec>,
}

impl ContractSpec {
    pub fn effective_lookback(&self, chain_default: u64) -> u64 {
        self.transfer_lookback_blocks.unwrap_or(chain_default)
    }
}

/// An account whose token balance on a specific contract is published.
#[derive(Clone, Debug, PartialEq)]
pub struct ContractAccountSpec {
    pub name: String,
    pub address: H160,
    /// For ERC-721 contracts: explicit token ids whose ownership is checked.
    /// Empty means "use balanceOf".
    pub token_ids: Vec<U256>,
}

/// Runtime-inferred token standard of a contract, cached per process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Erc20 { decimals: u8 },
    Erc721,
    /// Deployed bytecode exists but no known token selector responds, or the
    /// address holds no code at all.
    Unknown,
}

/// Block reference for read calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Finalized,
    Number(u64),
}

/// The slice of an `eth_getLogs` entry the exporter cares about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub address: H160,
    pub block_number: u64,
    pub topics: Vec<H256>,
}

/// Lossy conversion for publishing 256-bit quantities as Prometheus gauges.
/// Values beyond f64 precision round; that is accepted for metric purposes.
pub fn u256_to_f64(value: U256) -> f64 {
    value.to_string().parse::<f64>().unwrap_or(f64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_interval_falls_back() {
        let spec = ChainSpec {
            name: "c1".into(),
            rpc_url: "http://localhost:8545".into(),
            poll_interval: None,
            transfer_lookback_blocks: 0,
            accounts: vec![],
            contracts: vec![],
        };
        assert_eq!(
            spec.poll_interval_or(Duration::from_secs(300)),
            Duration::from_secs(300)
        );
        let spec = ChainSpec {
            poll_interval: Some(Duration::from_secs(5)),
            ..spec
        };
        assert_eq!(
            spec.poll_interval_or(Duration::from_secs(300)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn identity_ignores_tuning_fields() {
        let a = ChainSpec {
            name: "c1".into(),
            rpc_url: "http://localhost:8545".into(),
            poll_interval: Some(Duration::from_secs(5)),
            transfer_lookback_blocks: 10,
            accounts: vec![],
            contracts: vec![],
        };
        let mut b = a.clone();
        b.poll_interval = None;
        b.transfer_lookback_blocks = 0;
        assert!(a.same_identity(&b));
        b.rpc_url = "http://localhost:9545".into();
        assert!(!a.same_identity(&b));
    }

    #[test]
    fn u256_to_f64_small_values_are_exact() {
        assert_eq!(u256_to_f64(U256::from(7u64)), 7.0);
        assert_eq!(u256_to_f64(U256::zero()), 0.0);
    }
}
