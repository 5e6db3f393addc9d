//! The exporter's metric surface: typed gauge families on one registry,
//! written through helpers that keep each chain's label cache accurate so
//! pruning is O(live series), not O(registry).

pub mod label_cache;

use std::collections::HashSet;
use std::sync::Arc;

use prometheus::{
    opts, register_gauge_vec_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, Encoder, GaugeVec, IntGauge, IntGaugeVec, Registry,
    TextEncoder,
};

pub use label_cache::{LabelCache, SeriesKey};

/// Family names. Referenced from label caches as plain strings.
pub mod families {
    pub const CHAIN_LATEST_BLOCK: &str = "chain_latest_block";
    pub const CHAIN_FINALIZED_BLOCK: &str = "chain_finalized_block";
    pub const CHAIN_FINALIZED_STALE: &str = "chain_finalized_stale";
    pub const POLL_SUCCESS: &str = "blockchain_poll_success";
    pub const POLL_TIMESTAMP: &str = "blockchain_poll_timestamp_seconds";
    pub const POLL_DURATION: &str = "blockchain_poll_duration_seconds";
    pub const POLL_BACKOFF: &str = "blockchain_poll_backoff_seconds";
    pub const POLL_CONSECUTIVE_FAILURES: &str = "blockchain_poll_consecutive_failures";
    pub const ACCOUNT_BALANCE: &str = "account_balance_wei";
    pub const CONTRACT_ETH_BALANCE: &str = "contract_eth_balance_wei";
    pub const TOKEN_SUPPLY_RAW: &str = "contract_token_supply_raw";
    pub const TOKEN_SUPPLY_NORMALIZED: &str = "contract_token_supply_normalized";
    pub const NFT_TOTAL_SUPPLY: &str = "contract_nft_total_supply";
    pub const TOKEN_BALANCE: &str = "contract_token_balance";
    pub const TRANSFER_COUNT: &str = "contract_transfer_count_window";

    /// Families written by the collector. These are replaced wholesale on a
    /// successful tick; the poll-loop families persist across ticks and are
    /// only pruned when the chain itself goes away.
    pub const COLLECTOR_FAMILIES: &[&str] = &[
        CHAIN_LATEST_BLOCK,
        CHAIN_FINALIZED_BLOCK,
        CHAIN_FINALIZED_STALE,
        ACCOUNT_BALANCE,
        CONTRACT_ETH_BALANCE,
        TOKEN_SUPPLY_RAW,
        TOKEN_SUPPLY_NORMALIZED,
        NFT_TOTAL_SUPPLY,
        TOKEN_BALANCE,
        TRANSFER_COUNT,
    ];
}

/// All gauge families plus the process-level pair, registered on a single
/// registry so `/metrics` serialises one coherent payload.
pub struct ExporterMetrics {
    registry: Registry,

    up: IntGauge,
    configured_blockchains: IntGauge,

    chain_latest_block: IntGaugeVec,
    chain_finalized_block: IntGaugeVec,
    chain_finalized_stale: IntGaugeVec,
    poll_success: IntGaugeVec,
    poll_timestamp: IntGaugeVec,
    poll_duration: GaugeVec,
    poll_backoff: GaugeVec,
    poll_consecutive_failures: IntGaugeVec,

    account_balance: GaugeVec,

    contract_eth_balance: GaugeVec,
    token_supply_raw: GaugeVec,
    token_supply_normalized: GaugeVec,
    nft_total_supply: GaugeVec,
    token_balance: GaugeVec,
    transfer_count: IntGaugeVec,
}

const CHAIN_ID_LABELS: &[&str] = &["chain", "chain_id"];
const CHAIN_LABELS: &[&str] = &["chain"];
const NAMED_LABELS: &[&str] = &["chain", "name", "address"];
const TOKEN_BALANCE_LABELS: &[&str] = &["chain", "name", "address", "account_name", "account_address"];

impl ExporterMetrics {
    pub fn new(registry: Registry) -> prometheus::Result<Self> {
        let up = register_int_gauge_with_registry!(
            opts!("blockchain_exporter_up", "Whether the exporter is running"),
            registry
        )?;
        let configured_blockchains = register_int_gauge_with_registry!(
            opts!(
                "blockchain_exporter_configured_blockchains",
                "Number of blockchains in the active configuration"
            ),
            registry
        )?;
        let chain_latest_block = register_int_gauge_vec_with_registry!(
            opts!(families::CHAIN_LATEST_BLOCK, "Latest block height"),
            CHAIN_ID_LABELS,
            registry
        )?;
        let chain_finalized_block = register_int_gauge_vec_with_registry!(
            opts!(
                families::CHAIN_FINALIZED_BLOCK,
                "Finalized block height, 0 when the endpoint exposes none"
            ),
            CHAIN_ID_LABELS,
            registry
        )?;
        let chain_finalized_stale = register_int_gauge_vec_with_registry!(
            opts!(
                families::CHAIN_FINALIZED_STALE,
                "1 when the endpoint exposes no finalized block"
            ),
            CHAIN_ID_LABELS,
            registry
        )?;
        let poll_success = register_int_gauge_vec_with_registry!(
            opts!(
                families::POLL_SUCCESS,
                "1 when the most recent poll attempt succeeded"
            ),
            CHAIN_LABELS,
            registry
        )?;
        let poll_timestamp = register_int_gauge_vec_with_registry!(
            opts!(
                families::POLL_TIMESTAMP,
                "Epoch seconds of the most recent poll attempt"
            ),
            CHAIN_LABELS,
            registry
        )?;
        let poll_duration = register_gauge_vec_with_registry!(
            opts!(
                families::POLL_DURATION,
                "Duration of the most recent poll attempt"
            ),
            CHAIN_LABELS,
            registry
        )?;
        let poll_backoff = register_gauge_vec_with_registry!(
            opts!(
                families::POLL_BACKOFF,
                "Delay before the next poll attempt"
            ),
            CHAIN_LABELS,
            registry
        )?;
        let poll_consecutive_failures = register_int_gauge_vec_with_registry!(
            opts!(
                families::POLL_CONSECUTIVE_FAILURES,
                "Consecutive failed poll attempts"
            ),
            CHAIN_LABELS,
            registry
        )?;
        let account_balance = register_gauge_vec_with_registry!(
            opts!(families::ACCOUNT_BALANCE, "Native balance in wei"),
            NAMED_LABELS,
            registry
        )?;
        let contract_eth_balance = register_gauge_vec_with_registry!(
            opts!(
                families::CONTRACT_ETH_BALANCE,
                "Native balance held by the contract in wei"
            ),
            NAMED_LABELS,
            registry
        )?;
        let token_supply_raw = register_gauge_vec_with_registry!(
            opts!(
                families::TOKEN_SUPPLY_RAW,
                "ERC-20 total supply in base units"
            ),
            NAMED_LABELS,
            registry
        )?;
        let token_supply_normalized = register_gauge_vec_with_registry!(
            opts!(
                families::TOKEN_SUPPLY_NORMALIZED,
                "ERC-20 total supply divided by 10^decimals"
            ),
            NAMED_LABELS,
            registry
        )?;
        let nft_total_supply = register_gauge_vec_with_registry!(
            opts!(
                families::NFT_TOTAL_SUPPLY,
                "ERC-721 total supply where the contract reports one"
            ),
            NAMED_LABELS,
            registry
        )?;
        let token_balance = register_gauge_vec_with_registry!(
            opts!(
                families::TOKEN_BALANCE,
                "Token balance of an account on a contract"
            ),
            TOKEN_BALANCE_LABELS,
            registry
        )?;
        let transfer_count = register_int_gauge_vec_with_registry!(
            opts!(
                families::TRANSFER_COUNT,
                "Transfer events observed over the lookback window"
            ),
            NAMED_LABELS,
            registry
        )?;

        Ok(Self {
            registry,
            up,
            configured_blockchains,
            chain_latest_block,
            chain_finalized_block,
            chain_finalized_stale,
            poll_success,
            poll_timestamp,
            poll_duration,
            poll_backoff,
            poll_consecutive_failures,
            account_balance,
            contract_eth_balance,
            token_supply_raw,
            token_supply_normalized,
            nft_total_supply,
            token_balance,
            transfer_count,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn set_up(&self, running: bool) {
        self.up.set(running as i64);
    }

    pub fn set_configured_blockchains(&self, count: i64) {
        self.configured_blockchains.set(count);
    }

    fn int_family(&self, name: &str) -> Option<&IntGaugeVec> {
        use families::*;
        match name {
            CHAIN_LATEST_BLOCK => Some(&self.chain_latest_block),
            CHAIN_FINALIZED_BLOCK => Some(&self.chain_finalized_block),
            CHAIN_FINALIZED_STALE => Some(&self.chain_finalized_stale),
            POLL_SUCCESS => Some(&self.poll_success),
            POLL_TIMESTAMP => Some(&self.poll_timestamp),
            POLL_CONSECUTIVE_FAILURES => Some(&self.poll_consecutive_failures),
            TRANSFER_COUNT => Some(&self.transfer_count),
            _ => None,
        }
    }

    fn float_family(&self, name: &str) -> Option<&GaugeVec> {
        use families::*;
        match name {
            POLL_DURATION => Some(&self.poll_duration),
            POLL_BACKOFF => Some(&self.poll_backoff),
            ACCOUNT_BALANCE => Some(&self.account_balance),
            CONTRACT_ETH_BALANCE => Some(&self.contract_eth_balance),
            TOKEN_SUPPLY_RAW => Some(&self.token_supply_raw),
            TOKEN_SUPPLY_NORMALIZED => Some(&self.token_supply_normalized),
            NFT_TOTAL_SUPPLY => Some(&self.nft_total_supply),
            TOKEN_BALANCE => Some(&self.token_balance),
            _ => None,
        }
    }

    /// Set an integer gauge and record the series in the chain's cache.
    pub fn set_int(&self, cache: &LabelCache, family: &'static str, labels: &[&str], value: i64) {
        if let Some(vec) = self.int_family(family) {
            vec.with_label_values(labels).set(value);
            cache.record(SeriesKey::new(family, labels));
        } else {
            debug_assert!(false, "unknown int gauge family {family}");
        }
    }

    /// Set a float gauge and record the series in the chain's cache.
    pub fn set_float(&self, cache: &LabelCache, family: &'static str, labels: &[&str], value: f64) {
        if let Some(vec) = self.float_family(family) {
            vec.with_label_values(labels).set(value);
            cache.record(SeriesKey::new(family, labels));
        } else {
            debug_assert!(false, "unknown float gauge family {family}");
        }
    }

    /// Remove one series from the registry. Missing series are ignored.
    pub fn remove_series(&self, key: &SeriesKey) {
        let labels: Vec<&str> = key.labels.iter().map(|l| l.as_str()).collect();
        if let Some(vec) = self.int_family(key.family) {
            let _ = vec.remove_label_values(&labels);
        } else if let Some(vec) = self.float_family(key.family) {
            let _ = vec.remove_label_values(&labels);
        }
    }

    /// Remove every series a chain has published and empty its cache.
    pub fn prune_all(&self, cache: &LabelCache) {
        for key in cache.drain() {
            self.remove_series(&key);
        }
    }

    /// Text exposition of everything on the registry.
    pub fn gather(&self) -> prometheus::Result<Vec<u8>> {
        let families = self.registry.gather();
        let mut out = Vec::with_capacity(16 * 1024);
        TextEncoder::new().encode(&families, &mut out)?;
        Ok(out)
    }
}

/// Records one collect invocation's writes so that, on success, series the
/// spec no longer produces can be pruned without touching the poll-loop
/// families.
pub struct SeriesWriter {
    metrics: Arc<ExporterMetrics>,
    cache: Arc<LabelCache>,
    written: HashSet<SeriesKey>,
}

impl SeriesWriter {
    pub fn new(metrics: Arc<ExporterMetrics>, cache: Arc<LabelCache>) -> Self {
        Self {
            metrics,
            cache,
            written: HashSet::new(),
        }
    }

    pub fn set_int(&mut self, family: &'static str, labels: &[&str], value: i64) {
        self.metrics.set_int(&self.cache, family, labels, value);
        self.written.insert(SeriesKey::new(family, labels));
    }

    pub fn set_float(&mut self, family: &'static str, labels: &[&str], value: f64) {
        self.metrics.set_float(&self.cache, family, labels, value);
        self.written.insert(SeriesKey::new(family, labels));
    }

    /// Prune collector-owned series that were cached but not written this
    /// tick. Call only after a fully successful collect; a partial tick must
    /// not delete series it merely failed to refresh.
    pub fn finish_success(self) {
        let stale = self.cache.stale_series(&self.written, |key| {
            families::COLLECTOR_FAMILIES.contains(&key.family)
        });
        for key in stale {
            self.metrics.remove_series(&key);
            self.cache.remove(&key);
        }
    }
}
