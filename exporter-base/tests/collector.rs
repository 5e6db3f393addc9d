mod common;

use std::sync::Arc;

use ethers_core::types::H160;
use prometheus::Registry;

use common::{gauge_value, has_series_with_label, FakeChain};
use exporter_base::collector::Collector;
use exporter_base::metrics::{families, ExporterMetrics, LabelCache};
use exporter_core::{
    AccountSpec, ChainSpec, ContractAccountSpec, ContractSpec, ErrorCategory,
};

fn metrics() -> Arc<ExporterMetrics> {
    Arc::new(ExporterMetrics::new(Registry::new()).unwrap())
}

fn chain_spec(name: &str) -> ChainSpec {
    ChainSpec {
        name: name.into(),
        rpc_url: "http://fake".into(),
        poll_interval: None,
        transfer_lookback_blocks: 0,
        accounts: vec![],
        contracts: vec![],
    }
}

fn addr(byte: u8) -> H160 {
    H160::repeat_byte(byte)
}

#[tokio::test]
async fn publishes_account_balance_and_block_heights() {
    let chain = FakeChain::new(1, 5_000);
    chain.set_balance(addr(0xaa), 7);

    let mut spec = chain_spec("c1");
    spec.accounts.push(AccountSpec {
        name: "A".into(),
        address: addr(0xaa),
    });

    let metrics = metrics();
    let cache = Arc::new(LabelCache::default());
    let mut collector = Collector::new(Arc::new(chain), metrics.clone(), cache.clone());

    let outcome = collector.collect(&spec).await;
    assert!(outcome.success);
    assert!(outcome.first_error.is_none());

    assert_eq!(
        gauge_value(
            &metrics,
            families::ACCOUNT_BALANCE,
            &[("chain", "c1"), ("name", "A")]
        ),
        Some(7.0)
    );
    assert_eq!(
        gauge_value(
            &metrics,
            families::CHAIN_LATEST_BLOCK,
            &[("chain", "c1"), ("chain_id", "1")]
        ),
        Some(5_000.0)
    );
    assert_eq!(
        gauge_value(
            &metrics,
            families::CHAIN_FINALIZED_STALE,
            &[("chain", "c1")]
        ),
        Some(0.0)
    );
}

#[tokio::test]
async fn missing_finalized_tag_is_nonfatal() {
    let chain = FakeChain::new(1, 100);
    chain.state.lock().finalized_block = None;

    let metrics = metrics();
    let cache = Arc::new(LabelCache::default());
    let mut collector = Collector::new(Arc::new(chain), metrics.clone(), cache);

    let outcome = collector.collect(&chain_spec("c1")).await;
    assert!(outcome.success);
    assert_eq!(
        gauge_value(&metrics, families::CHAIN_FINALIZED_BLOCK, &[("chain", "c1")]),
        Some(0.0)
    );
    assert_eq!(
        gauge_value(&metrics, families::CHAIN_FINALIZED_STALE, &[("chain", "c1")]),
        Some(1.0)
    );
}

#[tokio::test]
async fn erc20_supply_is_published_raw_and_normalized() {
    let chain = FakeChain::new(1, 100);
    let token = addr(0xbb);
    chain.script_erc20(token, 6, 5_000_000);
    chain.script_erc20_balance(token, 250);

    let mut spec = chain_spec("c1");
    spec.contracts.push(ContractSpec {
        name: "tok".into(),
        address: token,
        transfer_lookback_blocks: None,
        accounts: vec![ContractAccountSpec {
            name: "vault".into(),
            address: addr(0xcc),
            token_ids: vec![],
        }],
    });

    let metrics = metrics();
    let cache = Arc::new(LabelCache::default());
    let mut collector = Collector::new(Arc::new(chain), metrics.clone(), cache);

    let outcome = collector.collect(&spec).await;
    assert!(outcome.success);
    assert_eq!(
        gauge_value(&metrics, families::TOKEN_SUPPLY_RAW, &[("name", "tok")]),
        Some(5_000_000.0)
    );
    assert_eq!(
        gauge_value(&metrics, families::TOKEN_SUPPLY_NORMALIZED, &[("name", "tok")]),
        Some(5.0)
    );
    assert_eq!(
        gauge_value(
            &metrics,
            families::TOKEN_BALANCE,
            &[("account_name", "vault")]
        ),
        Some(250.0)
    );
}

#[tokio::test]
async fn decimals_revert_falls_back_to_18() {
    let chain = FakeChain::new(1, 100);
    let token = addr(0xbb);
    chain.script_supply_only(token, 1_000_000_000_000_000_000);

    let mut spec = chain_spec("c1");
    spec.contracts.push(ContractSpec {
        name: "weird".into(),
        address: token,
        transfer_lookback_blocks: None,
        accounts: vec![],
    });

    let metrics = metrics();
    let cache = Arc::new(LabelCache::default());
    let mut collector = Collector::new(Arc::new(chain), metrics.clone(), cache);

    let outcome = collector.collect(&spec).await;
    assert!(outcome.success);
    // Raw supply published regardless; normalisation assumes 18 decimals.
    assert_eq!(
        gauge_value(&metrics, families::TOKEN_SUPPLY_RAW, &[("name", "weird")]),
        Some(1e18)
    );
    assert_eq!(
        gauge_value(&metrics, families::TOKEN_SUPPLY_NORMALIZED, &[("name", "weird")]),
        Some(1.0)
    );
}

#[tokio::test]
async fn zero_lookback_issues_no_log_queries() {
    let chain = FakeChain::new(1, 100);
    let token = addr(0xbb);
    chain.script_erc20(token, 18, 10);

    let mut spec = chain_spec("c1");
    spec.contracts.push(ContractSpec {
        name: "tok".into(),
        address: token,
        transfer_lookback_blocks: None,
        accounts: vec![],
    });

    let cache = Arc::new(LabelCache::default());
    let mut collector = Collector::new(Arc::new(chain.clone()), metrics(), cache);
    collector.collect(&spec).await;

    assert!(
        !chain.operations().iter().any(|op| op.starts_with("logs")),
        "lookback 0 must not issue eth_getLogs"
    );
}

#[tokio::test]
async fn transfer_window_counts_logs_over_the_lookback() {
    let chain = FakeChain::new(1, 100);
    let token = addr(0xbb);
    chain.script_erc20(token, 18, 10);
    chain
        .state
        .lock()
        .transfer_blocks
        .insert(token, vec![50, 91, 95, 100]);

    let mut spec = chain_spec("c1");
    spec.transfer_lookback_blocks = 10;
    spec.contracts.push(ContractSpec {
        name: "tok".into(),
        address: token,
        transfer_lookback_blocks: None,
        accounts: vec![],
    });

    let metrics = metrics();
    let cache = Arc::new(LabelCache::default());
    let mut collector = Collector::new(Arc::new(chain), metrics.clone(), cache);
    let outcome = collector.collect(&spec).await;

    assert!(outcome.success);
    // Window is [latest - lookback, latest] = [90, 100]: three transfers.
    assert_eq!(
        gauge_value(&metrics, families::TRANSFER_COUNT, &[("name", "tok")]),
        Some(3.0)
    );
}

#[tokio::test]
async fn partial_failure_still_updates_later_steps() {
    let chain = FakeChain::new(1, 100);
    chain.state.lock().failing_balances.push(addr(0xaa));
    let token = addr(0xbb);
    chain.script_erc20(token, 18, 10);

    let mut spec = chain_spec("c1");
    spec.accounts.push(AccountSpec {
        name: "A".into(),
        address: addr(0xaa),
    });
    spec.contracts.push(ContractSpec {
        name: "tok".into(),
        address: token,
        transfer_lookback_blocks: None,
        accounts: vec![],
    });

    let metrics = metrics();
    let cache = Arc::new(LabelCache::default());
    let mut collector = Collector::new(Arc::new(chain), metrics.clone(), cache);
    let outcome = collector.collect(&spec).await;

    // The account read failed, so the tick is failed for health purposes,
    // but the contract step still ran and published its supply.
    assert!(!outcome.success);
    assert_eq!(outcome.first_error, Some(ErrorCategory::Connection));
    assert!(gauge_value(&metrics, families::TOKEN_SUPPLY_RAW, &[("name", "tok")]).is_some());
}

#[tokio::test]
async fn chain_id_failure_aborts_the_tick() {
    let chain = FakeChain::new(1, 100);
    chain.set_down(true);

    let metrics = metrics();
    let cache = Arc::new(LabelCache::default());
    let mut collector = Collector::new(Arc::new(chain), metrics.clone(), cache);
    let outcome = collector.collect(&chain_spec("c1")).await;

    assert!(!outcome.success);
    assert_eq!(outcome.first_error, Some(ErrorCategory::Connection));
    assert!(!has_series_with_label(&metrics, "chain", "c1"));
}

#[tokio::test]
async fn chain_id_change_prunes_old_series_before_writing_new_ones() {
    let chain = FakeChain::new(1, 100);
    chain.set_balance(addr(0xaa), 7);

    let mut spec = chain_spec("c1");
    spec.accounts.push(AccountSpec {
        name: "A".into(),
        address: addr(0xaa),
    });

    let metrics = metrics();
    let cache = Arc::new(LabelCache::default());
    let mut collector = Collector::new(Arc::new(chain.clone()), metrics.clone(), cache);

    collector.collect(&spec).await;
    assert!(has_series_with_label(&metrics, "chain_id", "1"));

    // The endpoint now answers for a different network.
    chain.set_chain_id(137);
    collector.collect(&spec).await;

    assert!(!has_series_with_label(&metrics, "chain_id", "1"));
    assert!(has_series_with_label(&metrics, "chain_id", "137"));
}

#[tokio::test]
async fn removed_account_series_is_pruned_on_next_successful_collect() {
    let chain = FakeChain::new(1, 100);
    chain.set_balance(addr(0xaa), 1);
    chain.set_balance(addr(0xab), 2);

    let mut spec = chain_spec("c1");
    spec.accounts.push(AccountSpec {
        name: "A".into(),
        address: addr(0xaa),
    });
    spec.accounts.push(AccountSpec {
        name: "B".into(),
        address: addr(0xab),
    });

    let metrics = metrics();
    let cache = Arc::new(LabelCache::default());
    let mut collector = Collector::new(Arc::new(chain), metrics.clone(), cache);

    collector.collect(&spec).await;
    assert!(has_series_with_label(&metrics, "name", "B"));

    spec.accounts.pop();
    collector.collect(&spec).await;

    assert!(has_series_with_label(&metrics, "name", "A"));
    assert!(!has_series_with_label(&metrics, "name", "B"));
}
