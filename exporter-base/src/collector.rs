//! One poll tick's worth of data collection for a single chain.
//!
//! Steps run strictly in order; later steps depend on values cached by
//! earlier ones. A failing step marks the tick failed for health purposes
//! but does not stop the remaining steps — the goal is the maximum useful
//! metric update per attempt. Only a failure to resolve the chain id aborts
//! the tick, because every series label depends on it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ethers_core::types::H160;
use tracing::{debug, info, warn};

use exporter_core::chunker::{fetch_logs_chunked, LOG_MAX_CHUNK_SIZE, LOG_SPLIT_MIN_BLOCK_SPAN};
use exporter_core::{
    u256_to_f64, BlockTag, ChainSpec, ErrorCategory, EvmRpc, RpcError, TokenKind,
};
use exporter_ethereum::token;

use crate::metrics::{families, ExporterMetrics, LabelCache, SeriesWriter};

/// Verdict of one collect invocation.
pub struct CollectOutcome {
    pub success: bool,
    /// Category of the first error encountered, for health reporting.
    pub first_error: Option<ErrorCategory>,
}

/// Per-chain collection state that survives across ticks: the learned chain
/// id, the token classification cache and the set of already-reported value
/// errors.
pub struct Collector {
    rpc: Arc<dyn EvmRpc>,
    metrics: Arc<ExporterMetrics>,
    cache: Arc<LabelCache>,
    chain_id: Option<u64>,
    token_kinds: HashMap<H160, TokenKind>,
    reported_value_errors: HashSet<(H160, &'static str)>,
}

impl Collector {
    pub fn new(rpc: Arc<dyn EvmRpc>, metrics: Arc<ExporterMetrics>, cache: Arc<LabelCache>) -> Self {
        Self {
            rpc,
            metrics,
            cache,
            chain_id: None,
            token_kinds: HashMap::new(),
            reported_value_errors: HashSet::new(),
        }
    }

    pub async fn collect(&mut self, spec: &ChainSpec) -> CollectOutcome {
        let chain = spec.name.as_str();

        // Step 1: chain id. Fatal for the tick; everything else is labelled
        // with it.
        let chain_id = match self.rpc.chain_id().await {
            Ok(id) => id,
            Err(err) => {
                warn!(chain, error = %err, "failed to resolve chain id");
                return CollectOutcome {
                    success: false,
                    first_error: Some(err.category()),
                };
            }
        };
        if let Some(previous) = self.chain_id {
            if previous != chain_id {
                info!(
                    chain,
                    old_chain_id = previous,
                    new_chain_id = chain_id,
                    "chain id changed, pruning all series for this chain"
                );
                self.metrics.prune_all(&self.cache);
                self.token_kinds.clear();
                self.reported_value_errors.clear();
            }
        }
        self.chain_id = Some(chain_id);
        let chain_id_label = chain_id.to_string();

        let mut first_error: Option<ErrorCategory> = None;
        let mut writer = SeriesWriter::new(self.metrics.clone(), self.cache.clone());

        // Step 2: block heights. Best-effort on the finalized side.
        let latest = match self.rpc.block_number(BlockTag::Latest).await {
            Ok(number) => {
                writer.set_int(
                    families::CHAIN_LATEST_BLOCK,
                    &[chain, &chain_id_label],
                    number as i64,
                );
                Some(number)
            }
            Err(err) => {
                warn!(chain, error = %err, "failed to read latest block");
                note(&mut first_error, &err);
                None
            }
        };
        match self.rpc.block_number(BlockTag::Finalized).await {
            Ok(number) => {
                writer.set_int(
                    families::CHAIN_FINALIZED_BLOCK,
                    &[chain, &chain_id_label],
                    number as i64,
                );
                writer.set_int(families::CHAIN_FINALIZED_STALE, &[chain, &chain_id_label], 0);
            }
            Err(err) if err.is_transient() => {
                warn!(chain, error = %err, "failed to read finalized block");
                note(&mut first_error, &err);
            }
            Err(_) => {
                // The endpoint has no finalized tag at all. Non-fatal.
                writer.set_int(families::CHAIN_FINALIZED_BLOCK, &[chain, &chain_id_label], 0);
                writer.set_int(families::CHAIN_FINALIZED_STALE, &[chain, &chain_id_label], 1);
            }
        }

        // Step 3: native balances.
        for account in &spec.accounts {
            let address_label = format!("{:#x}", account.address);
            match self.rpc.balance(account.address, BlockTag::Latest).await {
                Ok(wei) => writer.set_float(
                    families::ACCOUNT_BALANCE,
                    &[chain, &account.name, &address_label],
                    u256_to_f64(wei),
                ),
                Err(err) => {
                    warn!(chain, account = %account.name, error = %err, "failed to read balance");
                    note(&mut first_error, &err);
                }
            }
        }

        // Step 4: contracts.
        for contract in &spec.contracts {
            self.collect_contract(spec, contract, latest, &mut writer, &mut first_error)
                .await;
        }

        // Step 5: a fully clean tick replaces the collector-owned series set,
        // pruning anything the current spec no longer produces.
        let success = first_error.is_none();
        if success {
            writer.finish_success();
        }
        CollectOutcome {
            success,
            first_error,
        }
    }

    async fn collect_contract(
        &mut self,
        spec: &ChainSpec,
        contract: &exporter_core::ContractSpec,
        latest: Option<u64>,
        writer: &mut SeriesWriter,
        first_error: &mut Option<ErrorCategory>,
    ) {
        let chain = spec.name.as_str();
        let address_label = format!("{:#x}", contract.address);
        let labels = [chain, contract.name.as_str(), address_label.as_str()];

        // 4a: classification, once per (chain, contract) for the process
        // lifetime. Transient probe failures leave the cache untouched so the
        // next tick retries.
        let kind = match self.token_kinds.get(&contract.address).copied() {
            Some(kind) => kind,
            None => match token::classify_contract(self.rpc.as_ref(), contract.address).await {
                Ok(kind) => {
                    debug!(chain, contract = %contract.name, ?kind, "classified contract");
                    self.token_kinds.insert(contract.address, kind);
                    kind
                }
                Err(err) => {
                    warn!(chain, contract = %contract.name, error = %err, "failed to classify contract");
                    note(first_error, &err);
                    return;
                }
            },
        };

        // 4b: native balance held by the contract.
        match self.rpc.balance(contract.address, BlockTag::Latest).await {
            Ok(wei) => writer.set_float(
                families::CONTRACT_ETH_BALANCE,
                &labels,
                u256_to_f64(wei),
            ),
            Err(err) => {
                warn!(chain, contract = %contract.name, error = %err, "failed to read contract balance");
                note(first_error, &err);
            }
        }

        // 4c / 4d: supply, by kind.
        match kind {
            TokenKind::Erc20 { decimals } => {
                match token::total_supply(self.rpc.as_ref(), contract.address).await {
                    Ok(Some(supply)) => {
                        let raw = u256_to_f64(supply);
                        writer.set_float(families::TOKEN_SUPPLY_RAW, &labels, raw);
                        writer.set_float(
                            families::TOKEN_SUPPLY_NORMALIZED,
                            &labels,
                            raw / 10f64.powi(decimals as i32),
                        );
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(chain, contract = %contract.name, error = %err, "failed to read total supply");
                        note(first_error, &err);
                    }
                }
            }
            TokenKind::Erc721 => {
                match token::total_supply(self.rpc.as_ref(), contract.address).await {
                    // totalSupply is an optional ERC-721 extension; omit the
                    // series when the contract lacks it.
                    Ok(Some(supply)) => {
                        writer.set_float(families::NFT_TOTAL_SUPPLY, &labels, u256_to_f64(supply));
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(chain, contract = %contract.name, error = %err, "failed to read nft supply");
                        note(first_error, &err);
                    }
                }
            }
            TokenKind::Unknown => {}
        }

        // 4e: per-account token balances.
        for account in &contract.accounts {
            self.collect_contract_account(chain, contract, kind, account, &address_label, writer, first_error)
                .await;
        }

        // 4f: transfer window.
        let lookback = contract.effective_lookback(spec.transfer_lookback_blocks);
        if lookback > 0 {
            if let Some(latest) = latest {
                let from = latest.saturating_sub(lookback);
                match fetch_logs_chunked(
                    self.rpc.as_ref(),
                    from,
                    latest,
                    contract.address,
                    &[token::transfer_topic()],
                    LOG_SPLIT_MIN_BLOCK_SPAN,
                    LOG_MAX_CHUNK_SIZE,
                )
                .await
                {
                    Ok(logs) => writer.set_int(families::TRANSFER_COUNT, &labels, logs.len() as i64),
                    Err(err) => {
                        warn!(chain, contract = %contract.name, error = %err, "failed to count transfers");
                        note(first_error, &err);
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn collect_contract_account(
        &mut self,
        chain: &str,
        contract: &exporter_core::ContractSpec,
        kind: TokenKind,
        account: &exporter_core::ContractAccountSpec,
        contract_address_label: &str,
        writer: &mut SeriesWriter,
        first_error: &mut Option<ErrorCategory>,
    ) {
        let account_address_label = format!("{:#x}", account.address);
        let labels = [
            chain,
            contract.name.as_str(),
            contract_address_label,
            account.name.as_str(),
            account_address_label.as_str(),
        ];

        let balance = match kind {
            TokenKind::Erc20 { .. } => {
                token::balance_of(self.rpc.as_ref(), contract.address, account.address)
                    .await
                    .map(u256_to_f64)
            }
            TokenKind::Erc721 if account.token_ids.is_empty() => {
                token::balance_of(self.rpc.as_ref(), contract.address, account.address)
                    .await
                    .map(u256_to_f64)
            }
            TokenKind::Erc721 => {
                // Explicit ids: the balance is how many of them the account
                // currently owns, so a transferred-away id is visible.
                let mut owned = 0u64;
                let mut failure = None;
                for token_id in &account.token_ids {
                    match token::owner_of(self.rpc.as_ref(), contract.address, *token_id).await {
                        Ok(Some(owner)) if owner == account.address => owned += 1,
                        Ok(_) => {}
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                }
                match failure {
                    Some(err) => Err(err),
                    None => Ok(owned as f64),
                }
            }
            TokenKind::Unknown => {
                self.report_value_error_once(
                    chain,
                    contract.address,
                    "balanceOf",
                    first_error,
                    &RpcError::Value(format!(
                        "contract `{}` is not a recognised token, skipping balance of `{}`",
                        contract.name, account.name
                    )),
                );
                return;
            }
        };

        match balance {
            Ok(value) => writer.set_float(families::TOKEN_BALANCE, &labels, value),
            Err(err) if err.category() == ErrorCategory::Value => {
                self.report_value_error_once(chain, contract.address, "balanceOf", first_error, &err);
            }
            Err(err) => {
                warn!(chain, contract = %contract.name, account = %account.name, error = %err, "failed to read token balance");
                note(first_error, &err);
            }
        }
    }

    /// Value errors are permanent: log one warning per (chain, contract,
    /// selector), mark the tick failed on the first occurrence, and stay
    /// silent afterwards so a misconfigured contract cannot spam the log or
    /// keep the chain unhealthy forever.
    fn report_value_error_once(
        &mut self,
        chain: &str,
        contract: H160,
        selector: &'static str,
        first_error: &mut Option<ErrorCategory>,
        err: &RpcError,
    ) {
        if self.reported_value_errors.insert((contract, selector)) {
            warn!(chain, contract = %format!("{contract:#x}"), selector, error = %err, "value error, suppressing further reports");
            note(first_error, err);
        }
    }
}

fn note(first_error: &mut Option<ErrorCategory>, err: &RpcError) {
    if first_error.is_none() {
        *first_error = Some(err.category());
    }
}
