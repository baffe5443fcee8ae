//! Per-block relay worker
//!
//! Claims one block at a time, forks a sandbox at it, and relays every candidate found in
//! that block. All results for the block, the fees and bans learned from them, and the
//! completion marker commit in one transaction.

use alloy::primitives::Address;
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use eyre::{eyre, Result, WrapErr};
use rust_decimal::Decimal;
use sqlx::PgConnection;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::arbitrage::{CandidateArbitrage, FoundArbitrage};
use crate::config::RelayConfig;
use crate::erc20::TokenDecimals;
use crate::error::{is_transient, RelayError};
use crate::fee_transfer::{FeeKey, FeeTransferCalculator, TokenFee};
use crate::pricers::{build_pricer, ExchangePricer, PricerCache};
use crate::reservation::{claim_block, complete_block, BlockClaim, JobControl};
use crate::retry::Backoff;
use crate::sandbox::process::SandboxLauncher;
use crate::sandbox::SandboxRpc;
use crate::session::RelaySession;
use crate::simulation::{shoot, ShootOutcome, ShootSuccess};
use crate::solver::BisectionSolver;
use crate::store::{self, Store};

/// Archive-node provider the sandboxes fork from
pub async fn connect_upstream(config: &RelayConfig) -> Result<DynProvider> {
    let provider = ProviderBuilder::new()
        .connect(&config.web3_host)
        .await
        .wrap_err_with(|| format!("connecting to {}", config.web3_host))?;
    Ok(provider.erased())
}

/// Timestamp of `block` on the upstream chain
pub async fn block_timestamp(upstream: &DynProvider, block: u64) -> Result<u64> {
    let block_data = upstream
        .get_block_by_number(block.into())
        .await?
        .ok_or_else(|| eyre!("block {block} not found upstream"))?;
    Ok(block_data.header.timestamp)
}

/// Resolve exchange addresses to pricers reading through `provider`, reusing `cache`
pub async fn resolve_circuit(
    store: &Store,
    cache: &mut PricerCache,
    provider: &DynProvider,
    decimals: &Arc<TokenDecimals>,
    exchanges: &[Address],
    block: u64,
) -> Result<Vec<Arc<dyn ExchangePricer>>> {
    let mut circuit = Vec::with_capacity(exchanges.len());
    for address in exchanges {
        if let Some(pricer) = cache.get(address) {
            circuit.push(pricer);
            continue;
        }
        let record = store
            .exchange_record(*address)
            .await?
            .ok_or(RelayError::UnknownExchange(*address))?;
        let pricer = build_pricer(provider, decimals, *address, record, block)
            .await?
            .ok_or(RelayError::UnknownExchange(*address))?;
        cache.insert(pricer.clone());
        circuit.push(pricer);
    }
    Ok(circuit)
}

pub fn is_not_enough_liquidity(report: &eyre::Report) -> bool {
    matches!(RelayError::from_report(report), Some(RelayError::NotEnoughLiquidity { .. }))
}

/// Shoot `fa`, retrying once with a re-solved input when the recorded input overdraws a pool
pub async fn shoot_with_recompute(
    sandbox: &dyn SandboxRpc,
    solver: &BisectionSolver,
    fa: &FoundArbitrage,
    fees: &mut FeeTransferCalculator,
    timestamp: u64,
    must_recompute: bool,
    candidate_id: i64,
) -> Result<ShootOutcome> {
    match shoot(sandbox, solver, fa, fees, Some(timestamp), must_recompute, candidate_id).await {
        Err(e) if is_not_enough_liquidity(&e) => {
            warn!(candidate_id, error = %e, "Recorded input overdraws a pool, retrying with recompute");
            shoot(sandbox, solver, fa, fees, Some(timestamp), true, candidate_id).await
        }
        other => other,
    }
}

/// Row ids for fee records, inserting each distinct new record once per transaction.
///
/// Ids of records inserted here only reach the fee calculator through [`FeeIds::apply`], once
/// the transaction that inserted them has committed.
#[derive(Debug, Default)]
pub struct FeeIds {
    assigned: HashMap<(FeeKey, Decimal, bool), i64>,
}

impl FeeIds {
    fn known(&self, fee: &TokenFee) -> Option<i64> {
        fee.id
            .or_else(|| self.assigned.get(&(fee.key(), fee.fee, fee.round_down)).copied())
    }

    fn remember(&mut self, fee: &TokenFee, id: i64) {
        self.assigned.insert((fee.key(), fee.fee, fee.round_down), id);
    }

    pub async fn resolve(&mut self, conn: &mut PgConnection, used: &[TokenFee], block: u64) -> Result<Vec<i64>> {
        let mut ids = Vec::with_capacity(used.len());
        for fee in used {
            let id = match self.known(fee) {
                Some(id) => id,
                None => {
                    let id = store::insert_token_fee(conn, fee, block).await?;
                    self.remember(fee, id);
                    id
                }
            };
            ids.push(id);
        }
        Ok(ids)
    }

    /// Hand the ids of committed inserts to `fees`; returns how many records took one
    pub fn apply(&self, fees: &mut FeeTransferCalculator) -> usize {
        self.assigned
            .iter()
            .filter(|((key, fee, round_down), id)| fees.assign_id(key, *fee, *round_down, **id))
            .count()
    }
}

/// Outcomes collected while relaying one block
#[derive(Debug, Default)]
pub struct BlockResults {
    failures: Vec<(i64, String)>,
    successes: Vec<(i64, ShootSuccess)>,
}

impl BlockResults {
    pub fn fail(&mut self, candidate_id: i64, reason: String) {
        self.failures.push((candidate_id, reason));
    }

    pub fn succeed(&mut self, candidate_id: i64, success: ShootSuccess) {
        self.successes.push((candidate_id, success));
    }

    pub fn len(&self) -> usize {
        self.failures.len() + self.successes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the fee ids inserted along the way, valid once `conn`'s transaction commits
    async fn write(&self, conn: &mut PgConnection, block: u64) -> Result<FeeIds> {
        for (candidate_id, reason) in &self.failures {
            store::insert_relay_failure(conn, *candidate_id, reason).await?;
        }
        let mut ids = FeeIds::default();
        for (candidate_id, success) in &self.successes {
            let fee_ids = ids.resolve(conn, &success.fees_used, block).await?;
            store::insert_relay_success(conn, *candidate_id, success, &fee_ids).await?;
        }
        Ok(ids)
    }
}

/// Candidate indices at which to report progress (every 20%)
fn progress_marks(total: usize) -> [usize; 4] {
    [total / 5, total * 2 / 5, total * 3 / 5, total * 4 / 5]
}

pub struct RelayWorker {
    config: RelayConfig,
    worker: String,
    slice: u16,
    store: Store,
    upstream: DynProvider,
    launcher: SandboxLauncher,
    solver: BisectionSolver,
    fees: FeeTransferCalculator,
    decimals: Arc<TokenDecimals>,
    control: JobControl,
}

impl RelayWorker {
    pub async fn new(config: RelayConfig, worker: String, slice: u16, control: JobControl) -> Result<Self> {
        let store = Store::connect(&config).await?;
        let upstream = connect_upstream(&config).await?;
        let launcher = SandboxLauncher::from_config(&config)?;
        Ok(Self {
            config,
            worker,
            slice,
            store,
            upstream,
            launcher,
            solver: BisectionSolver::default(),
            fees: FeeTransferCalculator::new(),
            decimals: Arc::new(TokenDecimals::new()),
            control,
        })
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.store = Store::connect(&self.config).await?;
        self.upstream = connect_upstream(&self.config).await?;
        info!(worker = %self.worker, "Reconnected store and upstream");
        Ok(())
    }

    /// Claim and relay blocks until the queue is empty or cancellation is requested
    pub async fn run(&mut self) -> Result<()> {
        self.control.register().await?;
        let mut backoff = Backoff::default();
        let mut processed = 0usize;

        while !self.control.cancel_requested().await? {
            let Some(claim) = claim_block(&self.store, &self.worker).await? else {
                break;
            };

            loop {
                match self.process_block(claim).await {
                    Ok(()) => {
                        backoff.reset();
                        break;
                    }
                    Err(e) if is_transient(&e) => {
                        let Some(delay) = backoff.next_delay() else {
                            error!(reservation_id = claim.id, error = %e, "Retry window exhausted");
                            return Err(e.wrap_err(format!("relaying block {}", claim.block_number)));
                        };
                        warn!(
                            reservation_id = claim.id,
                            attempt = backoff.attempts(),
                            delay_secs = delay.as_secs(),
                            error = %e,
                            "Transient failure, reconnecting"
                        );
                        sleep(delay).await;
                        if let Err(e) = self.reconnect().await {
                            warn!(error = %e, "Reconnect failed");
                        }
                    }
                    Err(e) => {
                        error!(reservation_id = claim.id, block = claim.block_number, error = %e, "Reservation failed");
                        return Err(e);
                    }
                }
            }
            processed += 1;
        }

        info!(worker = %self.worker, processed, "Relay worker done");
        Ok(())
    }

    /// Relay one claimed block. On failure the fee calculator returns to its state before the
    /// block, since nothing learned in it was persisted.
    async fn process_block(&mut self, claim: BlockClaim) -> Result<()> {
        let checkpoint = self.fees.checkpoint();
        let relayed = self.relay_block(claim).await;
        if relayed.is_err() {
            self.fees.restore(checkpoint);
        }
        relayed
    }

    async fn relay_block(&mut self, claim: BlockClaim) -> Result<()> {
        let block = claim.block_number;
        let started = Instant::now();

        self.fees.sync(&self.store, block).await?;
        let timestamp = block_timestamp(&self.upstream, block + 1).await?;
        let candidates = self.store.candidates_in_block(block).await?;
        debug!(block, candidates = candidates.len(), "Have arbitrages to test");

        let mut session = RelaySession::new();
        let mut results = BlockResults::default();

        if !candidates.is_empty() {
            let sandbox = self.launcher.open(block, self.slice).await?;
            let mut pricers = PricerCache::new();
            let marks = progress_marks(candidates.len());

            for (i, candidate) in candidates.iter().enumerate() {
                if i > 0 && marks.contains(&i) {
                    debug!(
                        block,
                        done = i,
                        total = candidates.len(),
                        elapsed_secs = started.elapsed().as_secs(),
                        "Relay progress"
                    );
                }

                if let Some(reason) = session.skip_reason(candidate) {
                    results.fail(candidate.id, reason);
                    continue;
                }

                let outcome = self
                    .relay_candidate(&sandbox, &mut pricers, candidate, timestamp)
                    .await
                    .wrap_err_with(|| format!("relaying candidate {}", candidate.id))?;
                match (session.record(candidate, &outcome)?, outcome) {
                    (Some(reason), _) => results.fail(candidate.id, reason),
                    (None, ShootOutcome::Success(success)) => results.succeed(candidate.id, success),
                    (None, ShootOutcome::Failed(d)) => {
                        return Err(eyre!("candidate {} failed ({d}) without a label", candidate.id));
                    }
                }
            }

            let counters = session.counters();
            debug!(
                block,
                skipped = counters.skipped,
                banned = counters.banned,
                no_arbitrage_after_fee = counters.no_arbitrage_after_fee,
                succeeded = counters.succeeded,
                "Relayed block"
            );
            // sandbox is torn down here, before the write
        }

        eyre::ensure!(
            results.len() == candidates.len(),
            "block {block}: {} results for {} candidates",
            results.len(),
            candidates.len()
        );

        let mut tx = self.store.begin().await?;
        let fee_ids = results.write(&mut tx, block).await?;
        for token in session.new_banned_tokens() {
            store::insert_broken_token(&mut tx, *token, block).await?;
        }
        for exchange in session.new_banned_exchanges() {
            store::insert_banned_exchange(&mut tx, *exchange, block).await?;
        }
        complete_block(&mut tx, claim.id).await?;
        tx.commit().await?;
        let persisted = fee_ids.apply(&mut self.fees);

        info!(
            block,
            candidates = candidates.len(),
            persisted_fees = persisted,
            succeeded = session.counters().succeeded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Completed block"
        );
        Ok(())
    }

    async fn relay_candidate(
        &mut self,
        sandbox: &dyn SandboxRpc,
        pricers: &mut PricerCache,
        candidate: &CandidateArbitrage,
        timestamp: u64,
    ) -> Result<ShootOutcome> {
        debug!(candidate_id = candidate.id, "Relaying");
        let circuit = resolve_circuit(
            &self.store,
            pricers,
            &sandbox.provider(),
            &self.decimals,
            &candidate.exchanges,
            candidate.block_number,
        )
        .await?;
        let fa = FoundArbitrage::from_candidate(candidate, circuit);

        self.fees.clear_proposals();
        self.fees.infer_relays_and_aliases(&fa.circuit, sandbox.relayer());
        let has_fees = candidate.tokens().any(|t| self.fees.has_fee(&t));

        let outcome = shoot_with_recompute(
            sandbox,
            &self.solver,
            &fa,
            &mut self.fees,
            timestamp,
            has_fees,
            candidate.id,
        )
        .await?;
        if let ShootOutcome::Success(_) = &outcome {
            let promoted = self.fees.commit_proposals(candidate.block_number);
            if !promoted.is_empty() {
                debug!(candidate_id = candidate.id, fees = promoted.len(), "Committed inferred fees");
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricers::test_support::token;
    use alloy::primitives::U256;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn fee(id: Option<i64>, rate: Decimal) -> TokenFee {
        TokenFee {
            id,
            token: token(1),
            from: token(2),
            to: token(3),
            fee: rate,
            round_down: true,
            block_number: None,
            updated_on: Utc::now().naive_utc(),
        }
    }

    #[test]
    fn test_fee_ids_prefer_persisted_id() {
        let ids = FeeIds::default();
        assert_eq!(ids.known(&fee(Some(9), dec!(0.98))), Some(9));
        assert_eq!(ids.known(&fee(None, dec!(0.98))), None);
    }

    #[test]
    fn test_fee_ids_dedupe_by_value() {
        let mut ids = FeeIds::default();
        ids.remember(&fee(None, dec!(0.98)), 4);
        // same record inferred again later in the block
        let mut later = fee(None, dec!(0.98));
        later.updated_on = later.updated_on + chrono::TimeDelta::seconds(5);
        assert_eq!(ids.known(&later), Some(4));
        // a different rate for the same key is a new record
        assert_eq!(ids.known(&fee(None, dec!(0.97))), None);
    }

    #[test]
    fn test_fee_ids_reach_calculator_only_when_applied() {
        let mut calc = FeeTransferCalculator::new();
        calc.propose(token(1), token(2), token(3), dec!(0.98), true);
        calc.commit_proposals(500);
        let key = FeeKey::new(token(1), token(2), token(3));

        let mut ids = FeeIds::default();
        ids.remember(&fee(None, dec!(0.98)), 42);
        // inserted but not yet committed
        assert_eq!(calc.fee_for(&key).unwrap().id, None);

        assert_eq!(ids.apply(&mut calc), 1);
        assert_eq!(calc.fee_for(&key).unwrap().id, Some(42));
        // already persisted
        assert_eq!(ids.apply(&mut calc), 0);
    }

    #[test]
    fn test_failed_block_restores_fee_model() {
        let mut calc = FeeTransferCalculator::new();
        let checkpoint = calc.checkpoint();
        calc.propose(token(1), token(2), token(3), dec!(0.98), true);
        calc.commit_proposals(500);
        let mut ids = FeeIds::default();
        ids.remember(&fee(None, dec!(0.98)), 42);

        // the block's transaction never committed
        calc.restore(checkpoint);
        assert_eq!(ids.apply(&mut calc), 0);
        assert_eq!(calc.fee_for(&FeeKey::new(token(1), token(2), token(3))), None);
        assert!(!calc.has_fee(&token(1)));
    }

    #[test]
    fn test_block_results_count() {
        let mut results = BlockResults::default();
        assert!(results.is_empty());
        results.fail(1, "No arbitrage after fee".to_string());
        results.succeed(
            2,
            ShootSuccess {
                amount_in: U256::from(10u64),
                profit: U256::from(1u64),
                gas: 100_000,
                fees_used: vec![],
            },
        );
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_progress_marks() {
        assert_eq!(progress_marks(100), [20, 40, 60, 80]);
        assert_eq!(progress_marks(3), [0, 1, 1, 2]);
    }

    #[test]
    fn test_liquidity_errors_are_recognized() {
        let report: eyre::Report = RelayError::NotEnoughLiquidity {
            exchange: token(10),
            excess: U256::from(1u64),
        }
        .into();
        assert!(is_not_enough_liquidity(&report));
        assert!(!is_not_enough_liquidity(&eyre!("other")));
    }

    fn database_url() -> String {
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for store tests")
    }

    #[tokio::test]
    #[ignore = "requires postgres with the upstream candidate tables"]
    async fn test_rolled_back_fee_insert_leaves_calculator_unassigned() {
        let store = Store::connect_lazy(&database_url()).unwrap();
        store.setup_schema().await.unwrap();
        let known: Vec<u8> = sqlx::query_scalar("SELECT address FROM tokens LIMIT 1")
            .fetch_one(store.pool())
            .await
            .unwrap();
        let known = store::address_from_bytes(&known).unwrap();
        let mut calc = FeeTransferCalculator::new();
        calc.propose(known, token(2), token(3), dec!(0.98), true);
        let committed = calc.commit_proposals(500);
        let key = FeeKey::new(known, token(2), token(3));

        let mut tx = store.begin().await.unwrap();
        let mut ids = FeeIds::default();
        let resolved = ids.resolve(&mut tx, &committed, 500).await.unwrap();
        assert_eq!(resolved.len(), 1);
        tx.rollback().await.unwrap();

        assert_eq!(calc.fee_for(&key).unwrap().id, None);
    }
}
