//! Snapshot, attempt, diagnose, retry
//!
//! Every attempt runs between `evm_snapshot` and `evm_revert`, so attempts never see
//! each other's side effects. A hidden transfer fee is the only recoverable
//! diagnosis: the fee is proposed, the input re-solved and the relay tried again.

use alloy::primitives::{Address, I256, U256};
use eyre::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use tracing::{debug, error, info};

use super::diagnosis::{diagnose, Diagnosis};
use super::plan::{approve_calldata, plan_transfers};
use crate::arbitrage::FoundArbitrage;
use crate::config::{APPROVAL_GAS_LIMIT, RELAY_GAS_LIMIT, WETH};
use crate::error::RelayError;
use crate::fee_transfer::{FeeKey, FeeTransferCalculator, TokenFee};
use crate::sandbox::SandboxRpc;
use crate::solver::ArbitrageSolver;

/// Later inferences for the same transfer are nudged below every earlier one
const FEE_NUDGE: Decimal = dec!(0.00001);

/// Fee rounds before an attempt is given up as non-converging
const MAX_FEE_ROUNDS: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct ShootSuccess {
    pub amount_in: U256,
    pub profit: U256,
    pub gas: u64,
    pub fees_used: Vec<TokenFee>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShootOutcome {
    Success(ShootSuccess),
    Failed(Diagnosis),
}

enum Attempt {
    Done(ShootOutcome),
    ProposedFee,
}

/// Relay `fa` in `sandbox` until it succeeds or fails for a reason other than a hidden fee
pub async fn shoot(
    sandbox: &dyn SandboxRpc,
    solver: &dyn ArbitrageSolver,
    fa: &FoundArbitrage,
    fees: &mut FeeTransferCalculator,
    timestamp: Option<u64>,
    mut must_recompute: bool,
    candidate_id: i64,
) -> Result<ShootOutcome> {
    let mut fa = fa.clone();
    let mut inferred: HashMap<FeeKey, Vec<Decimal>> = HashMap::new();

    for round in 0..MAX_FEE_ROUNDS {
        let snapshot = sandbox.snapshot().await?;
        let attempt = attempt(
            sandbox,
            solver,
            &mut fa,
            fees,
            &mut inferred,
            timestamp,
            must_recompute,
            candidate_id,
        )
        .await;
        if !sandbox.revert(snapshot).await? {
            return Err(RelayError::SnapshotRevertFailed(snapshot).into());
        }
        match attempt? {
            Attempt::Done(outcome) => return Ok(outcome),
            Attempt::ProposedFee => {
                debug!(candidate_id, round, "Retrying with proposed transfer fee");
                must_recompute = true;
            }
        }
    }
    Ok(ShootOutcome::Failed(Diagnosis::Other {
        reason: "transfer fee inference did not converge".to_string(),
    }))
}

/// Rate to propose after observing `observed`, given earlier inferences for the same transfer
pub fn next_fee_proposal(history: &[Decimal], observed: Decimal) -> Decimal {
    match history.iter().copied().min() {
        None => observed,
        Some(lowest) => lowest.min(observed) - FEE_NUDGE,
    }
}

#[allow(clippy::too_many_arguments)]
async fn attempt(
    sandbox: &dyn SandboxRpc,
    solver: &dyn ArbitrageSolver,
    fa: &mut FoundArbitrage,
    fees: &mut FeeTransferCalculator,
    inferred: &mut HashMap<FeeKey, Vec<Decimal>>,
    timestamp: Option<u64>,
    must_recompute: bool,
    candidate_id: i64,
) -> Result<Attempt> {
    let relayer = sandbox.relayer();
    let block = sandbox.block_number().await?;

    if must_recompute {
        match solver
            .solve(&fa.pricing_circuit(), block, timestamp, &*fees, relayer)
            .await?
        {
            Some(found) => *fa = found,
            None => return Ok(Attempt::Done(ShootOutcome::Failed(Diagnosis::NoArbitrageAfterFee))),
        }
    }

    let plan = plan_transfers(fa, relayer, &*fees, block, timestamp).await?;
    let before = relayer_weth(sandbox, relayer, block).await?;
    for (spender, token) in &plan.approvals {
        let hash = sandbox
            .send_transaction(relayer, approve_calldata(*token, *spender), APPROVAL_GAS_LIMIT)
            .await?;
        if !sandbox.receipt(hash).await?.status {
            return Ok(Attempt::Done(ShootOutcome::Failed(Diagnosis::BrokenToken {
                token: *token,
                reason: "failed to send approval".to_string(),
            })));
        }
    }

    sandbox.set_automine(false).await?;
    let mined = match sandbox
        .send_transaction(relayer, plan.relay_calldata(), RELAY_GAS_LIMIT)
        .await
    {
        Ok(hash) => sandbox.mine(timestamp).await.map(|_| hash),
        Err(e) => Err(e),
    };
    sandbox.set_automine(true).await?;
    let receipt = sandbox.receipt(mined?).await?;

    if !receipt.status {
        let diagnosis = diagnose(sandbox, fa, &*fees, &receipt, timestamp, candidate_id).await?;
        debug!(candidate_id, %diagnosis, gas = receipt.gas_used, "Relay failed");
        return Ok(match diagnosis {
            Diagnosis::FeeOnTransfer {
                token,
                from,
                to,
                fee,
                round_down,
            } => {
                let history = inferred.entry(FeeKey::new(token, from, to)).or_default();
                let proposal = next_fee_proposal(history, fee);
                history.push(fee);
                info!(candidate_id, %token, %from, %to, %fee, %proposal, "Proposing transfer fee");
                fees.propose(token, from, to, proposal, round_down);
                Attempt::ProposedFee
            }
            d @ (Diagnosis::BrokenToken { .. }
            | Diagnosis::BadExchange { .. }
            | Diagnosis::ExchangeInterference { .. }
            | Diagnosis::IncompatibleToken { .. }
            | Diagnosis::NoArbitrageAfterFee
            | Diagnosis::Other { .. }) => Attempt::Done(ShootOutcome::Failed(d)),
        });
    }

    let after = relayer_weth(sandbox, relayer, receipt.block_number).await?;
    if after < before {
        let profit = I256::from_raw(after) - I256::from_raw(before);
        error!(candidate_id, %profit, tx = %receipt.tx_hash, "Relay succeeded at a loss");
        return Err(RelayError::NegativeProfit { candidate_id, profit }.into());
    }

    let exchanges: Vec<Address> = fa.exchanges();
    Ok(Attempt::Done(ShootOutcome::Success(ShootSuccess {
        amount_in: fa.amount_in,
        profit: after - before,
        gas: receipt.gas_used,
        fees_used: fees.fees_used(&exchanges, &fa.directions),
    })))
}

async fn relayer_weth(sandbox: &dyn SandboxRpc, relayer: Address, block: u64) -> Result<U256> {
    Ok(sandbox
        .balance_of(WETH, relayer, block)
        .await?
        .ok_or_else(|| RelayError::Sandbox("WETH balanceOf reverted".to_string()))?)
}
