//! Failure classification for relay attempts
//!
//! A failed relay is replayed from its call trace against the transfers the plan
//! expected. Checks run in a fixed order and the first one that matches decides the
//! outcome:
//!
//! - gas ceiling
//! - sender balances before the attempt
//! - protocol revert signatures outside token code
//! - token transfers: amount, revert, `false` return, Balancer V1 compatibility
//! - calls back into a Uniswap V2 pool from inside token code
//! - `balanceOf` replay for hidden transfer fees
//!
//! A failure no check explains is an error, never a guess.

use alloy::primitives::{Address, U256};
use eyre::{eyre, Result};
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use super::plan::{plan_transfers, TransferPlan};
use super::trace::{decode_token_call, CallFrame, TokenCall};
use crate::arbitrage::FoundArbitrage;
use crate::config::{DIAGNOSIS_GAS_CEILING, WETH};
use crate::error::RelayError;
use crate::fee_transfer::{infer_fee_rate, TransferFeeModel};
use crate::pricers::{token_holder, ExchangePricer, PricerKind};
use crate::sandbox::{RelayReceipt, SandboxRpc};

const BALANCER_V1_MATH_APPROX: &str = "ERR_MATH_APPROX";
const UNISWAP_V2_OVERFLOW: &str = "UniswapV2: OVERFLOW";

/// Why a relay attempt failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnosis {
    BrokenToken { token: Address, reason: String },
    BadExchange { exchange: Address, reason: String },
    /// A transfer of `token` calls back into `exchange`
    ExchangeInterference { token: Address, exchange: Address },
    /// `exchange` cannot move `token` (no boolean return, or a revert under Balancer V1)
    IncompatibleToken { exchange: Address, token: Address },
    /// Transfers of `token` from `from` to `to` deliver `fee` of the amount sent
    FeeOnTransfer {
        token: Address,
        from: Address,
        to: Address,
        fee: Decimal,
        round_down: bool,
    },
    NoArbitrageAfterFee,
    Other { reason: String },
}

impl Diagnosis {
    /// Failure label stored with per-block relay results
    pub fn relay_label(&self) -> String {
        match self {
            Diagnosis::BrokenToken { token, .. } => format!("Broken token: {token}"),
            Diagnosis::BadExchange { exchange, .. } => format!("Bad exchange: {exchange}"),
            Diagnosis::ExchangeInterference { .. } => "token-exchange interference".to_string(),
            Diagnosis::IncompatibleToken { exchange, token } => format!("incompatible token {token} / {exchange}"),
            Diagnosis::FeeOnTransfer { token, .. } => format!("Fee on transfer: {token}"),
            Diagnosis::NoArbitrageAfterFee => "No arbitrage after fee".to_string(),
            Diagnosis::Other { reason } => format!("Other {reason}"),
        }
    }

    /// Failure label stored with campaign attempts
    pub fn campaign_label(&self) -> String {
        match self {
            Diagnosis::IncompatibleToken { token, .. } => format!("incompatible token {token}"),
            Diagnosis::Other { .. } => "Other failure".to_string(),
            _ => self.relay_label(),
        }
    }

    fn broken(token: Address, reason: &str) -> Self {
        Diagnosis::BrokenToken {
            token,
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnosis::BrokenToken { token, reason } => write!(f, "broken token {token}: {reason}"),
            Diagnosis::BadExchange { exchange, reason } => write!(f, "bad exchange {exchange}: {reason}"),
            Diagnosis::ExchangeInterference { token, exchange } => {
                write!(f, "token {token} interferes with {exchange}")
            }
            Diagnosis::IncompatibleToken { exchange, token } => {
                write!(f, "token {token} incompatible with {exchange}")
            }
            Diagnosis::FeeOnTransfer {
                token,
                from,
                to,
                fee,
                round_down,
            } => write!(f, "fee on transfer {token} {from} -> {to}: {fee} (round down {round_down})"),
            Diagnosis::NoArbitrageAfterFee => write!(f, "no arbitrage after fee"),
            Diagnosis::Other { reason } => write!(f, "{reason}"),
        }
    }
}

/// Circuit facts the trace checks look up by address
struct CircuitView {
    by_holder: HashMap<Address, Arc<dyn ExchangePricer>>,
    uniswap_v2: HashSet<Address>,
    balancer_v1: HashSet<Address>,
    /// Tokens whose code is treated as opaque; WETH is trusted
    tokens: HashSet<Address>,
}

impl CircuitView {
    fn new(fa: &FoundArbitrage) -> Self {
        let of_kind = |kind: PricerKind| {
            fa.circuit
                .iter()
                .filter(|p| p.kind() == kind)
                .map(|p| p.address())
                .collect::<HashSet<_>>()
        };
        Self {
            by_holder: fa.circuit.iter().map(|p| (token_holder(p), p.clone())).collect(),
            uniswap_v2: of_kind(PricerKind::UniswapV2),
            balancer_v1: of_kind(PricerKind::BalancerV1),
            tokens: fa
                .directions
                .iter()
                .map(|(t, _)| *t)
                .filter(|t| *t != WETH)
                .collect(),
        }
    }

    fn is_token_call(&self, frame: &CallFrame) -> bool {
        frame.callee().is_some_and(|c| self.tokens.contains(&c))
    }

    /// Uniswap V2 pool whose reserves should match its real balance of `token`
    fn uniswap_v2_holder(&self, holder: &Address) -> Option<&Arc<dyn ExchangePricer>> {
        self.by_holder
            .get(holder)
            .filter(|p| p.kind() == PricerKind::UniswapV2)
    }
}

/// Classify a failed relay mined in `receipt`
pub async fn diagnose(
    sandbox: &dyn SandboxRpc,
    fa: &FoundArbitrage,
    fees: &dyn TransferFeeModel,
    receipt: &RelayReceipt,
    timestamp: Option<u64>,
    candidate_id: i64,
) -> Result<Diagnosis> {
    if receipt.gas_used > DIAGNOSIS_GAS_CEILING {
        return Ok(Diagnosis::Other {
            reason: "too much gas".to_string(),
        });
    }

    let relayer = sandbox.relayer();
    let prior_block = receipt.block_number.saturating_sub(1);
    let plan = plan_transfers(fa, relayer, fees, prior_block, timestamp).await?;
    let view = CircuitView::new(fa);

    let mut priors: HashMap<(Address, Address), U256> = HashMap::new();
    if let Some(d) = check_senders(sandbox, &plan, &view, relayer, prior_block, &mut priors).await? {
        return Ok(d);
    }

    let trace = sandbox.trace_transaction(receipt.tx_hash).await?;
    let (transfers, recipients) = match check_calls(&trace, &plan, &view)? {
        CallScan::Diagnosed(d) => return Ok(d),
        CallScan::Clean { transfers, recipients } => (transfers, recipients),
    };

    if let Some(d) = check_interference(&transfers, &view) {
        return Ok(d);
    }

    if let Some(d) = check_recipients(sandbox, &recipients, &view, prior_block, &mut priors).await? {
        return Ok(d);
    }

    if let Some(d) = replay_balances(&trace, &view, fees, &priors)? {
        return Ok(d);
    }

    debug!(candidate_id, tx = %receipt.tx_hash, "No diagnosis rule matched");
    Err(RelayError::Undiagnosable {
        candidate_id,
        tx_hash: receipt.tx_hash,
    }
    .into())
}

/// Every expected sender must be able to cover what it is asked to send
async fn check_senders(
    sandbox: &dyn SandboxRpc,
    plan: &TransferPlan,
    view: &CircuitView,
    relayer: Address,
    prior_block: u64,
    priors: &mut HashMap<(Address, Address), U256>,
) -> Result<Option<Diagnosis>> {
    for ((sender, token), expected) in &plan.expected {
        let Some(balance) = sandbox.balance_of(*token, *sender, prior_block).await? else {
            return Ok(Some(Diagnosis::broken(*token, "balanceOf query reverts")));
        };
        priors.insert((*sender, *token), balance);
        if *sender == relayer {
            continue;
        }
        if let Some(pool) = view.uniswap_v2_holder(sender) {
            let locked = pool.locked_value(*token, prior_block).await?;
            if locked > balance {
                debug!(pool = %sender, %token, %locked, %balance, "Reserve above real balance");
                return Ok(Some(Diagnosis::broken(*token, "Unexpected balance decrease")));
            }
        }
        if expected.sent >= balance {
            return Ok(Some(Diagnosis::broken(*token, "Balance mismatch, need too much out")));
        }
    }
    Ok(None)
}

enum CallScan<'a> {
    Diagnosed(Diagnosis),
    Clean {
        /// `(token, frame)` for every successful transfer of a tracked token
        transfers: Vec<(Address, &'a CallFrame)>,
        recipients: BTreeSet<(Address, Address)>,
    },
}

/// Walk the trace without entering token code, checking protocol reverts and every token transfer
fn check_calls<'a>(trace: &'a CallFrame, plan: &TransferPlan, view: &CircuitView) -> Result<CallScan<'a>> {
    let mut transfers = Vec::new();
    let mut recipients = BTreeSet::new();

    for frame in trace.walk(|f| !view.is_token_call(f)) {
        let Some(callee) = frame.callee() else { continue };
        let message = frame.revert_message();

        if view.balancer_v1.contains(&callee) && message.as_deref() == Some(BALANCER_V1_MATH_APPROX) {
            return Ok(CallScan::Diagnosed(Diagnosis::Other {
                reason: format!("Balancer v1: {BALANCER_V1_MATH_APPROX}"),
            }));
        }
        if view.uniswap_v2.contains(&callee) && message.as_deref() == Some(UNISWAP_V2_OVERFLOW) {
            return Ok(CallScan::Diagnosed(Diagnosis::BadExchange {
                exchange: callee,
                reason: UNISWAP_V2_OVERFLOW.to_string(),
            }));
        }

        if !view.tokens.contains(&callee) {
            continue;
        }
        let Some(TokenCall::Transfer { from, to, amount }) = decode_token_call(frame) else {
            continue;
        };
        if view.balancer_v1.contains(&frame.from) && (frame.reverted() || frame.returned_data().is_none()) {
            return Ok(CallScan::Diagnosed(Diagnosis::IncompatibleToken {
                exchange: frame.from,
                token: callee,
            }));
        }
        let expected = plan
            .expected
            .get(&(from, callee))
            .ok_or_else(|| eyre!("unexpected transfer of {callee} from {from}"))?;
        if amount < expected.sent {
            return Err(eyre!(
                "transfer of {callee} from {from} sent {amount}, expected at least {}",
                expected.sent
            ));
        }
        if frame.reverted() || frame.returned_false() {
            return Ok(CallScan::Diagnosed(Diagnosis::broken(callee, "token reverts on transfer")));
        }
        transfers.push((callee, frame));
        recipients.insert((to, callee));
    }
    Ok(CallScan::Clean { transfers, recipients })
}

/// A token transfer must not call back into a Uniswap V2 pool of the circuit
fn check_interference(transfers: &[(Address, &CallFrame)], view: &CircuitView) -> Option<Diagnosis> {
    for (token, frame) in transfers {
        for nested in frame.walk(|_| true).into_iter().skip(1) {
            if let Some(exchange) = nested.callee().filter(|c| view.uniswap_v2.contains(c)) {
                return Some(Diagnosis::ExchangeInterference { token: *token, exchange });
            }
        }
    }
    None
}

async fn check_recipients(
    sandbox: &dyn SandboxRpc,
    recipients: &BTreeSet<(Address, Address)>,
    view: &CircuitView,
    prior_block: u64,
    priors: &mut HashMap<(Address, Address), U256>,
) -> Result<Option<Diagnosis>> {
    for (owner, token) in recipients {
        let Some(balance) = sandbox.balance_of(*token, *owner, prior_block).await? else {
            return Ok(Some(Diagnosis::broken(*token, "balanceOf query reverts")));
        };
        priors.insert((*owner, *token), balance);
        if let Some(pool) = view.uniswap_v2_holder(owner) {
            let locked = pool.locked_value(*token, prior_block).await?;
            if locked != balance {
                warn!(pool = %owner, %token, %locked, %balance, "Reserve and balance differ before relay");
            }
            if balance < locked {
                return Ok(Some(Diagnosis::broken(*token, "Unexpected balance decrease")));
            }
        }
    }
    Ok(None)
}

/// Running view of one `(owner, token)` balance between two `balanceOf` observations
#[derive(Debug, Default)]
struct Ledger {
    sent: U256,
    expected_received: U256,
    attempted: U256,
    received_from: Option<Address>,
}

/// Replay transfers and `balanceOf` results in execution order, inferring a hidden
/// fee from the first observation that comes up short
fn replay_balances(
    trace: &CallFrame,
    view: &CircuitView,
    fees: &dyn TransferFeeModel,
    priors: &HashMap<(Address, Address), U256>,
) -> Result<Option<Diagnosis>> {
    let mut known = priors.clone();
    let mut ledgers: HashMap<(Address, Address), Ledger> = HashMap::new();

    for frame in trace.walk(|_| true) {
        if !view.is_token_call(frame) {
            continue;
        }
        let token = frame.callee().unwrap_or_default();
        match decode_token_call(frame) {
            Some(TokenCall::Transfer { from, to, amount }) if !frame.reverted() => {
                ledgers.entry((from, token)).or_default().sent += amount;
                let into = ledgers.entry((to, token)).or_default();
                into.expected_received += fees.out_from_transfer(token, from, to, amount);
                into.attempted += amount;
                into.received_from = Some(from);
            }
            Some(TokenCall::BalanceOf { owner }) => {
                if frame.reverted() {
                    return Ok(Some(Diagnosis::broken(token, "balanceOf reverts")));
                }
                let Some(observed) = frame.returned_word() else { continue };
                let Some(prior) = known.get(&(owner, token)).copied() else { continue };
                let ledger = ledgers.remove(&(owner, token)).unwrap_or_default();

                let Some(floor) = prior.checked_sub(ledger.sent) else {
                    return Err(eyre!("{owner} sent more {token} than it held"));
                };
                if observed < floor {
                    return Ok(Some(Diagnosis::broken(token, "Balance decreased too much on transfer out")));
                }
                if !ledger.attempted.is_zero() {
                    let received = observed - floor;
                    if received * U256::from(10u8) > ledger.expected_received * U256::from(11u8) {
                        warn!(%owner, %token, %received, expected = %ledger.expected_received, "Received well above expectation");
                    }
                    if received < ledger.expected_received {
                        let (fee, round_down) = infer_fee_rate(received, ledger.attempted)?;
                        return Ok(Some(Diagnosis::FeeOnTransfer {
                            token,
                            from: ledger.received_from.unwrap_or_default(),
                            to: owner,
                            fee,
                            round_down,
                        }));
                    }
                }
                known.insert((owner, token), observed);
            }
            _ => {}
        }
    }
    Ok(None)
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A two-pool Uniswap V2 circuit and the trace of its relay
    use super::*;
    use crate::config::relayer_weth_float;
    use crate::pricers::test_support::{offline_provider, token};
    use crate::pricers::UniswapV2Pricer;
    use crate::sandbox::test_support::FakeSandbox;
    use crate::simulation::trace::test_support::*;

    pub const FEE_TOKEN: u8 = 1;
    pub const POOL_A: u8 = 10;
    pub const POOL_B: u8 = 11;
    pub const RELAYER: u8 = 50;
    pub const ACCOUNT: u8 = 60;

    /// WETH -> T on A (1e6 WETH / 2e6 T), T -> WETH on B (1e6 / 1e6), 1000 WETH in.
    /// Without fees A sends 1992 T and B returns 1982 WETH.
    pub fn two_pool_arbitrage() -> FoundArbitrage {
        let a = UniswapV2Pricer::new(offline_provider(), token(POOL_A), WETH, token(FEE_TOKEN))
            .with_reserves(U256::from(1_000_000u64), U256::from(2_000_000u64));
        let b = UniswapV2Pricer::new(offline_provider(), token(POOL_B), WETH, token(FEE_TOKEN))
            .with_reserves(U256::from(1_000_000u64), U256::from(1_000_000u64));
        FoundArbitrage {
            circuit: vec![Arc::new(a), Arc::new(b)],
            directions: vec![(WETH, token(FEE_TOKEN)), (token(FEE_TOKEN), WETH)],
            pivot: WETH,
            amount_in: U256::from(1000u64),
            profit: U256::ZERO,
        }
    }

    /// Balances before the relay that match the pools' reserves
    pub fn fund(sandbox: &FakeSandbox) {
        let t = token(FEE_TOKEN);
        sandbox.set_balance(WETH, token(RELAYER), Some(relayer_weth_float()));
        sandbox.set_balance(t, token(POOL_A), Some(U256::from(2_000_000u64)));
        sandbox.set_balance(WETH, token(POOL_B), Some(U256::from(1_000_000u64)));
        sandbox.set_balance(t, token(POOL_B), Some(U256::from(1_000_000u64)));
    }

    /// Relay trace where pool B sees `b_received` of the 1992 T sent by A, then reverts
    pub fn relay_trace(b_received: u64) -> CallFrame {
        let (t, a, b, relayer) = (token(FEE_TOKEN), token(POOL_A), token(POOL_B), token(RELAYER));
        let a_swap = frame(
            relayer,
            a,
            vec![],
            vec![
                returning(frame(a, t, transfer_input(b, U256::from(1992u64)), vec![]), U256::from(1u8)),
                returning(frame(a, t, balance_of_input(a), vec![]), U256::from(2_000_000u64 - 1992)),
            ],
        );
        let b_swap = reverting(
            frame(
                relayer,
                b,
                vec![],
                vec![
                    frame(b, WETH, transfer_input(relayer, U256::from(1982u64)), vec![]),
                    returning(frame(b, t, balance_of_input(b), vec![]), U256::from(1_000_000 + b_received)),
                ],
            ),
            "UniswapV2: K",
        );
        reverting(
            frame(
                token(ACCOUNT),
                relayer,
                vec![],
                vec![frame(relayer, WETH, transfer_input(a, U256::from(1000u64)), vec![]), a_swap, b_swap],
            ),
            "UniswapV2: K",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::fee_transfer::{apply_rate, NoTransferFees};
    use crate::pricers::test_support::token;
    use crate::sandbox::test_support::FakeSandbox;
    use crate::simulation::trace::test_support::*;
    use alloy::primitives::B256;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn failed_receipt(gas_used: u64) -> RelayReceipt {
        RelayReceipt {
            tx_hash: B256::with_last_byte(1),
            status: false,
            gas_used,
            block_number: 101,
        }
    }

    fn sandbox_with(trace: CallFrame) -> FakeSandbox {
        let sandbox = FakeSandbox::new(token(RELAYER), 100);
        fund(&sandbox);
        *sandbox.trace.lock() = trace;
        sandbox
    }

    async fn run(sandbox: &FakeSandbox, receipt: RelayReceipt) -> Result<Diagnosis> {
        diagnose(sandbox, &two_pool_arbitrage(), &NoTransferFees, &receipt, None, 7).await
    }

    #[tokio::test]
    async fn test_gas_ceiling_skips_trace() {
        let sandbox = FakeSandbox::new(token(RELAYER), 100);
        let d = run(&sandbox, failed_receipt(DIAGNOSIS_GAS_CEILING + 1)).await.unwrap();
        assert_eq!(d, Diagnosis::Other { reason: "too much gas".to_string() });
        assert_eq!(d.relay_label(), "Other too much gas");
        assert_eq!(d.campaign_label(), "Other failure");
    }

    #[tokio::test]
    async fn test_hidden_fee_is_inferred() {
        // 1952 of 1992 arrive: 0.97992, reproduced by flooring
        let sandbox = sandbox_with(relay_trace(1952));
        let d = run(&sandbox, failed_receipt(200_000)).await.unwrap();
        assert_eq!(
            d,
            Diagnosis::FeeOnTransfer {
                token: token(FEE_TOKEN),
                from: token(POOL_A),
                to: token(POOL_B),
                fee: dec!(0.97992),
                round_down: true,
            }
        );
        assert_eq!(apply_rate(U256::from(1992u64), dec!(0.97992), true), U256::from(1952u64));
    }

    #[tokio::test]
    async fn test_reverting_balance_query_breaks_token() {
        let sandbox = sandbox_with(relay_trace(1952));
        sandbox.set_balance(token(FEE_TOKEN), token(POOL_A), None);
        let d = run(&sandbox, failed_receipt(200_000)).await.unwrap();
        assert_eq!(d, Diagnosis::broken(token(FEE_TOKEN), "balanceOf query reverts"));
        assert_eq!(d.relay_label(), format!("Broken token: {}", token(FEE_TOKEN)));
    }

    #[tokio::test]
    async fn test_reserve_above_balance_breaks_token() {
        let sandbox = sandbox_with(relay_trace(1952));
        sandbox.set_balance(token(FEE_TOKEN), token(POOL_A), Some(U256::from(1_500_000u64)));
        let d = run(&sandbox, failed_receipt(200_000)).await.unwrap();
        assert_eq!(d, Diagnosis::broken(token(FEE_TOKEN), "Unexpected balance decrease"));
    }

    #[tokio::test]
    async fn test_false_return_breaks_token() {
        let (t, a, b, relayer) = (token(FEE_TOKEN), token(POOL_A), token(POOL_B), token(RELAYER));
        let trace = frame(
            token(ACCOUNT),
            relayer,
            vec![],
            vec![frame(
                relayer,
                a,
                vec![],
                vec![returning(frame(a, t, transfer_input(b, U256::from(1992u64)), vec![]), U256::ZERO)],
            )],
        );
        let d = run(&sandbox_with(trace), failed_receipt(200_000)).await.unwrap();
        assert_eq!(d, Diagnosis::broken(t, "token reverts on transfer"));
    }

    #[tokio::test]
    async fn test_overflow_is_bad_exchange() {
        let relayer = token(RELAYER);
        let trace = frame(
            token(ACCOUNT),
            relayer,
            vec![],
            vec![reverting(frame(relayer, token(POOL_B), vec![], vec![]), "UniswapV2: OVERFLOW")],
        );
        let d = run(&sandbox_with(trace), failed_receipt(200_000)).await.unwrap();
        assert_eq!(
            d,
            Diagnosis::BadExchange { exchange: token(POOL_B), reason: "UniswapV2: OVERFLOW".to_string() }
        );
        assert_eq!(d.relay_label(), format!("Bad exchange: {}", token(POOL_B)));
    }

    #[tokio::test]
    async fn test_callback_into_pool_is_interference() {
        let (t, a, b, relayer) = (token(FEE_TOKEN), token(POOL_A), token(POOL_B), token(RELAYER));
        let sneaky = returning(
            frame(a, t, transfer_input(b, U256::from(1992u64)), vec![frame(t, b, vec![], vec![])]),
            U256::from(1u8),
        );
        let trace = frame(token(ACCOUNT), relayer, vec![], vec![frame(relayer, a, vec![], vec![sneaky])]);
        let d = run(&sandbox_with(trace), failed_receipt(200_000)).await.unwrap();
        assert_eq!(d, Diagnosis::ExchangeInterference { token: t, exchange: b });
        assert_eq!(d.relay_label(), "token-exchange interference");
    }

    #[tokio::test]
    async fn test_short_transfer_is_an_error() {
        let (t, a, b, relayer) = (token(FEE_TOKEN), token(POOL_A), token(POOL_B), token(RELAYER));
        let trace = frame(
            token(ACCOUNT),
            relayer,
            vec![],
            vec![frame(
                relayer,
                a,
                vec![],
                vec![returning(frame(a, t, transfer_input(b, U256::from(10u64)), vec![]), U256::from(1u8))],
            )],
        );
        assert!(run(&sandbox_with(trace), failed_receipt(200_000)).await.is_err());
    }

    #[tokio::test]
    async fn test_unexplained_failure_is_undiagnosable() {
        let sandbox = sandbox_with(relay_trace(1992));
        let err = run(&sandbox, failed_receipt(200_000)).await.unwrap_err();
        assert!(matches!(
            RelayError::from_report(&err),
            Some(RelayError::Undiagnosable { candidate_id: 7, .. })
        ));
    }

    #[test]
    fn test_incompatible_labels() {
        let d = Diagnosis::IncompatibleToken { exchange: token(12), token: token(1) };
        assert_eq!(d.relay_label(), format!("incompatible token {} / {}", token(1), token(12)));
        assert_eq!(d.campaign_label(), format!("incompatible token {}", token(1)));
        assert_eq!(Diagnosis::NoArbitrageAfterFee.relay_label(), "No arbitrage after fee");
    }
}
