//! Fee-on-transfer model
//!
//! Some tokens deduct a fee on `transfer` that no pricer can see. Fees are keyed by
//! `(token, from, to)` and live in two layers: proposals made while adapting a single
//! candidate, and committed records synced from the store or promoted after a success.
//! A proposal always shadows the committed record with the same key.

use alloy::primitives::{Address, U256};
use chrono::{NaiveDateTime, TimeDelta, Utc};
use eyre::{eyre, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::BALANCER_V2_VAULT;
use crate::pricers::{ExchangePricer, PricerKind};
use crate::store::Store;

/// Decimal places kept when inferring a fee rate from one observed transfer
pub const FEE_RATE_PRECISION: u32 = 5;

/// Inferred rates above this are treated as a broken observation
const MAX_FEE_RATE: Decimal = dec!(2);

/// A committed layer older than this is replaced by a full nearest-block pull
const FULL_RESYNC_AFTER_DAYS: i64 = 100;

/// Output amount of a token transfer, given the nominal amount sent
pub trait TransferFeeModel: Send + Sync {
    fn out_from_transfer(&self, token: Address, from: Address, to: Address, amount: U256) -> U256;
}

/// Every transfer delivers exactly what was sent
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransferFees;

impl TransferFeeModel for NoTransferFees {
    fn out_from_transfer(&self, _token: Address, _from: Address, _to: Address, amount: U256) -> U256 {
        amount
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeeKey {
    pub token: Address,
    pub from: Address,
    pub to: Address,
}

impl FeeKey {
    pub fn new(token: Address, from: Address, to: Address) -> Self {
        Self { token, from, to }
    }
}

/// A fee ratio observed for transfers of `token` from `from` to `to`
#[derive(Debug, Clone, PartialEq)]
pub struct TokenFee {
    /// Row id once persisted
    pub id: Option<i64>,
    pub token: Address,
    pub from: Address,
    pub to: Address,
    /// Fraction of the sent amount that arrives (0.98 = 2% fee)
    pub fee: Decimal,
    pub round_down: bool,
    /// Block the fee was inferred at; `None` while only proposed
    pub block_number: Option<u64>,
    pub updated_on: NaiveDateTime,
}

impl TokenFee {
    pub fn key(&self) -> FeeKey {
        FeeKey::new(self.token, self.from, self.to)
    }

    /// `amount * fee`, floored or ceiled per the recorded rounding direction
    pub fn apply(&self, amount: U256) -> U256 {
        apply_rate(amount, self.fee, self.round_down)
    }
}

/// Exact `amount * rate` over the decimal's mantissa and scale
pub fn apply_rate(amount: U256, rate: Decimal, round_down: bool) -> U256 {
    if rate.is_sign_negative() || rate.is_zero() {
        return U256::ZERO;
    }
    let mantissa = U256::from(rate.mantissa().unsigned_abs());
    let scale = U256::from(10u64).pow(U256::from(rate.scale()));
    let (quotient, remainder) = amount.saturating_mul(mantissa).div_rem(scale);
    if round_down || remainder.is_zero() {
        quotient
    } else {
        quotient + U256::from(1u8)
    }
}

/// Infer `(fee_rate, round_down)` from a transfer of `attempted` that delivered `received`.
///
/// The ratio is rounded half-to-even to [`FEE_RATE_PRECISION`] places; the rounding direction is
/// whichever reproduces `received` exactly, preferring floor when both or neither do.
pub fn infer_fee_rate(received: U256, attempted: U256) -> Result<(Decimal, bool)> {
    if attempted.is_zero() {
        return Err(eyre!("cannot infer a fee rate from a zero-amount transfer"));
    }
    let unit = U256::from(10u64).pow(U256::from(FEE_RATE_PRECISION));
    let (mut scaled, remainder) = received
        .checked_mul(unit)
        .ok_or_else(|| eyre!("received amount {received} too large to infer a fee rate"))?
        .div_rem(attempted);
    let twice = remainder * U256::from(2u8);
    if twice > attempted || (twice == attempted && scaled.bit(0)) {
        scaled += U256::from(1u8);
    }
    if scaled > U256::from(i64::MAX as u64) {
        return Err(eyre!("fee rate too big: {received} / {attempted}"));
    }
    let rate = Decimal::new(scaled.to::<u64>() as i64, FEE_RATE_PRECISION);
    if rate > MAX_FEE_RATE {
        return Err(eyre!("fee rate too big: {rate}"));
    }

    let round_down = if apply_rate(attempted, rate, true) == received {
        true
    } else if apply_rate(attempted, rate, false) == received {
        false
    } else {
        warn!(%received, %attempted, %rate, "Fee rate does not reproduce the transfer exactly, assuming round down");
        true
    };
    Ok((rate, round_down))
}

/// Committed fee state saved by [`FeeTransferCalculator::checkpoint`]
#[derive(Debug, Clone)]
pub struct FeeCheckpoint {
    last_updated: Option<NaiveDateTime>,
    committed: HashMap<FeeKey, TokenFee>,
    tokens_with_fee: HashSet<Address>,
}

/// Two-layer fee model with aliasing and relay-hop decomposition
#[derive(Debug, Default)]
pub struct FeeTransferCalculator {
    last_updated: Option<NaiveDateTime>,
    committed: HashMap<FeeKey, TokenFee>,
    proposed: HashMap<FeeKey, TokenFee>,
    tokens_with_fee: HashSet<Address>,
    proposed_tokens_with_fee: HashSet<Address>,
    aliases: HashMap<Address, Address>,
    /// `(from, to) -> via` for transfers that must pass through the relay contract
    relayed_by: HashMap<(Address, Address), Address>,
}

impl FeeTransferCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fees to or from `address` are keyed as if they were to or from `canonical`
    pub fn alias(&mut self, address: Address, canonical: Address) {
        self.aliases.insert(address, canonical);
    }

    /// Transfers `from -> to` are accounted as `from -> via` followed by `via -> to`
    pub fn mark_requires_relay(&mut self, from: Address, to: Address, via: Address) {
        self.relayed_by.insert((from, to), via);
    }

    fn canonical(&self, address: Address) -> Address {
        self.aliases.get(&address).copied().unwrap_or(address)
    }

    /// Vault-routed pools are aliased to the vault. Hops into any Balancer pool, and hops out
    /// of a Balancer V1 pool, are relayed through `relayer`.
    pub fn infer_relays_and_aliases(&mut self, circuit: &[Arc<dyn ExchangePricer>], relayer: Address) {
        for p in circuit {
            if p.kind().is_vault_routed() {
                self.alias(p.address(), BALANCER_V2_VAULT);
            }
        }
        for pair in circuit.windows(2) {
            let (p1, p2) = (&pair[0], &pair[1]);
            if p2.kind().is_balancer() || p1.kind() == PricerKind::BalancerV1 {
                self.mark_requires_relay(p1.address(), p2.address(), relayer);
            }
        }
    }

    pub fn propose(&mut self, token: Address, from: Address, to: Address, fee: Decimal, round_down: bool) {
        let proposal = TokenFee {
            id: None,
            token,
            from,
            to,
            fee,
            round_down,
            block_number: None,
            updated_on: Utc::now().naive_utc(),
        };
        self.proposed_tokens_with_fee.insert(token);
        self.proposed.insert(proposal.key(), proposal);
    }

    pub fn clear_proposals(&mut self) {
        self.proposed.clear();
        self.proposed_tokens_with_fee.clear();
    }

    /// Promote every proposal into the committed layer as inferred at `block`.
    ///
    /// Returns the promoted records so the caller can persist them.
    pub fn commit_proposals(&mut self, block: u64) -> Vec<TokenFee> {
        let mut promoted: Vec<TokenFee> = self
            .proposed
            .drain()
            .map(|(_, mut fee)| {
                fee.block_number = Some(block);
                fee
            })
            .collect();
        promoted.sort_by_key(|f| f.key());
        for fee in &promoted {
            self.tokens_with_fee.insert(fee.token);
            self.committed.insert(fee.key(), fee.clone());
        }
        self.proposed_tokens_with_fee.clear();
        promoted
    }

    /// Record the row id a committed fee was persisted under, if the committed record for `key`
    /// is still the unpersisted one with this rate and rounding
    pub fn assign_id(&mut self, key: &FeeKey, fee: Decimal, round_down: bool, id: i64) -> bool {
        match self.committed.get_mut(key) {
            Some(record) if record.id.is_none() && record.fee == fee && record.round_down == round_down => {
                record.id = Some(id);
                true
            }
            _ => false,
        }
    }

    /// Copy of the committed layer to fall back to if the work built on it is not persisted
    pub fn checkpoint(&self) -> FeeCheckpoint {
        FeeCheckpoint {
            last_updated: self.last_updated,
            committed: self.committed.clone(),
            tokens_with_fee: self.tokens_with_fee.clone(),
        }
    }

    /// Return to `checkpoint`, dropping proposals and everything committed since
    pub fn restore(&mut self, checkpoint: FeeCheckpoint) {
        self.last_updated = checkpoint.last_updated;
        self.committed = checkpoint.committed;
        self.tokens_with_fee = checkpoint.tokens_with_fee;
        self.clear_proposals();
    }

    pub fn fee_for(&self, key: &FeeKey) -> Option<&TokenFee> {
        self.proposed.get(key).or_else(|| self.committed.get(key))
    }

    pub fn has_fee(&self, token: &Address) -> bool {
        self.tokens_with_fee.contains(token) || self.proposed_tokens_with_fee.contains(token)
    }

    fn direct_transfer(&self, token: Address, from: Address, to: Address, amount: U256) -> U256 {
        match self.fee_for(&FeeKey::new(token, from, to)) {
            Some(fee) => fee.apply(amount),
            None => NoTransferFees.out_from_transfer(token, from, to, amount),
        }
    }

    /// Fee records a relay over `circuit` (exchange addresses and directions) depends on
    pub fn fees_used(&self, circuit: &[Address], directions: &[(Address, Address)]) -> Vec<TokenFee> {
        let mut used = Vec::new();
        for (pair, (_, token)) in circuit.windows(2).zip(directions.iter()) {
            let (from, to) = (pair[0], pair[1]);
            let relayer = self.relayed_by.get(&(from, to)).copied();
            let (from, to) = (self.canonical(from), self.canonical(to));
            let keys = match relayer {
                Some(via) => vec![FeeKey::new(*token, from, via), FeeKey::new(*token, via, to)],
                None => vec![FeeKey::new(*token, from, to)],
            };
            used.extend(keys.iter().filter_map(|k| self.fee_for(k).cloned()));
        }
        used
    }

    /// Pull persisted fees into the committed layer: a full nearest-block load on the first
    /// sync (or when stale), otherwise only records updated since the last sync.
    pub async fn sync(&mut self, store: &Store, block: u64) -> Result<()> {
        let started = Instant::now();
        let now = Utc::now().naive_utc();
        let (full, records) = match self.last_updated {
            Some(at) if now - at <= TimeDelta::days(FULL_RESYNC_AFTER_DAYS) => {
                (false, store.token_fees_updated_since(at).await?)
            }
            _ => (true, store.nearest_token_fees(block).await?),
        };
        let loaded = records.len();
        self.merge_synced(records, block);
        self.last_updated = Some(now);
        debug!(
            block,
            full,
            loaded,
            committed = self.committed.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Synced inferred transfer fees"
        );
        Ok(())
    }

    /// Merge store records into the committed layer, keeping the record inferred closest to `block`
    pub fn merge_synced(&mut self, records: Vec<TokenFee>, block: u64) {
        for record in records {
            let key = record.key();
            let distance = |f: &TokenFee| f.block_number.map(|b| b.abs_diff(block)).unwrap_or(u64::MAX);
            let replace = match self.committed.get(&key) {
                Some(existing) => distance(existing) > distance(&record),
                None => true,
            };
            self.tokens_with_fee.insert(record.token);
            if replace {
                self.committed.insert(key, record);
            }
        }
    }
}

impl TransferFeeModel for FeeTransferCalculator {
    fn out_from_transfer(&self, token: Address, from: Address, to: Address, amount: U256) -> U256 {
        let relayer = self.relayed_by.get(&(from, to)).copied();
        let (from, to) = (self.canonical(from), self.canonical(to));
        match relayer {
            Some(via) => {
                let intermediate = self.direct_transfer(token, from, via, amount);
                self.direct_transfer(token, via, to, intermediate)
            }
            None => self.direct_transfer(token, from, to, amount),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricers::test_support::{offline_provider, token};
    use crate::pricers::{BalancerV1Pricer, UniswapV2Pricer};
    use pretty_assertions::assert_eq;

    fn record(id: i64, fee: Decimal, block: u64) -> TokenFee {
        TokenFee {
            id: Some(id),
            token: token(1),
            from: token(2),
            to: token(3),
            fee,
            round_down: true,
            block_number: Some(block),
            updated_on: Utc::now().naive_utc(),
        }
    }

    #[test]
    fn test_apply_rate_rounding() {
        assert_eq!(apply_rate(U256::from(1000u64), dec!(0.98), true), U256::from(980u64));
        assert_eq!(apply_rate(U256::from(3u64), dec!(0.33333), true), U256::ZERO);
        assert_eq!(apply_rate(U256::from(3u64), dec!(0.33333), false), U256::from(1u64));
        assert_eq!(apply_rate(U256::from(7u64), dec!(1), false), U256::from(7u64));
    }

    #[test]
    fn test_infer_fee_rate_reproduces_observation() {
        let (rate, round_down) = infer_fee_rate(U256::from(980u64), U256::from(1000u64)).unwrap();
        assert_eq!(rate, dec!(0.98));
        assert!(round_down);
        assert_eq!(apply_rate(U256::from(1000u64), rate, round_down), U256::from(980u64));

        // 1/3 rounds to 0.33333, which only reproduces 1 when ceiled
        let (rate, round_down) = infer_fee_rate(U256::from(1u64), U256::from(3u64)).unwrap();
        assert_eq!(rate, dec!(0.33333));
        assert!(!round_down);
    }

    #[test]
    fn test_infer_fee_rate_rejects_large_rate() {
        assert!(infer_fee_rate(U256::from(300u64), U256::from(100u64)).is_err());
        assert!(infer_fee_rate(U256::from(1u64), U256::ZERO).is_err());
    }

    #[test]
    fn test_proposed_shadows_committed() {
        let mut calc = FeeTransferCalculator::new();
        calc.merge_synced(vec![record(1, dec!(0.99), 10)], 10);
        let amount = U256::from(1000u64);
        assert_eq!(calc.out_from_transfer(token(1), token(2), token(3), amount), U256::from(990u64));

        calc.propose(token(1), token(2), token(3), dec!(0.95), true);
        assert_eq!(calc.out_from_transfer(token(1), token(2), token(3), amount), U256::from(950u64));

        calc.clear_proposals();
        assert_eq!(calc.out_from_transfer(token(1), token(2), token(3), amount), U256::from(990u64));
        assert!(calc.has_fee(&token(1)));
        assert!(!calc.has_fee(&token(2)));
    }

    #[test]
    fn test_unknown_transfer_is_fee_free() {
        let calc = FeeTransferCalculator::new();
        let amount = U256::from(12345u64);
        assert_eq!(calc.out_from_transfer(token(1), token(2), token(3), amount), amount);
    }

    #[test]
    fn test_sync_keeps_nearest_block() {
        let mut calc = FeeTransferCalculator::new();
        calc.merge_synced(vec![record(1, dec!(0.99), 100)], 150);
        // closer record replaces
        calc.merge_synced(vec![record(2, dec!(0.98), 140)], 150);
        assert_eq!(calc.fee_for(&FeeKey::new(token(1), token(2), token(3))).unwrap().id, Some(2));
        // farther record does not
        calc.merge_synced(vec![record(3, dec!(0.97), 200)], 150);
        assert_eq!(calc.fee_for(&FeeKey::new(token(1), token(2), token(3))).unwrap().id, Some(2));
    }

    #[test]
    fn test_commit_promotes_proposals() {
        let mut calc = FeeTransferCalculator::new();
        calc.propose(token(1), token(2), token(3), dec!(0.9), false);
        let promoted = calc.commit_proposals(77);
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].block_number, Some(77));

        let key = FeeKey::new(token(1), token(2), token(3));
        // a different rate is another record
        assert!(!calc.assign_id(&key, dec!(0.8), false, 41));
        assert!(calc.assign_id(&key, dec!(0.9), false, 42));
        assert!(!calc.assign_id(&key, dec!(0.9), false, 43));
        calc.clear_proposals();
        let fee = calc.fee_for(&key).unwrap();
        assert_eq!(fee.id, Some(42));
        assert!(calc.has_fee(&token(1)));
    }

    #[test]
    fn test_restore_drops_unpersisted_commits() {
        let mut calc = FeeTransferCalculator::new();
        calc.merge_synced(vec![record(7, dec!(0.99), 10)], 10);
        let checkpoint = calc.checkpoint();

        calc.propose(token(4), token(2), token(3), dec!(0.9), true);
        calc.commit_proposals(12);
        let new_key = FeeKey::new(token(4), token(2), token(3));
        assert!(calc.assign_id(&new_key, dec!(0.9), true, 42));
        calc.propose(token(5), token(2), token(3), dec!(0.5), true);

        calc.restore(checkpoint);
        assert_eq!(calc.fee_for(&new_key), None);
        assert!(!calc.has_fee(&token(4)));
        assert!(!calc.has_fee(&token(5)));
        let kept = calc.fee_for(&FeeKey::new(token(1), token(2), token(3))).unwrap();
        assert_eq!(kept.id, Some(7));
    }

    #[test]
    fn test_relay_decomposition_and_aliases() {
        let relayer = token(50);
        let uni = token(10);
        let bal = token(11);
        let circuit: Vec<Arc<dyn ExchangePricer>> = vec![
            Arc::new(UniswapV2Pricer::new(offline_provider(), uni, token(1), token(2))),
            Arc::new(BalancerV1Pricer::new(offline_provider(), bal, vec![token(1), token(2)])),
        ];
        let mut calc = FeeTransferCalculator::new();
        calc.infer_relays_and_aliases(&circuit, relayer);

        calc.merge_synced(
            vec![
                TokenFee { from: uni, to: relayer, fee: dec!(0.9), ..record(1, dec!(0.9), 5) },
                TokenFee { from: relayer, to: bal, fee: dec!(0.5), ..record(2, dec!(0.5), 5) },
            ],
            5,
        );

        // uni -> relayer -> bal: 1000 * 0.9 * 0.5
        let out = calc.out_from_transfer(token(1), uni, bal, U256::from(1000u64));
        assert_eq!(out, U256::from(450u64));

        let used = calc.fees_used(&[uni, bal], &[(token(2), token(1)), (token(1), token(2))]);
        assert_eq!(used.iter().map(|f| f.id).collect::<Vec<_>>(), vec![Some(1), Some(2)]);
    }
}
