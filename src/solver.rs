//! Input sizing for a priced circuit

use alloy::primitives::{Address, I256, U256};
use async_trait::async_trait;
use eyre::Result;

use crate::arbitrage::{FoundArbitrage, PricingCircuit};
use crate::error::RelayError;
use crate::fee_transfer::TransferFeeModel;

/// Finds the most profitable input for a circuit under a fee model.
///
/// Must be deterministic for identical pricer state, and re-run whenever the fee model changes.
#[async_trait]
pub trait ArbitrageSolver: Send + Sync {
    async fn solve(
        &self,
        pc: &PricingCircuit,
        block: u64,
        timestamp: Option<u64>,
        fees: &dyn TransferFeeModel,
        relayer: Address,
    ) -> Result<Option<FoundArbitrage>>;
}

/// Doubles the input until profit stops rising or a pool runs out of liquidity, then
/// ternary-searches the bracket over integer amounts
#[derive(Debug, Clone)]
pub struct BisectionSolver {
    initial_amount: U256,
    max_doublings: u32,
}

impl Default for BisectionSolver {
    fn default() -> Self {
        // 0.01 ETH
        Self::new(U256::from(10_000_000_000_000_000u64), 96)
    }
}

impl BisectionSolver {
    pub fn new(initial_amount: U256, max_doublings: u32) -> Self {
        Self {
            initial_amount: initial_amount.max(U256::from(1u8)),
            max_doublings,
        }
    }
}

struct Objective<'a> {
    pc: &'a PricingCircuit,
    block: u64,
    timestamp: Option<u64>,
    fees: &'a dyn TransferFeeModel,
    relayer: Address,
}

impl Objective<'_> {
    /// `None` when a pool cannot absorb the input
    async fn profit(&self, amount_in: U256) -> Result<Option<I256>> {
        match self
            .pc
            .sample(amount_in, self.block, self.timestamp, self.fees, self.relayer)
            .await
        {
            Ok(out) => Ok(Some(I256::from_raw(out) - I256::from_raw(amount_in))),
            Err(e) if matches!(RelayError::from_report(&e), Some(RelayError::NotEnoughLiquidity { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ArbitrageSolver for BisectionSolver {
    async fn solve(
        &self,
        pc: &PricingCircuit,
        block: u64,
        timestamp: Option<u64>,
        fees: &dyn TransferFeeModel,
        relayer: Address,
    ) -> Result<Option<FoundArbitrage>> {
        let objective = Objective {
            pc,
            block,
            timestamp,
            fees,
            relayer,
        };

        let mut lo = U256::ZERO;
        let mut best_seen = Some(I256::ZERO);
        let mut x = self.initial_amount;
        let mut hi = x;
        for _ in 0..self.max_doublings {
            let p = objective.profit(x).await?;
            hi = x;
            if p <= best_seen {
                break;
            }
            best_seen = p;
            lo = x >> 1;
            x = match x.checked_mul(U256::from(2u8)) {
                Some(next) => next,
                None => break,
            };
        }

        while hi - lo > U256::from(2u8) {
            let third = (hi - lo) / U256::from(3u8);
            let (m1, m2) = (lo + third, hi - third);
            if objective.profit(m1).await? < objective.profit(m2).await? {
                lo = m1;
            } else {
                hi = m2;
            }
        }

        let mut best: Option<(U256, I256)> = None;
        let mut amount = lo;
        while amount <= hi {
            match (objective.profit(amount).await?, best) {
                (Some(p), Some((_, b))) if p <= b => {}
                (Some(p), _) => best = Some((amount, p)),
                (None, _) => {}
            }
            amount += U256::from(1u8);
        }

        Ok(match best {
            Some((amount_in, profit)) if profit > I256::ZERO => Some(FoundArbitrage {
                circuit: pc.circuit.clone(),
                directions: pc.directions.clone(),
                pivot: pc.pivot(),
                amount_in,
                profit: profit.into_raw(),
            }),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WETH;
    use crate::fee_transfer::NoTransferFees;
    use crate::pricers::test_support::{e18, offline_provider, token};
    use crate::pricers::{ExchangePricer, UniswapV2Pricer};
    use std::sync::Arc;

    fn circuit(a: (u64, u64), b: (u64, u64)) -> PricingCircuit {
        let pool = |address: u8, (weth, other): (u64, u64)| -> Arc<dyn ExchangePricer> {
            Arc::new(
                UniswapV2Pricer::new(offline_provider(), token(address), WETH, token(1))
                    .with_reserves(e18(weth), e18(other)),
            )
        };
        PricingCircuit {
            circuit: vec![pool(10, a), pool(11, b)],
            directions: vec![(WETH, token(1)), (token(1), WETH)],
        }
    }

    async fn profit_at(pc: &PricingCircuit, amount: U256) -> I256 {
        let out = pc.sample(amount, 1, None, &NoTransferFees, token(50)).await.unwrap();
        I256::from_raw(out) - I256::from_raw(amount)
    }

    #[tokio::test]
    async fn test_finds_profitable_input() {
        let pc = circuit((1000, 2000), (1000, 1000));
        let found = BisectionSolver::default()
            .solve(&pc, 1, None, &NoTransferFees, token(50))
            .await
            .unwrap()
            .expect("imbalanced pools are profitable");

        assert!(found.profit > U256::ZERO);
        assert_eq!(found.pivot, WETH);
        let best = I256::from_raw(found.profit);
        assert_eq!(profit_at(&pc, found.amount_in).await, best);
        let tenth = found.amount_in / U256::from(10u8);
        assert!(profit_at(&pc, found.amount_in - tenth).await <= best);
        assert!(profit_at(&pc, found.amount_in + tenth).await <= best);
    }

    #[tokio::test]
    async fn test_balanced_pools_have_no_arbitrage() {
        let pc = circuit((1000, 1000), (1000, 1000));
        let found = BisectionSolver::default()
            .solve(&pc, 1, None, &NoTransferFees, token(50))
            .await
            .unwrap();
        assert!(found.is_none());
    }
}
