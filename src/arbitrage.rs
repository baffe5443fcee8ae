//! Candidate and resolved arbitrage circuits

use alloy::primitives::{Address, U256};
use eyre::{ensure, Result};
use std::sync::Arc;

use crate::config::WETH;
use crate::fee_transfer::TransferFeeModel;
use crate::pricers::{token_holder, ExchangePricer};

/// `(token_in, token_out)` for one hop
pub type Direction = (Address, Address);

/// Identity of a route across blocks
pub type CampaignKey = (Vec<Address>, Vec<Direction>);

/// A route predicted profitable by the upstream search at `block_number`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateArbitrage {
    pub id: i64,
    pub exchanges: Vec<Address>,
    pub directions: Vec<Direction>,
    pub amount_in: U256,
    pub profit_before_fee: U256,
    pub block_number: u64,
}

impl CandidateArbitrage {
    /// Build from the stored token cycle, where hop `i` trades `tokens[i]` for `tokens[i + 1]`
    /// and the last hop returns to `tokens[0]`.
    pub fn from_token_cycle(
        id: i64,
        exchanges: Vec<Address>,
        tokens: &[Address],
        amount_in: U256,
        profit_before_fee: U256,
        block_number: u64,
    ) -> Result<Self> {
        let directions = tokens
            .iter()
            .zip(tokens.iter().cycle().skip(1))
            .map(|(a, b)| (*a, *b))
            .collect();
        let candidate = Self {
            id,
            exchanges,
            directions,
            amount_in,
            profit_before_fee,
            block_number,
        };
        candidate.validate()?;
        Ok(candidate)
    }

    pub fn campaign_key(&self) -> CampaignKey {
        (self.exchanges.clone(), self.directions.clone())
    }

    /// Tokens traded by the route, in hop order
    pub fn tokens(&self) -> impl Iterator<Item = Address> + '_ {
        self.directions.iter().map(|(t, _)| *t)
    }

    /// Exchanges and directions align, and directions form a closed cycle from WETH
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.exchanges.is_empty(), "candidate {} has no exchanges", self.id);
        ensure!(
            self.exchanges.len() == self.directions.len(),
            "candidate {} has {} exchanges but {} directions",
            self.id,
            self.exchanges.len(),
            self.directions.len()
        );
        ensure!(
            self.directions[0].0 == WETH,
            "candidate {} does not start at WETH",
            self.id
        );
        for (i, (_, token_out)) in self.directions.iter().enumerate() {
            let (next_in, _) = self.directions[(i + 1) % self.directions.len()];
            ensure!(
                *token_out == next_in,
                "candidate {} breaks the token cycle at hop {i}",
                self.id
            );
        }
        Ok(())
    }
}

/// A candidate resolved to live pricers
#[derive(Debug, Clone)]
pub struct FoundArbitrage {
    pub circuit: Vec<Arc<dyn ExchangePricer>>,
    pub directions: Vec<Direction>,
    pub pivot: Address,
    pub amount_in: U256,
    pub profit: U256,
}

impl FoundArbitrage {
    pub fn from_candidate(candidate: &CandidateArbitrage, circuit: Vec<Arc<dyn ExchangePricer>>) -> Self {
        Self {
            circuit,
            directions: candidate.directions.clone(),
            pivot: candidate.directions[0].0,
            amount_in: candidate.amount_in,
            profit: candidate.profit_before_fee,
        }
    }

    pub fn exchanges(&self) -> Vec<Address> {
        self.circuit.iter().map(|p| p.address()).collect()
    }

    pub fn pricing_circuit(&self) -> PricingCircuit {
        PricingCircuit {
            circuit: self.circuit.clone(),
            directions: self.directions.clone(),
        }
    }
}

/// The route in the shape the solver searches over
#[derive(Debug, Clone)]
pub struct PricingCircuit {
    pub circuit: Vec<Arc<dyn ExchangePricer>>,
    pub directions: Vec<Direction>,
}

impl PricingCircuit {
    pub fn pivot(&self) -> Address {
        self.directions[0].0
    }

    /// Pivot amount returned to `relayer` after pushing `amount_in` through every hop,
    /// with transfer fees applied between each pair of parties.
    pub async fn sample(
        &self,
        amount_in: U256,
        block: u64,
        timestamp: Option<u64>,
        fees: &dyn TransferFeeModel,
        relayer: Address,
    ) -> Result<U256> {
        ensure!(!self.circuit.is_empty(), "empty circuit");
        let mut amount = fees.out_from_transfer(self.pivot(), relayer, token_holder(&self.circuit[0]), amount_in);
        for (i, (pricer, (token_in, token_out))) in self.circuit.iter().zip(&self.directions).enumerate() {
            let quote = pricer
                .compute_output(*token_in, *token_out, amount, block, timestamp)
                .await?;
            let next = self.circuit.get(i + 1).map(token_holder).unwrap_or(relayer);
            amount = fees.out_from_transfer(*token_out, token_holder(pricer), next, quote.amount_out);
        }
        Ok(amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BALANCER_V2_VAULT;
    use crate::fee_transfer::{FeeTransferCalculator, NoTransferFees};
    use crate::pricers::test_support::{offline_provider, token};
    use crate::pricers::{BalancerV2WeightedPricer, UniswapV2Pricer, WeightedVariant};
    use alloy::primitives::B256;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    #[test]
    fn test_token_cycle_becomes_directions() {
        let c = CandidateArbitrage::from_token_cycle(
            7,
            vec![token(10), token(11), token(12)],
            &[WETH, token(1), token(2)],
            U256::from(100u64),
            U256::from(5u64),
            1000,
        )
        .unwrap();
        assert_eq!(c.directions, vec![(WETH, token(1)), (token(1), token(2)), (token(2), WETH)]);
        assert_eq!(c.tokens().collect::<Vec<_>>(), vec![WETH, token(1), token(2)]);
    }

    #[test]
    fn test_validate_rejects_misaligned() {
        let err = CandidateArbitrage::from_token_cycle(
            1,
            vec![token(10)],
            &[WETH, token(1)],
            U256::ZERO,
            U256::ZERO,
            1,
        );
        assert!(err.is_err());

        let not_weth = CandidateArbitrage::from_token_cycle(
            1,
            vec![token(10), token(11)],
            &[token(1), token(2)],
            U256::ZERO,
            U256::ZERO,
            1,
        );
        assert!(not_weth.is_err());

        let broken = CandidateArbitrage {
            id: 2,
            exchanges: vec![token(10), token(11)],
            directions: vec![(WETH, token(1)), (token(2), WETH)],
            amount_in: U256::ZERO,
            profit_before_fee: U256::ZERO,
            block_number: 1,
        };
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_campaign_key_ignores_amounts() {
        let a = CandidateArbitrage::from_token_cycle(
            1,
            vec![token(10), token(11)],
            &[WETH, token(1)],
            U256::from(1u64),
            U256::from(1u64),
            5,
        )
        .unwrap();
        let b = CandidateArbitrage {
            id: 2,
            amount_in: U256::from(9u64),
            block_number: 6,
            ..a.clone()
        };
        assert_eq!(a.campaign_key(), b.campaign_key());
    }

    fn two_pool_circuit() -> PricingCircuit {
        // WETH -> token(1) on pool 10, token(1) -> WETH on pool 11
        let p1 = UniswapV2Pricer::new(offline_provider(), token(10), WETH, token(1))
            .with_reserves(U256::from(1_000_000u64), U256::from(2_000_000u64));
        let p2 = UniswapV2Pricer::new(offline_provider(), token(11), WETH, token(1))
            .with_reserves(U256::from(1_000_000u64), U256::from(1_000_000u64));
        PricingCircuit {
            circuit: vec![Arc::new(p1), Arc::new(p2)],
            directions: vec![(WETH, token(1)), (token(1), WETH)],
        }
    }

    #[tokio::test]
    async fn test_sample_without_fees() {
        let pc = two_pool_circuit();
        let out = pc
            .sample(U256::from(1000u64), 1, None, &NoTransferFees, token(50))
            .await
            .unwrap();
        // 1000 WETH -> 1992 token(1) -> 1982 WETH
        assert_eq!(out, U256::from(1982u64));
    }

    #[tokio::test]
    async fn test_sample_applies_fee_between_pools() {
        let pc = two_pool_circuit();
        let mut fees = FeeTransferCalculator::new();
        fees.propose(token(1), token(10), token(11), dec!(0.5), true);
        let out = pc.sample(U256::from(1000u64), 1, None, &fees, token(50)).await.unwrap();
        // 1992 sent, 996 arrive at pool 11
        let expected = crate::math::constant_product::get_amount_out(
            U256::from(996u64),
            U256::from(1_000_000u64),
            U256::from(1_000_000u64),
        )
        .unwrap();
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn test_sample_charges_vault_transfers_without_aliases() {
        let decimals = Arc::new(crate::erc20::TokenDecimals::new());
        decimals.insert(token(1), 18);
        decimals.insert(token(2), 18);
        let half = U256::from(500_000_000_000_000_000u64);
        let pool: Arc<dyn ExchangePricer> = Arc::new(
            BalancerV2WeightedPricer::new(
                offline_provider(),
                decimals,
                token(9),
                B256::with_last_byte(0x42),
                WeightedVariant::Weighted,
                vec![token(1), token(2)],
            )
            .with_state(
                &[(token(1), U256::from(1000u64)), (token(2), U256::from(1000u64))],
                &[(token(1), half), (token(2), half)],
                U256::ZERO,
            ),
        );
        let pc = PricingCircuit {
            circuit: vec![pool.clone()],
            directions: vec![(token(1), token(2))],
        };
        let relayer = token(50);
        // fees keyed on the vault, with no alias registered for the pool
        let mut fees = FeeTransferCalculator::new();
        fees.propose(token(1), relayer, BALANCER_V2_VAULT, dec!(0.5), true);
        fees.propose(token(2), BALANCER_V2_VAULT, relayer, dec!(0.5), true);

        let out = pc.sample(U256::from(100u64), 1, None, &fees, relayer).await.unwrap();
        let quote = pool
            .compute_output(token(1), token(2), U256::from(50u64), 1, None)
            .await
            .unwrap();
        assert_eq!(out, quote.amount_out / U256::from(2u8));
    }
}
