//! Exchange pricers
//!
//! One implementation of [`ExchangePricer`] per supported pool family. Pricers keep a
//! cache of the pool state as of their block context and advance it from block logs;
//! `clone_without_cache` gives an independent pricer for a different block context.

pub mod balancer_v1;
pub mod balancer_v2;
pub mod uniswap_v2;
pub mod uniswap_v3;

use alloy::primitives::{Address, B256, U256};
use alloy::providers::DynProvider;
use alloy::rpc::types::Log;
use async_trait::async_trait;
use eyre::Result;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::config::BALANCER_V2_VAULT;
use crate::erc20::TokenDecimals;

pub use balancer_v1::BalancerV1Pricer;
pub use balancer_v2::{BalancerV2WeightedPricer, WeightedVariant};
pub use uniswap_v2::UniswapV2Pricer;
pub use uniswap_v3::UniswapV3Pricer;

/// Supported pool families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PricerKind {
    UniswapV2,
    UniswapV3,
    BalancerV1,
    BalancerV2Weighted,
    BalancerV2LiquidityBootstrapping,
}

impl PricerKind {
    pub fn is_balancer(&self) -> bool {
        matches!(
            self,
            PricerKind::BalancerV1 | PricerKind::BalancerV2Weighted | PricerKind::BalancerV2LiquidityBootstrapping
        )
    }

    /// Pools whose tokens are held by the Balancer V2 vault rather than the pool contract
    pub fn is_vault_routed(&self) -> bool {
        matches!(
            self,
            PricerKind::BalancerV2Weighted | PricerKind::BalancerV2LiquidityBootstrapping
        )
    }
}

impl std::fmt::Display for PricerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PricerKind::UniswapV2 => write!(f, "Uniswap V2"),
            PricerKind::UniswapV3 => write!(f, "Uniswap V3"),
            PricerKind::BalancerV1 => write!(f, "Balancer V1"),
            PricerKind::BalancerV2Weighted => write!(f, "Balancer V2 Weighted"),
            PricerKind::BalancerV2LiquidityBootstrapping => write!(f, "Balancer V2 LBP"),
        }
    }
}

/// Result of an exact-in swap
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwapQuote {
    pub amount_out: U256,
    /// Marginal price (token out per token in, raw units) after the swap
    pub spot_price_after: f64,
}

/// Token pairs whose relative price may have moved, each ordered `(lower, higher)`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockObservation {
    pub pairs_updated: BTreeSet<(Address, Address)>,
}

impl BlockObservation {
    pub fn mark(&mut self, a: Address, b: Address) {
        if a != b {
            self.pairs_updated.insert(ordered_pair(a, b));
        }
    }

    /// Mark every pair between a modified token and the rest of the pool
    pub fn mark_all_with(&mut self, modified: &Address, tokens: &[Address]) {
        for t in tokens {
            self.mark(*modified, *t);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs_updated.is_empty()
    }
}

/// Address that holds a pool's tokens and sends its output
pub fn token_holder(pricer: &Arc<dyn ExchangePricer>) -> Address {
    if pricer.kind().is_vault_routed() {
        BALANCER_V2_VAULT
    } else {
        pricer.address()
    }
}

pub fn ordered_pair(a: Address, b: Address) -> (Address, Address) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

#[async_trait]
pub trait ExchangePricer: Send + Sync + std::fmt::Debug {
    fn address(&self) -> Address;

    fn kind(&self) -> PricerKind;

    fn tokens(&self) -> Vec<Address>;

    /// Balancer V2 pool id; `None` for pools that are not vault-routed
    fn pool_id(&self) -> Option<B256> {
        None
    }

    /// Output of swapping `amount_in` at the end of `block`.
    ///
    /// Fails with `RelayError::NotEnoughLiquidity` when the pool's own input cap is exceeded.
    async fn compute_output(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        block: u64,
        timestamp: Option<u64>,
    ) -> Result<SwapQuote>;

    /// Balance of `token` the pool reports for itself
    async fn locked_value(&self, token: Address, block: u64) -> Result<U256>;

    /// Advance the cached state over one block's logs
    async fn observe_block(&self, logs: &[Log]) -> Result<BlockObservation>;

    fn clone_without_cache(&self) -> Arc<dyn ExchangePricer>;
}

/// How an exchange address is described in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeRecord {
    UniswapV2 { token0: Address, token1: Address },
    UniswapV3 { token0: Address, token1: Address, fee: u32 },
    BalancerV1,
    BalancerV2 { pool_id: B256, pool_type: String },
}

/// Construct the pricer for a store record, reading immutable pool configuration at `block`
pub async fn build_pricer(
    provider: &DynProvider,
    decimals: &Arc<TokenDecimals>,
    address: Address,
    record: ExchangeRecord,
    block: u64,
) -> Result<Option<Arc<dyn ExchangePricer>>> {
    let pricer: Arc<dyn ExchangePricer> = match record {
        ExchangeRecord::UniswapV2 { token0, token1 } => {
            Arc::new(UniswapV2Pricer::new(provider.clone(), address, token0, token1))
        }
        ExchangeRecord::UniswapV3 { token0, token1, fee } => {
            Arc::new(UniswapV3Pricer::new(provider.clone(), address, token0, token1, fee))
        }
        ExchangeRecord::BalancerV1 => Arc::new(BalancerV1Pricer::load(provider.clone(), address, block).await?),
        ExchangeRecord::BalancerV2 { pool_id, pool_type } => {
            let variant = match pool_type.as_str() {
                "WeightedPool" | "WeightedPool2Tokens" => WeightedVariant::Weighted,
                "LiquidityBootstrappingPool" | "NoProtocolFeeLiquidityBootstrappingPool" => {
                    WeightedVariant::LiquidityBootstrapping
                }
                other => {
                    tracing::debug!(%address, pool_type = other, "Unsupported Balancer V2 pool type");
                    return Ok(None);
                }
            };
            Arc::new(
                BalancerV2WeightedPricer::load(provider.clone(), decimals.clone(), address, pool_id, variant, block)
                    .await?,
            )
        }
    };
    Ok(Some(pricer))
}

/// Pricers resolved for one block context
#[derive(Debug, Default)]
pub struct PricerCache {
    pricers: HashMap<Address, Arc<dyn ExchangePricer>>,
}

impl PricerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &Address) -> Option<Arc<dyn ExchangePricer>> {
        self.pricers.get(address).cloned()
    }

    pub fn insert(&mut self, pricer: Arc<dyn ExchangePricer>) {
        self.pricers.insert(pricer.address(), pricer);
    }

    pub fn len(&self) -> usize {
        self.pricers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pricers.is_empty()
    }
}

/// Convert U256 to f64, keeping the top 64 bits for values beyond u128
pub fn u256_to_f64(value: U256) -> f64 {
    if value.is_zero() {
        return 0.0;
    }
    if value <= U256::from(u128::MAX) {
        return value.to::<u128>() as f64;
    }
    let bits = 256 - value.leading_zeros();
    let shift = bits.saturating_sub(64);
    let mantissa = (value >> shift).to::<u64>() as f64;
    mantissa * 2_f64.powi(shift as i32)
}

/// An 18-decimal fixed-point value as f64
pub fn fixed_to_f64(value: U256) -> f64 {
    u256_to_f64(value) / 1e18
}


#[cfg(test)]
mod tests {
    use super::*;
    use test_support::token;

    #[test]
    fn test_pairs_are_ordered_and_deduplicated() {
        let mut obs = BlockObservation::default();
        obs.mark(token(2), token(1));
        obs.mark(token(1), token(2));
        obs.mark(token(3), token(3));
        assert_eq!(obs.pairs_updated.len(), 1);
        assert!(obs.pairs_updated.contains(&(token(1), token(2))));
    }

    #[test]
    fn test_mark_all_with() {
        let mut obs = BlockObservation::default();
        obs.mark_all_with(&token(2), &[token(1), token(2), token(3)]);
        assert_eq!(
            obs.pairs_updated.into_iter().collect::<Vec<_>>(),
            vec![(token(1), token(2)), (token(2), token(3))]
        );
    }

    #[test]
    fn test_kind_flags() {
        assert!(PricerKind::BalancerV1.is_balancer());
        assert!(!PricerKind::BalancerV1.is_vault_routed());
        assert!(PricerKind::BalancerV2LiquidityBootstrapping.is_vault_routed());
        assert!(!PricerKind::UniswapV3.is_balancer());
    }

    #[test]
    fn test_u256_to_f64() {
        assert_eq!(u256_to_f64(U256::from(1_000u64)), 1000.0);
        assert_eq!(fixed_to_f64(U256::from(5u64) * U256::from(10u64).pow(U256::from(17))), 0.5);
        assert!(u256_to_f64(U256::MAX) > 1e76);
    }
}
