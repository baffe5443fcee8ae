use alloy::primitives::{uint, Address, B256, I256, U256};
use alloy::providers::DynProvider;
use alloy::rpc::types::{BlockId, Log};
use alloy::sol;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use eyre::{eyre, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::{fixed_to_f64, BlockObservation, ExchangePricer, PricerKind, SwapQuote};
use crate::config::BALANCER_V2_VAULT;
use crate::erc20::TokenDecimals;
use crate::error::RelayError;
use crate::math::fixed_point::{self, complement, div_down, div_up, mul_down, mul_up};

/// The weighted-math guard: a swap may bring in at most 30% of the input balance
pub const MAX_IN_RATIO: U256 = uint!(300_000_000_000_000_000_U256);

sol! {
    #[sol(rpc)]
    interface IBalancerVault {
        function getPoolTokens(bytes32 poolId) external view returns (address[] tokens, uint256[] balances, uint256 lastChangeBlock);

        event Swap(bytes32 indexed poolId, address indexed tokenIn, address indexed tokenOut, uint256 amountIn, uint256 amountOut);
        event PoolBalanceChanged(bytes32 indexed poolId, address indexed liquidityProvider, address[] tokens, int256[] deltas, uint256[] protocolFeeAmounts);
        event TokensRegistered(bytes32 indexed poolId, address[] tokens, address[] assetManagers);
    }
}

sol! {
    #[sol(rpc)]
    interface IWeightedPool {
        function getNormalizedWeights() external view returns (uint256[] memory);
        function getSwapFeePercentage() external view returns (uint256);
        function getSwapEnabled() external view returns (bool);

        event SwapFeePercentageChanged(uint256 swapFeePercentage);
        event SwapEnabledSet(bool swapEnabled);
        event GradualWeightUpdateScheduled(uint256 startTime, uint256 endTime, uint256[] startWeights, uint256[] endWeights);
    }
}

/// Weighted pool flavours sharing the vault and the weighted math
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightedVariant {
    /// Fixed weights, priced with the legacy (always log/exp) power
    Weighted,
    /// Weights move over time and swaps can be paused
    LiquidityBootstrapping,
}

#[derive(Debug, Default)]
struct PoolState {
    tokens: Vec<Address>,
    balances: HashMap<Address, U256>,
    swap_fee: Option<U256>,
    /// Normalized weights and the block they were read at
    weights: Option<(u64, HashMap<Address, U256>)>,
    swap_enabled: Option<bool>,
}

/// Balancer V2 weighted or liquidity-bootstrapping pool; balances live in the vault
#[derive(Debug)]
pub struct BalancerV2WeightedPricer {
    provider: DynProvider,
    decimals: Arc<TokenDecimals>,
    address: Address,
    pool_id: B256,
    variant: WeightedVariant,
    state: Mutex<PoolState>,
}

impl BalancerV2WeightedPricer {
    pub fn new(
        provider: DynProvider,
        decimals: Arc<TokenDecimals>,
        address: Address,
        pool_id: B256,
        variant: WeightedVariant,
        mut tokens: Vec<Address>,
    ) -> Self {
        tokens.sort();
        Self {
            provider,
            decimals,
            address,
            pool_id,
            variant,
            state: Mutex::new(PoolState {
                tokens,
                ..Default::default()
            }),
        }
    }

    pub async fn load(
        provider: DynProvider,
        decimals: Arc<TokenDecimals>,
        address: Address,
        pool_id: B256,
        variant: WeightedVariant,
        block: u64,
    ) -> Result<Self> {
        let vault = IBalancerVault::new(BALANCER_V2_VAULT, provider.clone());
        let pool_tokens = vault.getPoolTokens(pool_id).block(BlockId::number(block)).call().await?;
        let pricer = Self::new(provider, decimals, address, pool_id, variant, pool_tokens.tokens.clone());
        // the vault already reported balances as of this block
        pricer
            .state
            .lock()
            .balances
            .extend(pool_tokens.tokens.into_iter().zip(pool_tokens.balances));
        Ok(pricer)
    }

    #[cfg(test)]
    pub fn with_state(self, balances: &[(Address, U256)], weights: &[(Address, U256)], swap_fee: U256) -> Self {
        {
            let mut state = self.state.lock();
            state.balances.extend(balances.iter().copied());
            state.weights = Some((0, weights.iter().copied().collect()));
            state.swap_fee = Some(swap_fee);
            state.swap_enabled = Some(true);
        }
        self
    }

    fn pool(&self) -> IWeightedPool::IWeightedPoolInstance<DynProvider> {
        IWeightedPool::new(self.address, self.provider.clone())
    }

    async fn swap_fee(&self, block: u64) -> Result<U256> {
        let cached = self.state.lock().swap_fee;
        if let Some(f) = cached {
            return Ok(f);
        }
        let f = self.pool().getSwapFeePercentage().block(BlockId::number(block)).call().await?;
        self.state.lock().swap_fee = Some(f);
        Ok(f)
    }

    async fn balance(&self, token: Address, block: u64) -> Result<U256> {
        let cached = self.state.lock().balances.get(&token).copied();
        if let Some(b) = cached {
            return Ok(b);
        }
        let vault = IBalancerVault::new(BALANCER_V2_VAULT, self.provider.clone());
        let pool_tokens = vault.getPoolTokens(self.pool_id).block(BlockId::number(block)).call().await?;
        let mut state = self.state.lock();
        for (t, b) in pool_tokens.tokens.iter().zip(pool_tokens.balances.iter()) {
            state.balances.insert(*t, *b);
        }
        state
            .balances
            .get(&token)
            .copied()
            .ok_or_else(|| eyre!("vault has no balance of {token} for pool {}", self.pool_id))
    }

    /// Weights are fixed for weighted pools; bootstrapping pools are re-read per block
    async fn weights(&self, block: u64) -> Result<HashMap<Address, U256>> {
        let cached = self.state.lock().weights.clone();
        if let Some((at, weights)) = cached {
            if self.variant == WeightedVariant::Weighted || at == block {
                return Ok(weights);
            }
        }
        let raw = self.pool().getNormalizedWeights().block(BlockId::number(block)).call().await?;
        let tokens = self.tokens();
        if raw.len() != tokens.len() {
            return Err(eyre!(
                "pool {} reports {} weights for {} tokens",
                self.address,
                raw.len(),
                tokens.len()
            ));
        }
        let weights: HashMap<Address, U256> = tokens.into_iter().zip(raw).collect();
        self.state.lock().weights = Some((block, weights.clone()));
        Ok(weights)
    }

    async fn swap_enabled(&self, block: u64) -> Result<bool> {
        if self.variant == WeightedVariant::Weighted {
            return Ok(true);
        }
        let cached = self.state.lock().swap_enabled;
        if let Some(e) = cached {
            return Ok(e);
        }
        let enabled = self.pool().getSwapEnabled().block(BlockId::number(block)).call().await?;
        self.state.lock().swap_enabled = Some(enabled);
        Ok(enabled)
    }

    fn power(&self, base: U256, exponent: U256) -> Result<U256> {
        Ok(match self.variant {
            WeightedVariant::Weighted => fixed_point::pow_up_legacy(base, exponent)?,
            WeightedVariant::LiquidityBootstrapping => fixed_point::pow_up(base, exponent)?,
        })
    }
}

#[async_trait]
impl ExchangePricer for BalancerV2WeightedPricer {
    fn address(&self) -> Address {
        self.address
    }

    fn kind(&self) -> PricerKind {
        match self.variant {
            WeightedVariant::Weighted => PricerKind::BalancerV2Weighted,
            WeightedVariant::LiquidityBootstrapping => PricerKind::BalancerV2LiquidityBootstrapping,
        }
    }

    fn tokens(&self) -> Vec<Address> {
        self.state.lock().tokens.clone()
    }

    fn pool_id(&self) -> Option<B256> {
        Some(self.pool_id)
    }

    async fn compute_output(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        block: u64,
        _timestamp: Option<u64>,
    ) -> Result<SwapQuote> {
        let tokens = self.tokens();
        for token in [token_in, token_out] {
            if !tokens.contains(&token) {
                return Err(RelayError::TokenNotAvailable {
                    exchange: self.address,
                    token,
                }
                .into());
            }
        }
        if !self.swap_enabled(block).await? {
            return Ok(SwapQuote {
                amount_out: U256::ZERO,
                spot_price_after: 0.0,
            });
        }

        let swap_fee = self.swap_fee(block).await?;
        let fee_amount = mul_up(amount_in, swap_fee)?;
        let amount_in_net = amount_in - fee_amount.min(amount_in);

        let balance_in_raw = self.balance(token_in, block).await?;
        let balance_out_raw = self.balance(token_out, block).await?;
        let decimals_in = self.decimals.get(&self.provider, token_in).await?;
        let decimals_out = self.decimals.get(&self.provider, token_out).await?;

        let amount_in_scaled = fixed_point::upscale(amount_in_net, decimals_in)?;
        let balance_in = fixed_point::upscale(balance_in_raw, decimals_in)?;
        let balance_out = fixed_point::upscale(balance_out_raw, decimals_out)?;

        let weights = self.weights(block).await?;
        let weight_in = *weights.get(&token_in).ok_or_else(|| eyre!("no weight for {token_in}"))?;
        let weight_out = *weights.get(&token_out).ok_or_else(|| eyre!("no weight for {token_out}"))?;

        let max_in = mul_down(balance_in, MAX_IN_RATIO)?;
        if amount_in_scaled > max_in {
            return Err(RelayError::NotEnoughLiquidity {
                exchange: self.address,
                excess: fixed_point::downscale_down(amount_in_scaled - max_in, decimals_in)?,
            }
            .into());
        }

        let denominator = balance_in + amount_in_scaled;
        let amount_out = if denominator.is_zero() {
            U256::ZERO
        } else {
            let base = div_up(balance_in, denominator)?;
            let exponent = div_down(weight_in, weight_out)?;
            let power = self.power(base, exponent)?;
            let out = mul_down(balance_out, complement(power))?;
            fixed_point::downscale_down(out, decimals_out)?
        };

        let spot_price_after = fixed_point::weighted_spot_price(
            balance_in_raw + amount_in,
            weight_in,
            balance_out_raw.saturating_sub(amount_out),
            weight_out,
            swap_fee,
        )
        .map(fixed_to_f64)
        .unwrap_or(0.0);

        Ok(SwapQuote {
            amount_out,
            spot_price_after,
        })
    }

    async fn locked_value(&self, token: Address, block: u64) -> Result<U256> {
        self.balance(token, block).await
    }

    async fn observe_block(&self, logs: &[Log]) -> Result<BlockObservation> {
        let mut observation = BlockObservation::default();
        let mut state = self.state.lock();

        for log in logs {
            let Some(topic0) = log.topics().first() else {
                continue;
            };

            if log.address() == self.address {
                if *topic0 == IWeightedPool::SwapFeePercentageChanged::SIGNATURE_HASH {
                    let changed = IWeightedPool::SwapFeePercentageChanged::decode_log_data(log.data())?;
                    state.swap_fee = Some(changed.swapFeePercentage);
                } else if *topic0 == IWeightedPool::SwapEnabledSet::SIGNATURE_HASH {
                    let set = IWeightedPool::SwapEnabledSet::decode_log_data(log.data())?;
                    state.swap_enabled = Some(set.swapEnabled);
                } else if *topic0 == IWeightedPool::GradualWeightUpdateScheduled::SIGNATURE_HASH {
                    state.weights = None;
                } else {
                    continue;
                }
                // every exchange rate in the pool moved
                let tokens = state.tokens.clone();
                for t in &tokens {
                    observation.mark_all_with(t, &tokens);
                }
                continue;
            }

            if log.address() != BALANCER_V2_VAULT || log.topics().get(1) != Some(&self.pool_id) {
                continue;
            }

            if *topic0 == IBalancerVault::Swap::SIGNATURE_HASH {
                let swap = IBalancerVault::Swap::decode_log_data(log.data())?;
                if let Some(b) = state.balances.get_mut(&swap.tokenIn) {
                    *b += swap.amountIn;
                }
                if let Some(b) = state.balances.get_mut(&swap.tokenOut) {
                    *b = b
                        .checked_sub(swap.amountOut)
                        .ok_or_else(|| eyre!("vault swap drains more than cached balance of {}", swap.tokenOut))?;
                }
                let tokens = state.tokens.clone();
                observation.mark_all_with(&swap.tokenIn, &tokens);
                observation.mark_all_with(&swap.tokenOut, &tokens);
            } else if *topic0 == IBalancerVault::PoolBalanceChanged::SIGNATURE_HASH {
                let changed = IBalancerVault::PoolBalanceChanged::decode_log_data(log.data())?;
                let tokens = state.tokens.clone();
                for (t, delta) in changed.tokens.iter().zip(changed.deltas.iter()) {
                    if let Some(b) = state.balances.get_mut(t) {
                        let updated = I256::from_raw(*b)
                            .checked_add(*delta)
                            .filter(|v| !v.is_negative())
                            .ok_or_else(|| eyre!("balance change underflows cached balance of {t}"))?;
                        *b = updated.into_raw();
                    }
                    observation.mark_all_with(t, &tokens);
                }
            } else if *topic0 == IBalancerVault::TokensRegistered::SIGNATURE_HASH {
                let registered = IBalancerVault::TokensRegistered::decode_log_data(log.data())?;
                for t in registered.tokens {
                    if !state.tokens.contains(&t) {
                        state.tokens.push(t);
                    }
                    state.balances.insert(t, U256::ZERO);
                }
                state.tokens.sort();
                state.weights = None;
            }
        }

        Ok(observation)
    }

    fn clone_without_cache(&self) -> Arc<dyn ExchangePricer> {
        Arc::new(Self::new(
            self.provider.clone(),
            self.decimals.clone(),
            self.address,
            self.pool_id,
            self.variant,
            self.tokens(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricers::test_support::{e18, offline_provider, rpc_log, token};

    const HALF: U256 = uint!(500_000_000_000_000_000_U256);

    fn pool(variant: WeightedVariant) -> BalancerV2WeightedPricer {
        let decimals = Arc::new(TokenDecimals::new());
        decimals.insert(token(1), 18);
        decimals.insert(token(2), 18);
        BalancerV2WeightedPricer::new(
            offline_provider(),
            decimals,
            token(9),
            B256::with_last_byte(0x42),
            variant,
            vec![token(2), token(1)],
        )
        .with_state(
            &[(token(1), U256::from(1000)), (token(2), U256::from(1000))],
            &[(token(1), HALF), (token(2), HALF)],
            U256::ZERO,
        )
    }

    #[tokio::test]
    async fn test_balanced_pool_swap_then_observe() {
        let p = pool(WeightedVariant::Weighted);
        let q = p.compute_output(token(1), token(2), U256::from(100), 10, None).await.unwrap();
        assert_eq!(q.amount_out, U256::from(90));

        let swap = IBalancerVault::Swap {
            poolId: B256::with_last_byte(0x42),
            tokenIn: token(1),
            tokenOut: token(2),
            amountIn: U256::from(100),
            amountOut: U256::from(90),
        };
        let obs = p
            .observe_block(&[rpc_log(BALANCER_V2_VAULT, swap.encode_log_data(), 11)])
            .await
            .unwrap();
        assert!(obs.pairs_updated.contains(&(token(1), token(2))));
        assert_eq!(p.locked_value(token(1), 11).await.unwrap(), U256::from(1100));
        assert_eq!(p.locked_value(token(2), 11).await.unwrap(), U256::from(910));
    }

    #[tokio::test]
    async fn test_bootstrapping_pool_uses_exact_power() {
        let p = pool(WeightedVariant::LiquidityBootstrapping);
        // weights were seeded for block 0; bootstrapping weights are only valid at that block
        let q = p.compute_output(token(1), token(2), U256::from(100), 0, None).await.unwrap();
        assert_eq!(q.amount_out, U256::from(90));
        assert_eq!(p.kind(), PricerKind::BalancerV2LiquidityBootstrapping);
    }

    #[tokio::test]
    async fn test_thirty_percent_cap() {
        let p = pool(WeightedVariant::Weighted);
        let err = p
            .compute_output(token(1), token(2), U256::from(301), 10, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::NotEnoughLiquidity { .. })
        ));
        assert!(p.compute_output(token(1), token(2), U256::from(300), 10, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_other_pool_logs_ignored_and_balance_change_applied() {
        let p = pool(WeightedVariant::Weighted);
        let foreign = IBalancerVault::Swap {
            poolId: B256::with_last_byte(0x43),
            tokenIn: token(1),
            tokenOut: token(2),
            amountIn: U256::from(100),
            amountOut: U256::from(90),
        };
        let join = IBalancerVault::PoolBalanceChanged {
            poolId: B256::with_last_byte(0x42),
            liquidityProvider: token(7),
            tokens: vec![token(1), token(2)],
            deltas: vec![I256::try_from(5i64).unwrap(), I256::try_from(-3i64).unwrap()],
            protocolFeeAmounts: vec![U256::ZERO, U256::ZERO],
        };
        let logs = vec![
            rpc_log(BALANCER_V2_VAULT, foreign.encode_log_data(), 11),
            rpc_log(BALANCER_V2_VAULT, join.encode_log_data(), 11),
        ];
        p.observe_block(&logs).await.unwrap();
        assert_eq!(p.locked_value(token(1), 11).await.unwrap(), U256::from(1005));
        assert_eq!(p.locked_value(token(2), 11).await.unwrap(), U256::from(997));
    }

    #[tokio::test]
    async fn test_fee_change_marks_every_pair() {
        let p = pool(WeightedVariant::Weighted);
        let changed = IWeightedPool::SwapFeePercentageChanged {
            swapFeePercentage: e18(1) / U256::from(100),
        };
        let obs = p
            .observe_block(&[rpc_log(token(9), changed.encode_log_data(), 11)])
            .await
            .unwrap();
        assert!(obs.pairs_updated.contains(&(token(1), token(2))));

        // 1% fee now taken from the input
        let q = p.compute_output(token(1), token(2), U256::from(100), 11, None).await.unwrap();
        assert_eq!(q.amount_out, U256::from(90));
        let q = p.compute_output(token(1), token(2), U256::from(200), 11, None).await.unwrap();
        assert!(q.amount_out < U256::from(166));
    }
}
