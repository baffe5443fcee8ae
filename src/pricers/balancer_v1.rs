use alloy::primitives::{Address, U256};
use alloy::providers::DynProvider;
use alloy::rpc::types::{BlockId, Log};
use alloy::sol;
use alloy::sol_types::{SolCall, SolEvent};
use async_trait::async_trait;
use eyre::{eyre, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::{fixed_to_f64, BlockObservation, ExchangePricer, PricerKind, SwapQuote};
use crate::error::RelayError;
use crate::math::bmath::{self, MAX_IN_RATIO};

sol! {
    #[sol(rpc)]
    interface IBPool {
        function getCurrentTokens() external view returns (address[] memory tokens);
        function getBalance(address token) external view returns (uint256);
        function getDenormalizedWeight(address token) external view returns (uint256);
        function getSwapFee() external view returns (uint256);

        function setSwapFee(uint256 swapFee) external;
        function setPublicSwap(bool public_) external;
        function finalize() external;
        function bind(address token, uint256 balance, uint256 denorm) external;
        function rebind(address token, uint256 balance, uint256 denorm) external;
        function unbind(address token) external;
        function gulp(address token) external;

        event LOG_SWAP(address indexed caller, address indexed tokenIn, address indexed tokenOut, uint256 tokenAmountIn, uint256 tokenAmountOut);
        event LOG_JOIN(address indexed caller, address indexed tokenIn, uint256 tokenAmountIn);
        event LOG_EXIT(address indexed caller, address indexed tokenOut, uint256 tokenAmountOut);
    }
}

/// Admin calls whose anonymous `LOG_CALL` means balances, weights or fee moved non-additively
const RELOAD_SELECTORS: [[u8; 4]; 7] = [
    IBPool::setSwapFeeCall::SELECTOR,
    IBPool::setPublicSwapCall::SELECTOR,
    IBPool::finalizeCall::SELECTOR,
    IBPool::bindCall::SELECTOR,
    IBPool::rebindCall::SELECTOR,
    IBPool::unbindCall::SELECTOR,
    IBPool::gulpCall::SELECTOR,
];

#[derive(Debug, Default)]
struct PoolState {
    tokens: Vec<Address>,
    tokens_stale: bool,
    balances: HashMap<Address, U256>,
    weights: HashMap<Address, U256>,
    swap_fee: Option<U256>,
}

/// Balancer V1 BPool
#[derive(Debug)]
pub struct BalancerV1Pricer {
    provider: DynProvider,
    address: Address,
    state: Mutex<PoolState>,
}

impl BalancerV1Pricer {
    pub fn new(provider: DynProvider, address: Address, tokens: Vec<Address>) -> Self {
        Self {
            provider,
            address,
            state: Mutex::new(PoolState {
                tokens,
                ..Default::default()
            }),
        }
    }

    pub async fn load(provider: DynProvider, address: Address, block: u64) -> Result<Self> {
        let pool = IBPool::new(address, provider.clone());
        let tokens = pool.getCurrentTokens().block(BlockId::number(block)).call().await?;
        Ok(Self::new(provider, address, tokens))
    }

    #[cfg(test)]
    pub fn with_state(self, balances: &[(Address, U256)], weights: &[(Address, U256)], swap_fee: U256) -> Self {
        {
            let mut state = self.state.lock();
            state.balances.extend(balances.iter().copied());
            state.weights.extend(weights.iter().copied());
            state.swap_fee = Some(swap_fee);
        }
        self
    }

    fn contract(&self) -> IBPool::IBPoolInstance<DynProvider> {
        IBPool::new(self.address, self.provider.clone())
    }

    async fn refresh_tokens(&self, block: u64) -> Result<()> {
        let stale = self.state.lock().tokens_stale;
        if stale {
            let tokens = self.contract().getCurrentTokens().block(BlockId::number(block)).call().await?;
            let mut state = self.state.lock();
            state.tokens = tokens;
            state.tokens_stale = false;
        }
        Ok(())
    }

    async fn balance(&self, token: Address, block: u64) -> Result<U256> {
        let cached = self.state.lock().balances.get(&token).copied();
        if let Some(b) = cached {
            return Ok(b);
        }
        let b = self.contract().getBalance(token).block(BlockId::number(block)).call().await?;
        self.state.lock().balances.insert(token, b);
        Ok(b)
    }

    async fn weight(&self, token: Address, block: u64) -> Result<U256> {
        let cached = self.state.lock().weights.get(&token).copied();
        if let Some(w) = cached {
            return Ok(w);
        }
        let w = self
            .contract()
            .getDenormalizedWeight(token)
            .block(BlockId::number(block))
            .call()
            .await?;
        self.state.lock().weights.insert(token, w);
        Ok(w)
    }

    async fn swap_fee(&self, block: u64) -> Result<U256> {
        let cached = self.state.lock().swap_fee;
        if let Some(f) = cached {
            return Ok(f);
        }
        let f = self.contract().getSwapFee().block(BlockId::number(block)).call().await?;
        self.state.lock().swap_fee = Some(f);
        Ok(f)
    }

    fn is_reload_call(topic0: &[u8]) -> bool {
        topic0[4..].iter().all(|b| *b == 0) && RELOAD_SELECTORS.iter().any(|sel| topic0[..4] == sel[..])
    }
}

#[async_trait]
impl ExchangePricer for BalancerV1Pricer {
    fn address(&self) -> Address {
        self.address
    }

    fn kind(&self) -> PricerKind {
        PricerKind::BalancerV1
    }

    fn tokens(&self) -> Vec<Address> {
        self.state.lock().tokens.clone()
    }

    async fn compute_output(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        block: u64,
        _timestamp: Option<u64>,
    ) -> Result<SwapQuote> {
        self.refresh_tokens(block).await?;
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

        let balance_in = self.balance(token_in, block).await?;
        let balance_out = self.balance(token_out, block).await?;
        let weight_in = self.weight(token_in, block).await?;
        let weight_out = self.weight(token_out, block).await?;
        let swap_fee = self.swap_fee(block).await?;

        let max_in = bmath::bmul(balance_in, MAX_IN_RATIO)?;
        if amount_in > max_in {
            return Err(RelayError::NotEnoughLiquidity {
                exchange: self.address,
                excess: amount_in - max_in,
            }
            .into());
        }

        let amount_out = bmath::calc_out_given_in(balance_in, weight_in, balance_out, weight_out, amount_in, swap_fee)?;

        // price of token in per token out after the swap, inverted
        let spot_price_after = bmath::calc_spot_price(
            balance_in + amount_in,
            weight_in,
            balance_out.saturating_sub(amount_out),
            weight_out,
            swap_fee,
        )
        .ok()
        .filter(|p| !p.is_zero())
        .map(|p| 1.0 / fixed_to_f64(p))
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
            if log.address() != self.address {
                continue;
            }
            let Some(topic0) = log.topics().first() else {
                continue;
            };

            if *topic0 == IBPool::LOG_SWAP::SIGNATURE_HASH {
                let swap = IBPool::LOG_SWAP::decode_log_data(log.data())?;
                if let Some(b) = state.balances.get_mut(&swap.tokenIn) {
                    *b += swap.tokenAmountIn;
                }
                if let Some(b) = state.balances.get_mut(&swap.tokenOut) {
                    *b = b
                        .checked_sub(swap.tokenAmountOut)
                        .ok_or_else(|| eyre!("LOG_SWAP drains more than cached balance of {}", swap.tokenOut))?;
                }
                let tokens = state.tokens.clone();
                observation.mark_all_with(&swap.tokenIn, &tokens);
                observation.mark_all_with(&swap.tokenOut, &tokens);
            } else if *topic0 == IBPool::LOG_JOIN::SIGNATURE_HASH {
                let join = IBPool::LOG_JOIN::decode_log_data(log.data())?;
                if let Some(b) = state.balances.get_mut(&join.tokenIn) {
                    *b += join.tokenAmountIn;
                }
                let tokens = state.tokens.clone();
                observation.mark_all_with(&join.tokenIn, &tokens);
            } else if *topic0 == IBPool::LOG_EXIT::SIGNATURE_HASH {
                let exit = IBPool::LOG_EXIT::decode_log_data(log.data())?;
                if let Some(b) = state.balances.get_mut(&exit.tokenOut) {
                    *b = b
                        .checked_sub(exit.tokenAmountOut)
                        .ok_or_else(|| eyre!("LOG_EXIT drains more than cached balance of {}", exit.tokenOut))?;
                }
                let tokens = state.tokens.clone();
                observation.mark_all_with(&exit.tokenOut, &tokens);
            } else if Self::is_reload_call(topic0.as_slice()) {
                tracing::debug!(pool = %self.address, "Balancer V1 admin call, dropping cache");
                state.balances.clear();
                state.weights.clear();
                state.swap_fee = None;
                state.tokens_stale = true;
                let tokens = state.tokens.clone();
                for t in &tokens {
                    observation.mark_all_with(t, &tokens);
                }
            }
        }

        Ok(observation)
    }

    fn clone_without_cache(&self) -> Arc<dyn ExchangePricer> {
        Arc::new(Self::new(self.provider.clone(), self.address, self.tokens()))
    }
}
