use alloy::primitives::aliases::{U160, U24};
use alloy::primitives::{Address, U256};
use alloy::providers::DynProvider;
use alloy::rpc::types::{BlockId, Log};
use alloy::sol;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use eyre::Result;
use std::sync::Arc;

use super::{u256_to_f64, BlockObservation, ExchangePricer, PricerKind, SwapQuote};
use crate::config::UNISWAP_V3_QUOTER_V2;
use crate::erc20;
use crate::error::RelayError;

sol! {
    #[sol(rpc)]
    interface IQuoterV2 {
        struct QuoteExactInputSingleParams {
            address tokenIn;
            address tokenOut;
            uint256 amountIn;
            uint24 fee;
            uint160 sqrtPriceLimitX96;
        }

        function quoteExactInputSingle(QuoteExactInputSingleParams memory params)
            external
            returns (
                uint256 amountOut,
                uint160 sqrtPriceX96After,
                uint32 initializedTicksCrossed,
                uint256 gasEstimate
            );
    }
}

sol! {
    interface IUniswapV3PoolEvents {
        event Swap(address indexed sender, address indexed recipient, int256 amount0, int256 amount1, uint160 sqrtPriceX96, uint128 liquidity, int24 tick);
        event Mint(address sender, address indexed owner, int24 indexed tickLower, int24 indexed tickUpper, uint128 amount, uint256 amount0, uint256 amount1);
        event Burn(address indexed owner, int24 indexed tickLower, int24 indexed tickUpper, uint128 amount, uint256 amount0, uint256 amount1);
    }
}

/// Concentrated-liquidity pool priced through the on-chain QuoterV2; holds no cache
#[derive(Debug)]
pub struct UniswapV3Pricer {
    provider: DynProvider,
    address: Address,
    token0: Address,
    token1: Address,
    /// Fee in hundredths of a bip
    fee: u32,
}

impl UniswapV3Pricer {
    pub fn new(provider: DynProvider, address: Address, token0: Address, token1: Address, fee: u32) -> Self {
        Self {
            provider,
            address,
            token0,
            token1,
            fee,
        }
    }

    fn zero_for_one(&self, token_in: Address, token_out: Address) -> Result<bool> {
        if token_in == self.token0 && token_out == self.token1 {
            Ok(true)
        } else if token_in == self.token1 && token_out == self.token0 {
            Ok(false)
        } else {
            Err(RelayError::TokenNotAvailable {
                exchange: self.address,
                token: token_in,
            }
            .into())
        }
    }
}

/// Price of token1 in token0 units from a Q64.96 square-root price
pub fn price_from_sqrt_x96(sqrt_price_x96: U256) -> f64 {
    let sqrt = u256_to_f64(sqrt_price_x96) / 2_f64.powi(96);
    sqrt * sqrt
}

#[async_trait]
impl ExchangePricer for UniswapV3Pricer {
    fn address(&self) -> Address {
        self.address
    }

    fn kind(&self) -> PricerKind {
        PricerKind::UniswapV3
    }

    fn tokens(&self) -> Vec<Address> {
        vec![self.token0, self.token1]
    }

    async fn compute_output(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        block: u64,
        _timestamp: Option<u64>,
    ) -> Result<SwapQuote> {
        let zero_for_one = self.zero_for_one(token_in, token_out)?;
        if amount_in.is_zero() {
            return Ok(SwapQuote {
                amount_out: U256::ZERO,
                spot_price_after: 0.0,
            });
        }

        let quoter = IQuoterV2::new(UNISWAP_V3_QUOTER_V2, self.provider.clone());
        let params = IQuoterV2::QuoteExactInputSingleParams {
            tokenIn: token_in,
            tokenOut: token_out,
            amountIn: amount_in,
            fee: U24::from(self.fee),
            sqrtPriceLimitX96: U160::ZERO,
        };
        let result = quoter
            .quoteExactInputSingle(params)
            .block(BlockId::number(block))
            .call()
            .await?;

        let price = price_from_sqrt_x96(U256::from(result.sqrtPriceX96After));
        let spot_price_after = if zero_for_one {
            price
        } else if price > 0.0 {
            1.0 / price
        } else {
            0.0
        };

        Ok(SwapQuote {
            amount_out: result.amountOut,
            spot_price_after,
        })
    }

    async fn locked_value(&self, token: Address, block: u64) -> Result<U256> {
        erc20::balance_of(&self.provider, token, self.address, BlockId::number(block)).await
    }

    async fn observe_block(&self, logs: &[Log]) -> Result<BlockObservation> {
        let mut observation = BlockObservation::default();
        let touched = logs.iter().any(|log| {
            log.address() == self.address
                && matches!(
                    log.topics().first(),
                    Some(t) if *t == IUniswapV3PoolEvents::Swap::SIGNATURE_HASH
                        || *t == IUniswapV3PoolEvents::Mint::SIGNATURE_HASH
                        || *t == IUniswapV3PoolEvents::Burn::SIGNATURE_HASH
                )
        });
        if touched {
            observation.mark(self.token0, self.token1);
        }
        Ok(observation)
    }

    fn clone_without_cache(&self) -> Arc<dyn ExchangePricer> {
        Arc::new(Self::new(
            self.provider.clone(),
            self.address,
            self.token0,
            self.token1,
            self.fee,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricers::test_support::{offline_provider, rpc_log, token};
    use alloy::primitives::aliases::I24;
    use alloy::primitives::LogData;

    #[test]
    fn test_price_from_sqrt() {
        // sqrt price of exactly 1.0
        let one = U256::from(1u64) << 96;
        assert!((price_from_sqrt_x96(one) - 1.0).abs() < 1e-12);
        let two = U256::from(2u64) << 96;
        assert!((price_from_sqrt_x96(two) - 4.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_mint_marks_pair_and_foreign_logs_ignored() {
        let p = UniswapV3Pricer::new(offline_provider(), token(9), token(1), token(2), 3000);
        let mint = IUniswapV3PoolEvents::Mint {
            sender: token(5),
            owner: token(5),
            tickLower: I24::ZERO,
            tickUpper: I24::ZERO,
            amount: 1u128,
            amount0: U256::from(1u64),
            amount1: U256::from(1u64),
        };
        let unrelated = rpc_log(token(9), LogData::new_unchecked(vec![], Default::default()), 3);
        assert!(p.observe_block(&[unrelated]).await.unwrap().is_empty());

        let obs = p.observe_block(&[rpc_log(token(9), mint.encode_log_data(), 3)]).await.unwrap();
        assert!(obs.pairs_updated.contains(&(token(1), token(2))));
    }

    #[tokio::test]
    async fn test_zero_input_skips_quoter() {
        let p = UniswapV3Pricer::new(offline_provider(), token(9), token(1), token(2), 500);
        let q = p.compute_output(token(2), token(1), U256::ZERO, 1, None).await.unwrap();
        assert_eq!(q.amount_out, U256::ZERO);
    }
}
