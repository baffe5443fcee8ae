use alloy::primitives::{Address, U256};
use alloy::providers::DynProvider;
use alloy::rpc::types::{BlockId, Log};
use alloy::sol;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use eyre::{eyre, Result};
use parking_lot::Mutex;
use std::sync::Arc;

use super::{u256_to_f64, BlockObservation, ExchangePricer, PricerKind, SwapQuote};
use crate::error::RelayError;
use crate::math::constant_product;

sol! {
    #[sol(rpc)]
    interface IUniswapV2Pair {
        function getReserves() external view returns (uint112 reserve0, uint112 reserve1, uint32 blockTimestampLast);

        event Sync(uint112 reserve0, uint112 reserve1);
    }
}

/// Constant-product pair (Uniswap V2, Sushiswap, Shibaswap)
#[derive(Debug)]
pub struct UniswapV2Pricer {
    provider: DynProvider,
    address: Address,
    token0: Address,
    token1: Address,
    reserves: Mutex<Option<(U256, U256)>>,
}

impl UniswapV2Pricer {
    pub fn new(provider: DynProvider, address: Address, token0: Address, token1: Address) -> Self {
        Self {
            provider,
            address,
            token0,
            token1,
            reserves: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn with_reserves(self, reserve0: U256, reserve1: U256) -> Self {
        *self.reserves.lock() = Some((reserve0, reserve1));
        self
    }

    async fn reserves(&self, block: u64) -> Result<(U256, U256)> {
        let cached = *self.reserves.lock();
        if let Some(r) = cached {
            return Ok(r);
        }
        let pair = IUniswapV2Pair::new(self.address, self.provider.clone());
        let r = pair.getReserves().block(BlockId::number(block)).call().await?;
        let loaded = (U256::from(r.reserve0), U256::from(r.reserve1));
        *self.reserves.lock() = Some(loaded);
        Ok(loaded)
    }

    fn oriented(&self, token_in: Address, token_out: Address, reserves: (U256, U256)) -> Result<(U256, U256)> {
        if token_in == self.token0 && token_out == self.token1 {
            Ok(reserves)
        } else if token_in == self.token1 && token_out == self.token0 {
            Ok((reserves.1, reserves.0))
        } else {
            let token = if token_in == self.token0 || token_in == self.token1 { token_out } else { token_in };
            Err(RelayError::TokenNotAvailable {
                exchange: self.address,
                token,
            }
            .into())
        }
    }
}

#[async_trait]
impl ExchangePricer for UniswapV2Pricer {
    fn address(&self) -> Address {
        self.address
    }

    fn kind(&self) -> PricerKind {
        PricerKind::UniswapV2
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
        let reserves = self.reserves(block).await?;
        let (reserve_in, reserve_out) = self.oriented(token_in, token_out, reserves)?;
        let amount_out = constant_product::get_amount_out(amount_in, reserve_in, reserve_out)?;
        let spot = constant_product::spot_price_after(amount_in, amount_out, reserve_in, reserve_out)?;
        Ok(SwapQuote {
            amount_out,
            spot_price_after: u256_to_f64(spot) / 1e18,
        })
    }

    async fn locked_value(&self, token: Address, block: u64) -> Result<U256> {
        let (reserve0, reserve1) = self.reserves(block).await?;
        if token == self.token0 {
            Ok(reserve0)
        } else if token == self.token1 {
            Ok(reserve1)
        } else {
            Err(eyre!("token {token} not in pair {}", self.address))
        }
    }

    async fn observe_block(&self, logs: &[Log]) -> Result<BlockObservation> {
        let mut observation = BlockObservation::default();
        for log in logs {
            if log.address() != self.address || log.topics().first() != Some(&IUniswapV2Pair::Sync::SIGNATURE_HASH) {
                continue;
            }
            let sync = IUniswapV2Pair::Sync::decode_log_data(log.data())?;
            *self.reserves.lock() = Some((U256::from(sync.reserve0), U256::from(sync.reserve1)));
            observation.mark(self.token0, self.token1);
        }
        Ok(observation)
    }

    fn clone_without_cache(&self) -> Arc<dyn ExchangePricer> {
        Arc::new(Self::new(self.provider.clone(), self.address, self.token0, self.token1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricers::test_support::{offline_provider, rpc_log, token};
    use alloy::primitives::aliases::U112;

    fn pricer() -> UniswapV2Pricer {
        UniswapV2Pricer::new(offline_provider(), token(9), token(1), token(2))
            .with_reserves(U256::from(1000), U256::from(1000))
    }

    #[tokio::test]
    async fn test_compute_output_both_directions() {
        let p = pricer();
        let q = p.compute_output(token(1), token(2), U256::from(100), 1, None).await.unwrap();
        assert_eq!(q.amount_out, U256::from(90));
        let q = p.compute_output(token(2), token(1), U256::from(100), 1, None).await.unwrap();
        assert_eq!(q.amount_out, U256::from(90));
    }

    #[tokio::test]
    async fn test_unknown_token_is_domain_error() {
        let err = pricer()
            .compute_output(token(1), token(7), U256::from(1), 1, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::TokenNotAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_sync_event_replaces_reserves() {
        let p = pricer();
        let sync = IUniswapV2Pair::Sync {
            reserve0: U112::from(1100u64),
            reserve1: U112::from(910u64),
        };
        let other_pair = rpc_log(token(8), sync.encode_log_data(), 5);
        let ours = rpc_log(token(9), sync.encode_log_data(), 5);

        let obs = p.observe_block(&[other_pair]).await.unwrap();
        assert!(obs.is_empty());

        let obs = p.observe_block(&[ours]).await.unwrap();
        assert!(obs.pairs_updated.contains(&(token(1), token(2))));
        assert_eq!(p.locked_value(token(1), 5).await.unwrap(), U256::from(1100));
        assert_eq!(p.locked_value(token(2), 5).await.unwrap(), U256::from(910));
    }

    #[test]
    fn test_clone_drops_cache() {
        let p = pricer();
        let clone = p.clone_without_cache();
        assert_eq!(clone.address(), p.address());
        assert_eq!(clone.tokens(), vec![token(1), token(2)]);
    }
}
