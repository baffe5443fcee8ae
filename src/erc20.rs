use alloy::primitives::{Address, U256};
use alloy::providers::DynProvider;
use alloy::rpc::types::BlockId;
use alloy::sol;
use dashmap::DashMap;
use eyre::Result;

sol! {
    #[sol(rpc)]
    #[derive(Debug, PartialEq, Eq)]
    interface IERC20 {
        function transfer(address to, uint256 amount) external returns (bool);
        function transferFrom(address from, address to, uint256 amount) external returns (bool);
        function balanceOf(address owner) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
        function decimals() external view returns (uint8);

        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}

sol! {
    #[sol(rpc)]
    interface IWETH {
        function deposit() external payable;
        function transfer(address to, uint256 amount) external returns (bool);
        function balanceOf(address owner) external view returns (uint256);
    }
}

pub async fn balance_of(provider: &DynProvider, token: Address, owner: Address, block: BlockId) -> Result<U256> {
    let erc20 = IERC20::new(token, provider.clone());
    Ok(erc20.balanceOf(owner).block(block).call().await?)
}

/// Token decimals, read once per token for the life of the worker
#[derive(Debug, Default)]
pub struct TokenDecimals {
    cache: DashMap<Address, u8>,
}

impl TokenDecimals {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, provider: &DynProvider, token: Address) -> Result<u8> {
        if let Some(d) = self.cache.get(&token) {
            return Ok(*d);
        }
        let erc20 = IERC20::new(token, provider.clone());
        let decimals = erc20.decimals().call().await?;
        self.cache.insert(token, decimals);
        Ok(decimals)
    }

    pub fn insert(&self, token: Address, decimals: u8) {
        self.cache.insert(token, decimals);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::providers::{Provider, ProviderBuilder};

    #[tokio::test]
    async fn test_decimals_served_from_cache() {
        let provider = ProviderBuilder::new()
            .connect_http("http://127.0.0.1:1".parse().unwrap())
            .erased();
        let decimals = TokenDecimals::new();
        decimals.insert(crate::config::USDC, 6);
        assert_eq!(decimals.get(&provider, crate::config::USDC).await.unwrap(), 6);
    }
}
