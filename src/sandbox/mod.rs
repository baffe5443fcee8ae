//! Forked-chain sandboxes
//!
//! - `SandboxRpc`: the RPC surface the relay and diagnosis code drive
//! - `process`: an anvil fork owned by this worker, torn down on drop
//! - `window`: 11-slot ring of sandboxes keyed by block for the campaign search

pub mod process;
pub mod window;

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::DynProvider;
use async_trait::async_trait;
use eyre::Result;

use crate::simulation::trace::CallFrame;

pub use process::{PortAllocator, Sandbox};
pub use window::SandboxWindow;

/// Receipt fields the relay loop reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayReceipt {
    pub tx_hash: B256,
    pub status: bool,
    pub gas_used: u64,
    pub block_number: u64,
}

#[async_trait]
pub trait SandboxRpc: Send + Sync {
    /// Relay contract holding the WETH float
    fn relayer(&self) -> Address;

    /// Provider for pricer reads against the sandbox state
    fn provider(&self) -> DynProvider;

    async fn snapshot(&self) -> Result<U256>;

    /// `false` when the node no longer knows the snapshot
    async fn revert(&self, id: U256) -> Result<bool>;

    async fn set_automine(&self, enabled: bool) -> Result<()>;

    async fn mine(&self, timestamp: Option<u64>) -> Result<()>;

    async fn block_number(&self) -> Result<u64>;

    async fn trace_transaction(&self, tx_hash: B256) -> Result<CallFrame>;

    /// `None` when the `balanceOf` call itself reverts
    async fn balance_of(&self, token: Address, owner: Address, block: u64) -> Result<Option<U256>>;

    /// Send from the funded account that owns the relay contract; returns without mining
    async fn send_transaction(&self, to: Address, input: Bytes, gas: u64) -> Result<B256>;

    async fn receipt(&self, tx_hash: B256) -> Result<RelayReceipt>;
}
