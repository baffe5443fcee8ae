//! Anvil fork processes
//!
//! Every sandbox forks the upstream archive node at one block, in its own temp
//! directory and on its own port. The funded account below has no history on the
//! forked chain, so its first deployment (the relay contract) lands at the same
//! address in every sandbox.

use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{b256, Address, Bytes, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{BlockId, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolCall;
use alloy::transports::RpcError;
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{RelayReceipt, SandboxRpc};
use crate::config::{relayer_weth_float, RelayConfig, PORTS_PER_SLICE, SANDBOX_CHAIN_ID, WETH};
use crate::erc20::{IWETH, IERC20};
use crate::error::RelayError;
use crate::retry::retry_async;
use crate::simulation::trace::CallFrame;

/// Key of the account that deploys and funds the relay contract inside sandboxes
const SANDBOX_ACCOUNT_KEY: B256 = b256!("7c2d9f4a1b3e5c6d8f0a2b4c6d8e0f1a3b5c7d9e1f2a4b6c8d0e2f4a6b8c0d1e");

/// Ether given to the sandbox account: the WETH float plus gas
const SANDBOX_ACCOUNT_ETH: u64 = 20_000;

const DEPLOY_GAS_LIMIT: u64 = 6_000_000;
const SETUP_GAS_LIMIT: u64 = 200_000;

const READY_ATTEMPTS: usize = 12;
const READY_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Relay contract address shared by every sandbox
pub fn sandbox_relayer_address() -> Result<Address> {
    Ok(sandbox_signer()?.address().create(0))
}

fn sandbox_signer() -> Result<PrivateKeySigner> {
    PrivateKeySigner::from_bytes(&SANDBOX_ACCOUNT_KEY).map_err(|e| eyre!("invalid sandbox key: {e}"))
}

/// Creation bytecode from a compiled contract JSON.
///
/// Accepts both `"bytecode": "0x.."` and `"bytecode": {"object": "0x.."}`.
pub fn load_relayer_bytecode(path: &Path) -> Result<Bytes> {
    let raw = std::fs::read_to_string(path).wrap_err_with(|| format!("reading {}", path.display()))?;
    parse_relayer_bytecode(&raw)
}

fn parse_relayer_bytecode(raw: &str) -> Result<Bytes> {
    let artifact: serde_json::Value = serde_json::from_str(raw)?;
    let code = match &artifact["bytecode"] {
        serde_json::Value::String(s) => s.as_str(),
        serde_json::Value::Object(o) => o
            .get("object")
            .and_then(|v| v.as_str())
            .ok_or_else(|| eyre!("artifact bytecode object has no `object` field"))?,
        _ => return Err(eyre!("artifact has no bytecode")),
    };
    let bytes = hex::decode(code.trim_start_matches("0x"))?;
    if bytes.is_empty() {
        return Err(eyre!("artifact bytecode is empty"));
    }
    Ok(bytes.into())
}

/// Hands out ports from disjoint per-slice ranges, rotating within a slice so a
/// port released by a dying process is not reused immediately
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    offsets: Mutex<HashMap<u16, u16>>,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self {
            base,
            offsets: Mutex::new(HashMap::new()),
        }
    }

    pub fn next(&self, slice: u16) -> u16 {
        let mut offsets = self.offsets.lock();
        let offset = offsets.entry(slice).or_insert(0);
        let port = self.base + slice * PORTS_PER_SLICE + *offset;
        *offset = (*offset + 1) % PORTS_PER_SLICE;
        port
    }
}

/// Everything needed to start sandboxes for one worker
#[derive(Debug)]
pub struct SandboxLauncher {
    bin: String,
    tmp_dir: Option<PathBuf>,
    fork_url: String,
    bytecode: Bytes,
    ports: PortAllocator,
}

impl SandboxLauncher {
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        Ok(Self {
            bin: config.sandbox_bin.clone(),
            tmp_dir: config.sandbox_tmp_dir.clone(),
            fork_url: config.web3_host.clone(),
            bytecode: load_relayer_bytecode(&config.relayer_artifact)?,
            ports: PortAllocator::new(config.sandbox_port_base),
        })
    }

    /// Fork at the end of `block`, on a port from `slice`
    pub async fn open(&self, block: u64, slice: u16) -> Result<Sandbox> {
        let port = self.ports.next(slice);
        Sandbox::open(self, block, port).await
    }
}

/// A running anvil fork with the relay contract deployed and funded.
///
/// The process is killed and reaped, and its directory removed, exactly once when
/// the value is dropped.
#[derive(Debug)]
pub struct Sandbox {
    child: Option<Child>,
    provider: DynProvider,
    account: Address,
    relayer: Address,
    block: u64,
    port: u16,
    // dropped after the process is gone
    _dir: TempDir,
}

impl Sandbox {
    async fn open(launcher: &SandboxLauncher, block: u64, port: u16) -> Result<Self> {
        let dir = match &launcher.tmp_dir {
            Some(root) => tempfile::Builder::new().prefix("sandbox-").tempdir_in(root)?,
            None => tempfile::Builder::new().prefix("sandbox-").tempdir()?,
        };
        let child = Command::new(&launcher.bin)
            .args([
                "--fork-url",
                &launcher.fork_url,
                "--fork-block-number",
                &block.to_string(),
                "--port",
                &port.to_string(),
                "--chain-id",
                &SANDBOX_CHAIN_ID.to_string(),
                "--no-storage-caching",
                "--silent",
            ])
            .current_dir(dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .wrap_err_with(|| format!("spawning {}", launcher.bin))?;

        let signer = sandbox_signer()?;
        let account = signer.address();
        let url: reqwest::Url = format!("http://127.0.0.1:{port}").parse()?;
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url)
            .erased();

        // from here on every error path drops `sandbox`, which tears the process down
        let sandbox = Self {
            child: Some(child),
            provider,
            account,
            relayer: account.create(0),
            block,
            port,
            _dir: dir,
        };
        sandbox.wait_ready().await?;
        sandbox.setup_relayer(&launcher.bytecode).await?;
        info!(block, port, relayer = %sandbox.relayer, "Sandbox ready");
        Ok(sandbox)
    }

    pub fn block(&self) -> u64 {
        self.block
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    async fn wait_ready(&self) -> Result<()> {
        let provider = self.provider.clone();
        let chain_id = retry_async(
            |_| {
                let provider = provider.clone();
                async move { provider.get_chain_id().await }
            },
            READY_ATTEMPTS,
            READY_INITIAL_DELAY,
        )
        .await
        .map_err(|e| RelayError::Sandbox(format!("port {} never became ready: {e}", self.port)))?;
        if chain_id != SANDBOX_CHAIN_ID {
            return Err(RelayError::Sandbox(format!("unexpected chain id {chain_id}")).into());
        }
        Ok(())
    }

    async fn next_nonce(&self) -> Result<u64> {
        Ok(self.provider.get_transaction_count(self.account).pending().await?)
    }

    /// Transaction from the sandbox account with every field set up front
    async fn transaction(&self, gas: u64) -> Result<TransactionRequest> {
        let gas_price = self.provider.get_gas_price().await?;
        Ok(TransactionRequest::default()
            .from(self.account)
            .gas_limit(gas)
            .nonce(self.next_nonce().await?)
            .max_fee_per_gas(gas_price * 2)
            .max_priority_fee_per_gas(0)
            .with_chain_id(SANDBOX_CHAIN_ID))
    }

    async fn send_and_confirm(&self, tx: TransactionRequest, what: &str) -> Result<()> {
        let receipt = self.provider.send_transaction(tx).await?.get_receipt().await?;
        if !receipt.status() {
            return Err(RelayError::Sandbox(format!("{what} reverted in tx {}", receipt.transaction_hash)).into());
        }
        Ok(())
    }

    /// Fund the account, deploy the relay contract and hand it the WETH float
    async fn setup_relayer(&self, bytecode: &Bytes) -> Result<()> {
        let float = relayer_weth_float();
        let funding = U256::from(SANDBOX_ACCOUNT_ETH) * U256::from(10u64).pow(U256::from(18));
        self.provider
            .client()
            .request::<_, serde_json::Value>("anvil_setBalance", (self.account, funding))
            .await?;

        let nonce = self.next_nonce().await?;
        if nonce != 0 {
            return Err(RelayError::Sandbox(format!("sandbox account has nonce {nonce}, relayer address would move")).into());
        }
        let deploy = self.transaction(DEPLOY_GAS_LIMIT).await?.with_deploy_code(bytecode.clone());
        self.send_and_confirm(deploy, "relayer deployment").await?;

        let deposit = self
            .transaction(SETUP_GAS_LIMIT)
            .await?
            .to(WETH)
            .value(float)
            .input(IWETH::depositCall {}.abi_encode().into());
        self.send_and_confirm(deposit, "WETH deposit").await?;

        let transfer = self
            .transaction(SETUP_GAS_LIMIT)
            .await?
            .to(WETH)
            .input(IWETH::transferCall { to: self.relayer, amount: float }.abi_encode().into());
        self.send_and_confirm(transfer, "WETH transfer to relayer").await?;

        let held = IERC20::new(WETH, self.provider.clone()).balanceOf(self.relayer).call().await?;
        if held != float {
            return Err(RelayError::Sandbox(format!("relayer holds {held} WETH after setup")).into());
        }
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(mut child) = self.child.take() {
            stop_process(&mut child, self.port);
            debug!(block = self.block, port = self.port, "Sandbox stopped");
        }
    }
}

/// Signal `child` to exit without blocking; one still running is reaped by the runtime once dropped
fn stop_process(child: &mut Child, port: u16) {
    if let Err(e) = child.start_kill() {
        warn!(port, "Failed to kill sandbox: {e}");
    }
    match child.try_wait() {
        Ok(Some(status)) => debug!(port, %status, "Sandbox process exited"),
        Ok(None) => debug!(port, "Sandbox process exiting"),
        Err(e) => warn!(port, "Failed to reap sandbox: {e}"),
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[async_trait]
impl SandboxRpc for Sandbox {
    fn relayer(&self) -> Address {
        self.relayer
    }

    fn provider(&self) -> DynProvider {
        self.provider.clone()
    }

    async fn snapshot(&self) -> Result<U256> {
        Ok(self.provider.client().request::<_, U256>("evm_snapshot", ()).await?)
    }

    async fn revert(&self, id: U256) -> Result<bool> {
        Ok(self.provider.client().request::<_, bool>("evm_revert", (id,)).await?)
    }

    async fn set_automine(&self, enabled: bool) -> Result<()> {
        self.provider
            .client()
            .request::<_, serde_json::Value>("evm_setAutomine", (enabled,))
            .await?;
        Ok(())
    }

    async fn mine(&self, timestamp: Option<u64>) -> Result<()> {
        let client = self.provider.client();
        match timestamp {
            Some(ts) => client.request::<_, serde_json::Value>("evm_mine", (ts,)).await?,
            None => client.request::<_, serde_json::Value>("evm_mine", ()).await?,
        };
        Ok(())
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn trace_transaction(&self, tx_hash: B256) -> Result<CallFrame> {
        let options = serde_json::json!({ "tracer": "callTracer" });
        Ok(self
            .provider
            .client()
            .request::<_, CallFrame>("debug_traceTransaction", (tx_hash, options))
            .await?)
    }

    async fn balance_of(&self, token: Address, owner: Address, block: u64) -> Result<Option<U256>> {
        let erc20 = IERC20::new(token, self.provider.clone());
        match erc20.balanceOf(owner).block(BlockId::number(block)).call().await {
            Ok(balance) => Ok(Some(balance)),
            Err(
                alloy::contract::Error::TransportError(RpcError::ErrorResp(_))
                | alloy::contract::Error::ZeroData(..)
                | alloy::contract::Error::AbiError(_),
            ) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn send_transaction(&self, to: Address, input: Bytes, gas: u64) -> Result<B256> {
        let tx = self.transaction(gas).await?.to(to).input(input.into());
        let pending = self.provider.send_transaction(tx).await?;
        Ok(*pending.tx_hash())
    }

    async fn receipt(&self, tx_hash: B256) -> Result<RelayReceipt> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await?
            .ok_or_else(|| RelayError::Sandbox(format!("no receipt for {tx_hash}")))?;
        Ok(RelayReceipt {
            tx_hash,
            status: receipt.status(),
            gas_used: receipt.gas_used,
            block_number: receipt
                .block_number
                .ok_or_else(|| RelayError::Sandbox(format!("receipt for {tx_hash} has no block")))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_process_kills_child() {
        let mut child = Command::new("sleep").arg("30").kill_on_drop(true).spawn().unwrap();
        stop_process(&mut child, 0);
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
        // exited already: only logged
        stop_process(&mut child, 0);
    }

    #[test]
    fn test_ports_rotate_within_slice() {
        let ports = PortAllocator::new(10_000);
        assert_eq!(ports.next(0), 10_000);
        assert_eq!(ports.next(0), 10_001);
        assert_eq!(ports.next(3), 10_060);
        for _ in 2..PORTS_PER_SLICE {
            ports.next(0);
        }
        assert_eq!(ports.next(0), 10_000);
    }

    #[test]
    fn test_bytecode_from_both_artifact_shapes() {
        let flat = parse_relayer_bytecode(r#"{"bytecode": "0x6080"}"#).unwrap();
        assert_eq!(flat.to_vec(), vec![0x60, 0x80]);
        let nested = parse_relayer_bytecode(r#"{"bytecode": {"object": "6080"}}"#).unwrap();
        assert_eq!(nested, flat);
        assert!(parse_relayer_bytecode(r#"{"abi": []}"#).is_err());
        assert!(parse_relayer_bytecode(r#"{"bytecode": "0x"}"#).is_err());
    }

    #[test]
    fn test_relayer_address_is_stable() {
        let a = sandbox_relayer_address().unwrap();
        assert_eq!(a, sandbox_relayer_address().unwrap());
        assert_ne!(a, Address::ZERO);
    }

    /// Needs `anvil` on PATH and an archive node in WEB3_HOST
    #[tokio::test]
    #[ignore]
    async fn test_open_funds_relayer() {
        let _ = dotenvy::dotenv();
        let config = RelayConfig::from_env().unwrap();
        let launcher = SandboxLauncher::from_config(&config).unwrap();
        let upstream = ProviderBuilder::new().connect_http(config.web3_host.parse().unwrap());
        let block = upstream.get_block_number().await.unwrap() - 5;
        let sandbox = launcher.open(block, 0).await.unwrap();
        let head = sandbox.block_number().await.unwrap();
        let weth = sandbox.balance_of(WETH, sandbox.relayer(), head).await.unwrap();
        assert_eq!(weth, Some(relayer_weth_float()));
        let id = sandbox.snapshot().await.unwrap();
        assert!(sandbox.revert(id).await.unwrap());
    }
}
