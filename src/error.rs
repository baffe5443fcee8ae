use alloy::primitives::{Address, B256, I256, U256};
use alloy::transports::{RpcError, TransportError};
use thiserror::Error;

/// Domain failures raised inside `eyre::Report`s; callers recover them with `downcast_ref`.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("not enough liquidity in {exchange}: input exceeds cap by {excess}")]
    NotEnoughLiquidity { exchange: Address, excess: U256 },

    #[error("token {token} is not available on {exchange}")]
    TokenNotAvailable { exchange: Address, token: Address },

    #[error("unknown exchange {0}")]
    UnknownExchange(Address),

    #[error("negative realized profit {profit} for candidate {candidate_id}")]
    NegativeProfit { candidate_id: i64, profit: I256 },

    #[error("could not diagnose failure of candidate {candidate_id} (tx {tx_hash})")]
    Undiagnosable { candidate_id: i64, tx_hash: B256 },

    #[error("refusing to ban well-known token {0}")]
    KnownTokenBanned(Address),

    #[error("campaign invariant violated: {0}")]
    CampaignInvariant(String),

    #[error("snapshot {0} could not be reverted")]
    SnapshotRevertFailed(U256),

    #[error("sandbox error: {0}")]
    Sandbox(String),
}

impl RelayError {
    pub fn from_report(report: &eyre::Report) -> Option<&RelayError> {
        report.downcast_ref::<RelayError>()
    }
}

/// Whether a failure came from infrastructure (connection, timeout) rather than the data.
///
/// Transient failures are retried under [`crate::retry::Backoff`] after the connections are rebuilt.
pub fn is_transient(report: &eyre::Report) -> bool {
    for cause in report.chain() {
        if let Some(err) = cause.downcast_ref::<TransportError>() {
            if matches!(err, RpcError::Transport(_)) {
                return true;
            }
        }
        if let Some(alloy::contract::Error::TransportError(RpcError::Transport(_))) =
            cause.downcast_ref::<alloy::contract::Error>()
        {
            return true;
        }
        if let Some(err) = cause.downcast_ref::<sqlx::Error>() {
            if matches!(
                err,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed
            ) {
                return true;
            }
        }
        if let Some(err) = cause.downcast_ref::<reqwest::Error>() {
            if err.is_timeout() || err.is_connect() {
                return true;
            }
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return true;
        }
        if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return true;
        }
    }
    false
}
