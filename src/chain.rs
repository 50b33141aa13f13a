//! Chain-node client interface
//!
//! The engine only needs four node calls: account lookup, simulation, the
//! latest blockhash and the current slot. [`ChainNode`] abstracts them so
//! the orchestrator can run against a live RPC endpoint or a test double.

use crate::errors::GuardError;
use crate::types::AccountSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use solana_client::{
    client_error::ClientError, nonblocking::rpc_client::RpcClient,
    rpc_config::RpcSimulateTransactionConfig,
};
use solana_sdk::{
    commitment_config::CommitmentConfig, hash::Hash, pubkey::Pubkey,
    transaction::VersionedTransaction,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Latest blockhash and the block height after which it expires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatestBlockhash {
    pub blockhash: Hash,
    pub last_valid_block_height: u64,
}

/// Outcome of a node-side simulation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationOutcome {
    pub ok: bool,
    pub error: Option<String>,
    pub logs: Vec<String>,
    pub units_consumed: Option<u64>,
}

impl SimulationOutcome {
    pub fn success() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// The node rejected the transaction because its blockhash is no longer valid
    pub fn is_blockhash_expired(&self) -> bool {
        self.error.as_deref().is_some_and(|e| {
            let e = e.to_lowercase();
            e.contains("blockhashnotfound")
                || e.contains("blockhash not found")
                || e.contains("block height exceeded")
        })
    }
}

/// Chain-node operations consumed by the engine
#[async_trait]
pub trait ChainNode: Send + Sync {
    async fn get_account_info(&self, address: &Pubkey) -> Result<Option<AccountSnapshot>, GuardError>;

    async fn simulate_transaction(&self, tx: &VersionedTransaction) -> Result<SimulationOutcome, GuardError>;

    async fn get_latest_blockhash(&self) -> Result<LatestBlockhash, GuardError>;

    async fn get_slot(&self) -> Result<u64, GuardError>;
}

/// Classify a client error into a transient or fatal chain-node error
pub fn classify_client_error(err: &ClientError) -> GuardError {
    let text = err.to_string();
    let lower = text.to_lowercase();
    let transient = lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("429")
        || lower.contains("connection")
        || lower.contains("503")
        || lower.contains("502");
    GuardError::chain_node(transient, text)
}

/// [`ChainNode`] backed by the nonblocking Solana RPC client
pub struct SolanaRpcNode {
    client: Arc<RpcClient>,
    commitment: CommitmentConfig,
}

impl SolanaRpcNode {
    pub fn new(url: impl Into<String>, timeout: Duration, commitment: CommitmentConfig) -> Self {
        Self {
            client: Arc::new(RpcClient::new_with_timeout_and_commitment(
                url.into(),
                timeout,
                commitment,
            )),
            commitment,
        }
    }

    pub fn url(&self) -> String {
        self.client.url()
    }
}

#[async_trait]
impl ChainNode for SolanaRpcNode {
    async fn get_account_info(&self, address: &Pubkey) -> Result<Option<AccountSnapshot>, GuardError> {
        let response = self
            .client
            .get_account_with_commitment(address, self.commitment)
            .await
            .map_err(|e| classify_client_error(&e))?;

        Ok(response.value.map(|account| AccountSnapshot {
            address: *address,
            lamports: account.lamports,
            owner: account.owner,
            data: account.data,
            executable: account.executable,
        }))
    }

    async fn simulate_transaction(&self, tx: &VersionedTransaction) -> Result<SimulationOutcome, GuardError> {
        let config = RpcSimulateTransactionConfig {
            sig_verify: false,
            replace_recent_blockhash: false,
            commitment: Some(self.commitment),
            ..Default::default()
        };

        let response = self
            .client
            .simulate_transaction_with_config(tx, config)
            .await
            .map_err(|e| classify_client_error(&e))?;

        let value = response.value;
        debug!(
            err = ?value.err,
            units_consumed = ?value.units_consumed,
            "Simulation response"
        );

        Ok(SimulationOutcome {
            ok: value.err.is_none(),
            error: value.err.map(|e| format!("{:?}", e)),
            logs: value.logs.unwrap_or_default(),
            units_consumed: value.units_consumed,
        })
    }

    async fn get_latest_blockhash(&self) -> Result<LatestBlockhash, GuardError> {
        let (blockhash, last_valid_block_height) = self
            .client
            .get_latest_blockhash_with_commitment(self.commitment)
            .await
            .map_err(|e| classify_client_error(&e))?;

        Ok(LatestBlockhash {
            blockhash,
            last_valid_block_height,
        })
    }

    async fn get_slot(&self) -> Result<u64, GuardError> {
        self.client
            .get_slot_with_commitment(self.commitment)
            .await
            .map_err(|e| classify_client_error(&e))
    }
}
