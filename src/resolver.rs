//! Account state resolution and classification
//!
//! Snapshots are fetched fresh on every call and returned by value. A node
//! error or timeout resolves to `None`: an unresolved account is not by
//! itself a validation failure.

use crate::chain::ChainNode;
use crate::types::{AccountSnapshot, SystemAccountSnapshot, TokenAccountSnapshot};
use futures::future::join_all;
use solana_sdk::{pubkey::Pubkey, system_program};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Size of an SPL token account
pub const TOKEN_ACCOUNT_LEN: usize = 165;

/// Result of classifying a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedAccount {
    Token(TokenAccountSnapshot),
    System(SystemAccountSnapshot),
    Program(AccountSnapshot),
    Unknown(AccountSnapshot),
}

impl ClassifiedAccount {
    pub fn snapshot(&self) -> &AccountSnapshot {
        match self {
            Self::Token(token) => &token.account,
            Self::System(system) => &system.account,
            Self::Program(snapshot) | Self::Unknown(snapshot) => snapshot,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::System(_) => "system",
            Self::Program(_) => "program",
            Self::Unknown(_) => "unknown",
        }
    }
}

fn read_pubkey(data: &[u8], offset: usize) -> Option<Pubkey> {
    let bytes: [u8; 32] = data.get(offset..offset + 32)?.try_into().ok()?;
    Some(Pubkey::new_from_array(bytes))
}

fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    let bytes: [u8; 8] = data.get(offset..offset + 8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// `COption<Pubkey>`: u32 LE tag (0 = None, 1 = Some) followed by 32 bytes
fn read_coption_pubkey(data: &[u8], offset: usize) -> Option<Option<Pubkey>> {
    let tag: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    match u32::from_le_bytes(tag) {
        0 => Some(None),
        1 => Some(Some(read_pubkey(data, offset + 4)?)),
        _ => None,
    }
}

/// Parse the SPL token account layout
///
/// mint[0..32] owner[32..64] amount[64..72] delegate[72..108]
/// state[108] is_native[109..121] delegated_amount[121..129]
/// close_authority[129..165]
pub fn parse_token_account(snapshot: &AccountSnapshot) -> Option<TokenAccountSnapshot> {
    if snapshot.owner != spl_token::id() || snapshot.data.len() != TOKEN_ACCOUNT_LEN {
        return None;
    }
    let data = &snapshot.data;

    // 0 = uninitialized
    let state = *data.get(108)?;
    if state == 0 || state > 2 {
        return None;
    }

    Some(TokenAccountSnapshot {
        account: snapshot.clone(),
        mint: read_pubkey(data, 0)?,
        token_owner: read_pubkey(data, 32)?,
        amount: read_u64(data, 64)?,
        delegate: read_coption_pubkey(data, 72)?,
        delegated_amount: read_u64(data, 121)?,
    })
}

/// Classify as token, system, program or unknown, in that order; never fails
pub fn classify(snapshot: &AccountSnapshot) -> ClassifiedAccount {
    if let Some(token) = parse_token_account(snapshot) {
        return ClassifiedAccount::Token(token);
    }
    if snapshot.owner == system_program::id() && !snapshot.executable {
        return ClassifiedAccount::System(SystemAccountSnapshot {
            account: snapshot.clone(),
        });
    }
    if snapshot.executable {
        return ClassifiedAccount::Program(snapshot.clone());
    }
    ClassifiedAccount::Unknown(snapshot.clone())
}

/// Fetches account snapshots with a bounded wait
#[derive(Clone)]
pub struct AccountStateResolver {
    node: Arc<dyn ChainNode>,
    timeout: Duration,
}

impl AccountStateResolver {
    pub fn new(node: Arc<dyn ChainNode>, timeout: Duration) -> Self {
        Self { node, timeout }
    }

    /// Fetch one account; errors and timeouts resolve to `None`
    pub async fn resolve(&self, address: &Pubkey) -> Option<AccountSnapshot> {
        match tokio::time::timeout(self.timeout, self.node.get_account_info(address)).await {
            Ok(Ok(snapshot)) => {
                if snapshot.is_none() {
                    debug!(account = %address, "Account not found");
                }
                snapshot
            }
            Ok(Err(e)) => {
                warn!(account = %address, error = %e, "Account resolution failed");
                None
            }
            Err(_) => {
                warn!(
                    account = %address,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Account resolution timed out, treating as unresolved"
                );
                None
            }
        }
    }

    /// Resolve many accounts concurrently, preserving input order
    pub async fn resolve_many(&self, addresses: &[Pubkey]) -> Vec<Option<AccountSnapshot>> {
        join_all(addresses.iter().map(|address| self.resolve(address))).await
    }

    /// Resolve and classify in one step
    pub async fn resolve_classified(&self, address: &Pubkey) -> Option<ClassifiedAccount> {
        self.resolve(address).await.map(|snapshot| classify(&snapshot))
    }
}
