//! Assertion companion transactions
//!
//! For a transaction that passed the rule battery, snapshot every writable
//! account and build a companion transaction carrying one instruction to the
//! assertion program. The program fails (and so fails the bundle) when any
//! asserted account has moved beyond tolerance after execution.

pub mod encoding;
pub mod strategy;

pub use encoding::{decode_entries, encode_entries, AssertionEntry, ASSERTION_LAYOUT_VERSION};
pub use strategy::{select_strategy, AssertionStrategy, StrategyKind};

use crate::config::AssertionConfig;
use crate::errors::GuardError;
use crate::resolver::{classify, AccountStateResolver, ClassifiedAccount};
use crate::types::{AccountSnapshot, BundleTransaction};
use serde::Serialize;
use sha2::{Digest, Sha256};
use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
    system_program,
};
use tracing::{debug, warn};

/// Outcome of building assertions for one transaction
#[derive(Debug, Clone, Serialize)]
pub struct AssertionResult {
    pub success: bool,
    pub failure_reason: Option<String>,
    #[serde(skip)]
    pub assertion_transaction: Option<BundleTransaction>,
    pub is_program_available: bool,
    pub strategy: StrategyKind,
    pub entries: Vec<AssertionEntry>,
    /// No account could be asserted; the transaction runs unprotected
    pub flagged_empty: bool,
}

impl AssertionResult {
    fn unavailable(strategy: StrategyKind, reason: String) -> Self {
        Self {
            success: false,
            failure_reason: Some(reason),
            assertion_transaction: None,
            is_program_available: false,
            strategy,
            entries: Vec::new(),
            flagged_empty: false,
        }
    }

    /// Encoded instruction data of the companion, if one was built
    pub fn payload(&self) -> Option<&[u8]> {
        self.assertion_transaction
            .as_ref()
            .and_then(|tx| tx.instructions().first())
            .map(|ix| ix.data.as_slice())
    }
}

fn sha256(bytes: &[u8]) -> Vec<u8> {
    Sha256::digest(bytes).to_vec()
}

/// Builds assertion companions
#[derive(Clone)]
pub struct AssertionBuilder {
    resolver: AccountStateResolver,
    program_id: Pubkey,
    relaxed: AssertionStrategy,
    strict: AssertionStrategy,
}

impl AssertionBuilder {
    pub fn new(
        resolver: AccountStateResolver,
        program_id: Pubkey,
        relaxed: AssertionStrategy,
        strict: AssertionStrategy,
    ) -> Self {
        Self {
            resolver,
            program_id,
            relaxed,
            strict,
        }
    }

    pub fn from_config(resolver: AccountStateResolver, config: &AssertionConfig) -> Result<Self, GuardError> {
        Ok(Self::new(
            resolver,
            config.program_pubkey()?,
            config.relaxed.clone(),
            config.strict.clone(),
        ))
    }

    pub fn program_id(&self) -> &Pubkey {
        &self.program_id
    }

    pub fn strategy(&self, kind: StrategyKind) -> &AssertionStrategy {
        match kind {
            StrategyKind::Relaxed => &self.relaxed,
            StrategyKind::Strict => &self.strict,
        }
    }

    /// The assertion program resolves and is executable
    pub async fn is_program_available(&self) -> bool {
        matches!(
            self.resolver.resolve(&self.program_id).await,
            Some(snapshot) if snapshot.executable
        )
    }

    pub async fn build_assertions(&self, tx: &BundleTransaction) -> AssertionResult {
        let kind = select_strategy(tx);

        if !self.is_program_available().await {
            warn!(program = %self.program_id, "Assertion program not available");
            return AssertionResult::unavailable(
                kind,
                format!("assertion program {} is not deployed", self.program_id),
            );
        }

        let accounts = tx.writable_accounts();
        let snapshots = self.resolver.resolve_many(&accounts).await;
        let strategy = self.strategy(kind);

        let entries: Vec<AssertionEntry> = snapshots
            .iter()
            .flatten()
            .map(|snapshot| self.entry_for(snapshot, strategy))
            .collect();

        let unresolved = accounts.len() - entries.len();
        if unresolved > 0 {
            debug!(unresolved, "Excluded unresolved accounts from assertions");
        }

        if entries.is_empty() {
            warn!("No assertable accounts; transaction proceeds without assertions");
            return AssertionResult {
                success: true,
                failure_reason: None,
                assertion_transaction: None,
                is_program_available: true,
                strategy: kind,
                entries,
                flagged_empty: true,
            };
        }

        let instruction = Instruction {
            program_id: self.program_id,
            accounts: entries
                .iter()
                .map(|e| AccountMeta::new_readonly(e.address, false))
                .collect(),
            data: encode_entries(&entries),
        };

        let mut companion = BundleTransaction::new(vec![instruction], tx.fee_payer());
        if let Some(token) = tx.validity_token() {
            companion = companion.with_validity_token(*token);
        }

        debug!(entries = entries.len(), strategy = ?kind, "Built assertion companion");
        AssertionResult {
            success: true,
            failure_reason: None,
            assertion_transaction: Some(companion),
            is_program_available: true,
            strategy: kind,
            entries,
            flagged_empty: false,
        }
    }

    fn entry_for(&self, snapshot: &AccountSnapshot, strategy: &AssertionStrategy) -> AssertionEntry {
        match classify(snapshot) {
            ClassifiedAccount::System(_) => AssertionEntry {
                address: snapshot.address,
                expected_balance: strategy.floor(snapshot.lamports),
                owner: strategy.require_owner_match.then(system_program::id),
                hash: Vec::new(),
            },
            ClassifiedAccount::Token(token) => AssertionEntry {
                address: snapshot.address,
                expected_balance: strategy.floor(token.amount),
                owner: strategy.require_owner_match.then_some(token.token_owner),
                hash: if strategy.require_delegate_match {
                    sha256(token.delegate.unwrap_or_default().as_ref())
                } else {
                    Vec::new()
                },
            },
            ClassifiedAccount::Program(_) | ClassifiedAccount::Unknown(_) => AssertionEntry {
                address: snapshot.address,
                expected_balance: strategy.floor(snapshot.lamports),
                owner: strategy.require_owner_match.then_some(snapshot.owner),
                hash: if strategy.require_data_match {
                    sha256(&snapshot.data)
                } else {
                    Vec::new()
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{token_transfer_ix, transfer_tx, MockChainNode};
    use crate::types::ValidityToken;
    use solana_sdk::hash::Hash;
    use std::sync::Arc;
    use std::time::Duration;

    fn builder(node: Arc<MockChainNode>) -> (AssertionBuilder, Pubkey) {
        let program = Pubkey::new_unique();
        let resolver = AccountStateResolver::new(node, Duration::from_secs(5));
        (
            AssertionBuilder::new(resolver, program, AssertionStrategy::relaxed(), AssertionStrategy::strict()),
            program,
        )
    }

    #[tokio::test]
    async fn test_program_unavailable() {
        let node = Arc::new(MockChainNode::new());
        let (builder, _) = builder(node);
        let payer = Pubkey::new_unique();

        let result = builder.build_assertions(&transfer_tx(&payer, &Pubkey::new_unique(), 1)).await;
        assert!(!result.success);
        assert!(!result.is_program_available);
        assert!(result.assertion_transaction.is_none());
    }

    #[tokio::test]
    async fn test_relaxed_transfer_assertions() {
        let node = Arc::new(MockChainNode::new());
        let (builder, program) = builder(node.clone());
        node.add_program(program);
        let payer = Pubkey::new_unique();
        let dest = Pubkey::new_unique();
        node.add_system_account(payer, 10_000_000);
        node.add_system_account(dest, 2_000);

        let token = ValidityToken::new(Hash::new_unique(), 99, 1);
        let tx = transfer_tx(&payer, &dest, 1_000).with_validity_token(token);
        let result = builder.build_assertions(&tx).await;

        assert!(result.success);
        assert_eq!(result.strategy, StrategyKind::Relaxed);
        assert_eq!(result.entries.len(), 2);
        assert_eq!(result.entries[0].address, payer);
        assert_eq!(result.entries[0].expected_balance, 9_500_000);
        assert_eq!(result.entries[0].owner, None);

        let companion = result.assertion_transaction.as_ref().unwrap();
        assert_eq!(companion.validity_token(), Some(&token));
        assert_eq!(companion.fee_payer(), Some(payer));
        assert_eq!(companion.instructions()[0].program_id, program);
        assert!(companion.instructions()[0].accounts.iter().all(|m| !m.is_writable));
        assert_eq!(decode_entries(result.payload().unwrap()).unwrap(), result.entries);
    }

    #[tokio::test]
    async fn test_strict_token_assertions() {
        let node = Arc::new(MockChainNode::new());
        let (builder, program) = builder(node.clone());
        node.add_program(program);
        let authority = Pubkey::new_unique();
        let source = Pubkey::new_unique();
        let dest = Pubkey::new_unique();
        node.add_system_account(authority, 5_000_000);
        node.add_token_account(source, Pubkey::new_unique(), authority, 1_000);

        let tx = BundleTransaction::new(
            vec![token_transfer_ix(&source, &dest, &authority, 10)],
            Some(authority),
        );
        let result = builder.build_assertions(&tx).await;

        assert_eq!(result.strategy, StrategyKind::Strict);
        // dest is unresolved and excluded
        assert_eq!(result.entries.len(), 2);
        let source_entry = &result.entries[1];
        assert_eq!(source_entry.address, source);
        assert_eq!(source_entry.expected_balance, 990);
        assert_eq!(source_entry.owner, Some(authority));
        assert_eq!(source_entry.hash.len(), 32);
        assert_eq!(result.entries[0].owner, Some(system_program::id()));
    }

    #[tokio::test]
    async fn test_zero_entries_flagged_empty() {
        let node = Arc::new(MockChainNode::new());
        let (builder, program) = builder(node.clone());
        node.add_program(program);
        let payer = Pubkey::new_unique();

        let result = builder.build_assertions(&transfer_tx(&payer, &Pubkey::new_unique(), 1)).await;
        assert!(result.success);
        assert!(result.flagged_empty);
        assert!(result.assertion_transaction.is_none());
        assert!(result.payload().is_none());
    }

    #[tokio::test]
    async fn test_build_is_idempotent() {
        let node = Arc::new(MockChainNode::new());
        let (builder, program) = builder(node.clone());
        node.add_program(program);
        let payer = Pubkey::new_unique();
        let dest = Pubkey::new_unique();
        node.add_system_account(payer, 42_000_000);
        node.add_system_account(dest, 7);
        let tx = transfer_tx(&payer, &dest, 100);

        let first = builder.build_assertions(&tx).await;
        let second = builder.build_assertions(&tx).await;
        assert_eq!(first.payload(), second.payload());
        assert!(first.payload().is_some());

        node.set_balance(&payer, 1);
        let third = builder.build_assertions(&tx).await;
        assert_ne!(first.payload(), third.payload());
    }
}
