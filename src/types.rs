//! Common types used throughout the bundle guard

use crate::errors::GuardError;
use serde::{Deserialize, Serialize};
use solana_sdk::{
    hash::Hash,
    instruction::{AccountMeta, Instruction},
    message::{Message, VersionedMessage},
    pubkey::Pubkey,
    transaction::{Transaction, VersionedTransaction},
};

/// Severity attached to every rule verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
        }
    }
}

/// Recent blockhash plus the expiry height and the slot it was fetched at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityToken {
    #[serde(with = "display_fromstr")]
    pub blockhash: Hash,
    pub last_valid_block_height: u64,
    pub issued_at_slot: u64,
}

impl ValidityToken {
    pub fn new(blockhash: Hash, last_valid_block_height: u64, issued_at_slot: u64) -> Self {
        Self {
            blockhash,
            last_valid_block_height,
            issued_at_slot,
        }
    }

    /// Slots elapsed since the token was fetched
    pub fn age_at(&self, current_slot: u64) -> u64 {
        current_slot.saturating_sub(self.issued_at_slot)
    }
}

/// An unsigned transaction under validation
///
/// Values are immutable: rebinding the validity token or fee payer returns
/// a new transaction, so an original and its assertion companion never
/// share mutable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleTransaction {
    instructions: Vec<Instruction>,
    fee_payer: Option<Pubkey>,
    validity_token: Option<ValidityToken>,
}

impl BundleTransaction {
    pub fn new(instructions: Vec<Instruction>, fee_payer: Option<Pubkey>) -> Self {
        Self {
            instructions,
            fee_payer,
            validity_token: None,
        }
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn fee_payer(&self) -> Option<Pubkey> {
        self.fee_payer
    }

    pub fn validity_token(&self) -> Option<&ValidityToken> {
        self.validity_token.as_ref()
    }

    /// Return a copy of this transaction bound to `token`
    pub fn with_validity_token(&self, token: ValidityToken) -> Self {
        Self {
            instructions: self.instructions.clone(),
            fee_payer: self.fee_payer,
            validity_token: Some(token),
        }
    }

    /// Distinct accounts referenced by instruction account metas, in order of first use
    pub fn distinct_accounts(&self) -> Vec<Pubkey> {
        use itertools::Itertools;

        self.instructions
            .iter()
            .flat_map(|ix| ix.accounts.iter().map(|meta| meta.pubkey))
            .unique()
            .collect()
    }

    /// Fee payer first, then every writable account in instruction order, de-duplicated
    pub fn writable_accounts(&self) -> Vec<Pubkey> {
        use itertools::Itertools;

        self.fee_payer
            .into_iter()
            .chain(
                self.instructions
                    .iter()
                    .flat_map(|ix| ix.accounts.iter())
                    .filter(|meta| meta.is_writable)
                    .map(|meta| meta.pubkey),
            )
            .unique()
            .collect()
    }

    /// Build an unsigned legacy transaction for simulation
    ///
    /// Signature slots are filled with default signatures, so the node must
    /// simulate with signature verification disabled.
    pub fn to_versioned(&self) -> Result<VersionedTransaction, GuardError> {
        let fee_payer = self
            .fee_payer
            .ok_or_else(|| GuardError::constraint("transaction has no fee payer"))?;
        let token = self
            .validity_token
            .ok_or_else(|| GuardError::constraint("transaction has no validity token"))?;

        let message =
            Message::new_with_blockhash(&self.instructions, Some(&fee_payer), &token.blockhash);
        Ok(VersionedTransaction::from(Transaction::new_unsigned(message)))
    }

    /// Decompile a versioned transaction into instruction form
    ///
    /// Only static account keys are supported; messages that load accounts
    /// through address lookup tables are rejected. The validity token is left
    /// unset because the expiry height is not part of the message.
    pub fn from_versioned(tx: &VersionedTransaction) -> Result<Self, GuardError> {
        let message = &tx.message;
        let keys = message.static_account_keys();
        let header = message.header();

        if let VersionedMessage::V0(v0) = message {
            if !v0.address_table_lookups.is_empty() {
                return Err(GuardError::constraint(
                    "address lookup tables are not supported",
                ));
            }
        }

        let num_signed = header.num_required_signatures as usize;
        let writable_signed = num_signed.saturating_sub(header.num_readonly_signed_accounts as usize);
        let writable_unsigned_end =
            keys.len().saturating_sub(header.num_readonly_unsigned_accounts as usize);

        let meta_for = |index: usize| -> Result<AccountMeta, GuardError> {
            let pubkey = *keys.get(index).ok_or_else(|| {
                GuardError::constraint(format!("account index {} out of range", index))
            })?;
            let is_signer = index < num_signed;
            let is_writable = if is_signer {
                index < writable_signed
            } else {
                index < writable_unsigned_end
            };
            Ok(AccountMeta {
                pubkey,
                is_signer,
                is_writable,
            })
        };

        let mut instructions = Vec::with_capacity(message.instructions().len());
        for compiled in message.instructions() {
            let program_id = *keys
                .get(compiled.program_id_index as usize)
                .ok_or_else(|| GuardError::constraint("program id index out of range"))?;
            let accounts = compiled
                .accounts
                .iter()
                .map(|&i| meta_for(i as usize))
                .collect::<Result<Vec<_>, _>>()?;
            instructions.push(Instruction {
                program_id,
                accounts,
                data: compiled.data.clone(),
            });
        }

        let fee_payer = if num_signed > 0 { keys.first().copied() } else { None };
        Ok(Self::new(instructions, fee_payer))
    }
}

/// Point-in-time view of an on-chain account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub address: Pubkey,
    pub lamports: u64,
    pub owner: Pubkey,
    pub data: Vec<u8>,
    pub executable: bool,
}

/// SPL token account view derived from an [`AccountSnapshot`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAccountSnapshot {
    pub account: AccountSnapshot,
    pub mint: Pubkey,
    /// Wallet that owns the tokens (not the owning program)
    pub token_owner: Pubkey,
    pub amount: u64,
    pub delegate: Option<Pubkey>,
    pub delegated_amount: u64,
}

/// Account owned by the system program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemAccountSnapshot {
    pub account: AccountSnapshot,
}

/// Serde adapter for types with `Display` + `FromStr` (pubkeys, hashes)
pub mod display_fromstr {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};
    use std::{fmt::Display, str::FromStr};

    pub fn serialize<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
