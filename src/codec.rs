//! Fixed-layout instruction payload codec
//!
//! Decoders for the handful of instruction payloads the rule engine needs
//! to read:
//! - Compute budget: `u8` discriminant, then the typed value (LE)
//! - System transfer: `u32` LE discriminant `2`, then `u64` LE lamports
//! - SPL token: `u8` opcode at offset 0
//!
//! Every decoder checks the buffer length before reading a fixed offset and
//! returns [`DecodeError::MalformedInstruction`] instead of panicking.

use crate::errors::DecodeError;
use serde::{Deserialize, Serialize};
use solana_sdk::{
    compute_budget::{self, ComputeBudgetInstruction},
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
    system_program,
};

/// Compute budget discriminant for `SetComputeUnitLimit`
pub const COMPUTE_UNIT_LIMIT_DISCRIMINANT: u8 = 2;
/// Compute budget discriminant for `SetComputeUnitPrice`
pub const COMPUTE_UNIT_PRICE_DISCRIMINANT: u8 = 3;
/// System program discriminant for `Transfer`
pub const SYSTEM_TRANSFER_DISCRIMINANT: u32 = 2;

/// Decoded system transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemTransfer {
    pub from: Pubkey,
    pub to: Pubkey,
    pub lamports: u64,
}

/// SPL token instruction opcodes the engine distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenOpcode {
    InitializeMint,
    InitializeAccount,
    Transfer,
    Approve,
    Revoke,
    SetAuthority,
    MintTo,
    Burn,
    CloseAccount,
    FreezeAccount,
    ThawAccount,
    TransferChecked,
    ApproveChecked,
    MintToChecked,
    BurnChecked,
    Other(u8),
}

impl TokenOpcode {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => Self::InitializeMint,
            1 => Self::InitializeAccount,
            3 => Self::Transfer,
            4 => Self::Approve,
            5 => Self::Revoke,
            6 => Self::SetAuthority,
            7 => Self::MintTo,
            8 => Self::Burn,
            9 => Self::CloseAccount,
            10 => Self::FreezeAccount,
            11 => Self::ThawAccount,
            12 => Self::TransferChecked,
            13 => Self::ApproveChecked,
            14 => Self::MintToChecked,
            15 => Self::BurnChecked,
            other => Self::Other(other),
        }
    }

    /// Opcodes that move balance or hand over control of the source account
    pub fn is_transfer_like(&self) -> bool {
        matches!(
            self,
            Self::Transfer
                | Self::TransferChecked
                | Self::Approve
                | Self::ApproveChecked
                | Self::SetAuthority
                | Self::CloseAccount
                | Self::Burn
                | Self::BurnChecked
        )
    }
}

fn expect_program(ix: &Instruction, expected: &Pubkey) -> Result<(), DecodeError> {
    if ix.program_id != *expected {
        return Err(DecodeError::WrongProgram {
            expected: expected.to_string(),
            actual: ix.program_id.to_string(),
        });
    }
    Ok(())
}

fn expect_len(data: &[u8], needed: usize, what: &str) -> Result<(), DecodeError> {
    if data.len() < needed {
        return Err(DecodeError::malformed(format!(
            "{}: expected at least {} bytes, got {}",
            what,
            needed,
            data.len()
        )));
    }
    Ok(())
}

fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

/// True if this is a compute budget `SetComputeUnitLimit`, regardless of payload length
pub fn is_compute_unit_limit(ix: &Instruction) -> bool {
    ix.program_id == compute_budget::id()
        && ix.data.first() == Some(&COMPUTE_UNIT_LIMIT_DISCRIMINANT)
}

/// True if this instruction targets the system program with the transfer discriminant
pub fn is_system_transfer(ix: &Instruction) -> bool {
    ix.program_id == system_program::id()
        && ix.data.len() >= 4
        && read_u32_le(&ix.data, 0) == SYSTEM_TRANSFER_DISCRIMINANT
}

pub fn decode_compute_unit_limit(ix: &Instruction) -> Result<u32, DecodeError> {
    expect_program(ix, &compute_budget::id())?;
    expect_len(&ix.data, 1, "compute budget discriminant")?;
    if ix.data[0] != COMPUTE_UNIT_LIMIT_DISCRIMINANT {
        return Err(DecodeError::UnexpectedDiscriminant {
            expected: COMPUTE_UNIT_LIMIT_DISCRIMINANT as u32,
            found: ix.data[0] as u32,
        });
    }
    expect_len(&ix.data, 5, "compute unit limit")?;
    Ok(read_u32_le(&ix.data, 1))
}

pub fn decode_compute_unit_price(ix: &Instruction) -> Result<u64, DecodeError> {
    expect_program(ix, &compute_budget::id())?;
    expect_len(&ix.data, 1, "compute budget discriminant")?;
    if ix.data[0] != COMPUTE_UNIT_PRICE_DISCRIMINANT {
        return Err(DecodeError::UnexpectedDiscriminant {
            expected: COMPUTE_UNIT_PRICE_DISCRIMINANT as u32,
            found: ix.data[0] as u32,
        });
    }
    expect_len(&ix.data, 9, "compute unit price")?;
    Ok(read_u64_le(&ix.data, 1))
}

pub fn encode_compute_unit_limit(units: u32) -> Instruction {
    ComputeBudgetInstruction::set_compute_unit_limit(units)
}

pub fn decode_system_transfer(ix: &Instruction) -> Result<SystemTransfer, DecodeError> {
    expect_program(ix, &system_program::id())?;
    expect_len(&ix.data, 4, "system instruction discriminant")?;
    let discriminant = read_u32_le(&ix.data, 0);
    if discriminant != SYSTEM_TRANSFER_DISCRIMINANT {
        return Err(DecodeError::UnexpectedDiscriminant {
            expected: SYSTEM_TRANSFER_DISCRIMINANT,
            found: discriminant,
        });
    }
    expect_len(&ix.data, 12, "system transfer")?;
    if ix.accounts.len() < 2 {
        return Err(DecodeError::malformed(format!(
            "system transfer: expected 2 accounts, got {}",
            ix.accounts.len()
        )));
    }

    Ok(SystemTransfer {
        from: ix.accounts[0].pubkey,
        to: ix.accounts[1].pubkey,
        lamports: read_u64_le(&ix.data, 4),
    })
}

/// Build a system transfer without going through the deprecated SDK helper
pub fn encode_system_transfer(from: &Pubkey, to: &Pubkey, lamports: u64) -> Instruction {
    let mut data = Vec::with_capacity(12);
    data.extend_from_slice(&SYSTEM_TRANSFER_DISCRIMINANT.to_le_bytes());
    data.extend_from_slice(&lamports.to_le_bytes());

    Instruction {
        program_id: system_program::id(),
        accounts: vec![AccountMeta::new(*from, true), AccountMeta::new(*to, false)],
        data,
    }
}

pub fn decode_token_opcode(ix: &Instruction) -> Result<TokenOpcode, DecodeError> {
    expect_program(ix, &spl_token::id())?;
    expect_len(&ix.data, 1, "token opcode")?;
    Ok(TokenOpcode::from_byte(ix.data[0]))
}
