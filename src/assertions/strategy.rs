//! Assertion strategy presets and selection

use crate::errors::GuardError;
use crate::types::BundleTransaction;
use serde::{Deserialize, Serialize};
use solana_sdk::{compute_budget, system_program};

use crate::codec::is_system_transfer;

const BPS_DENOMINATOR: u128 = 10_000;

/// How strictly post-execution account state is checked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionStrategy {
    /// Allowed drop below the snapshot balance, in percent
    pub balance_tolerance_percent: f64,
    #[serde(default)]
    pub require_owner_match: bool,
    #[serde(default)]
    pub require_delegate_match: bool,
    #[serde(default)]
    pub require_data_match: bool,
}

impl AssertionStrategy {
    /// For plain transfers: balance floors only
    pub fn relaxed() -> Self {
        Self {
            balance_tolerance_percent: 5.0,
            require_owner_match: false,
            require_delegate_match: false,
            require_data_match: false,
        }
    }

    pub fn strict() -> Self {
        Self {
            balance_tolerance_percent: 1.0,
            require_owner_match: true,
            require_delegate_match: true,
            require_data_match: true,
        }
    }

    pub fn validate(&self) -> Result<(), GuardError> {
        let pct = self.balance_tolerance_percent;
        if !pct.is_finite() || !(0.0..=100.0).contains(&pct) {
            return Err(GuardError::config(format!(
                "balance_tolerance_percent must be within 0..=100, got {}",
                pct
            )));
        }
        Ok(())
    }

    /// Tolerance in basis points
    pub fn tolerance_bps(&self) -> u64 {
        (self.balance_tolerance_percent.clamp(0.0, 100.0) * 100.0).round() as u64
    }

    /// `balance * (1 - tolerance)`, rounded down
    pub fn floor(&self, balance: u64) -> u64 {
        let keep = BPS_DENOMINATOR - self.tolerance_bps() as u128;
        ((balance as u128 * keep) / BPS_DENOMINATOR) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Relaxed,
    Strict,
}

/// Relaxed only when every instruction is a system transfer or compute budget
pub fn select_strategy(tx: &BundleTransaction) -> StrategyKind {
    let simple = tx.instructions().iter().all(|ix| {
        ix.program_id == compute_budget::id()
            || (ix.program_id == system_program::id() && is_system_transfer(ix))
    });
    if simple {
        StrategyKind::Relaxed
    } else {
        StrategyKind::Strict
    }
}
