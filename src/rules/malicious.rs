//! Malicious-pattern pass
//!
//! Runs independently of the rule battery. The orchestrator uses it to tell
//! an attack-like transaction apart from one that simply failed.

use crate::codec::{decode_compute_unit_limit, decode_system_transfer, is_compute_unit_limit, is_system_transfer};
use crate::config::RuleConfig;
use crate::rules::RuleId;
use crate::types::BundleTransaction;
use serde::{Deserialize, Serialize};

/// A detected attack-like pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum MaliciousPattern {
    ExcessiveComputeUnits { requested: u32, ceiling: u32 },
    TooManyInstructions { count: usize, max: usize },
    LargeSystemTransfer { lamports: u64, threshold: u64 },
}

impl MaliciousPattern {
    /// Rule the pattern is reported under
    pub fn rule(&self) -> RuleId {
        match self {
            Self::ExcessiveComputeUnits { .. } => RuleId::ComputeBudget,
            Self::TooManyInstructions { .. } => RuleId::Structure,
            Self::LargeSystemTransfer { .. } => RuleId::FeeManipulation,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::ExcessiveComputeUnits { requested, ceiling } => format!(
                "compute unit limit {} exceeds ceiling {}",
                requested, ceiling
            ),
            Self::TooManyInstructions { count, max } => {
                format!("{} instructions exceeds maximum {}", count, max)
            }
            Self::LargeSystemTransfer { lamports, threshold } => format!(
                "system transfer of {} lamports at or above {}",
                lamports, threshold
            ),
        }
    }
}

/// Heuristic detector for attack-like transactions
#[derive(Debug, Clone)]
pub struct MaliciousPatternDetector {
    compute_unit_ceiling: u32,
    max_instructions: usize,
    large_transfer_lamports: u64,
}

impl MaliciousPatternDetector {
    pub fn new(compute_unit_ceiling: u32, max_instructions: usize, large_transfer_lamports: u64) -> Self {
        Self {
            compute_unit_ceiling,
            max_instructions,
            large_transfer_lamports,
        }
    }

    pub fn from_config(config: &RuleConfig) -> Self {
        Self::new(
            config.compute_unit_ceiling(),
            config.max_instructions,
            config.large_transfer_lamports,
        )
    }

    /// First matching pattern, checked in the order compute, count, transfer
    pub fn detect(&self, tx: &BundleTransaction) -> Option<MaliciousPattern> {
        self.check_compute_units(tx)
            .or_else(|| self.check_instruction_count(tx))
            .or_else(|| self.check_large_transfer(tx))
    }

    pub fn check_compute_units(&self, tx: &BundleTransaction) -> Option<MaliciousPattern> {
        tx.instructions()
            .iter()
            .filter(|ix| is_compute_unit_limit(ix))
            .filter_map(|ix| decode_compute_unit_limit(ix).ok())
            .find(|units| *units > self.compute_unit_ceiling)
            .map(|requested| MaliciousPattern::ExcessiveComputeUnits {
                requested,
                ceiling: self.compute_unit_ceiling,
            })
    }

    pub fn check_instruction_count(&self, tx: &BundleTransaction) -> Option<MaliciousPattern> {
        let count = tx.instructions().len();
        (count > self.max_instructions).then_some(MaliciousPattern::TooManyInstructions {
            count,
            max: self.max_instructions,
        })
    }

    pub fn check_large_transfer(&self, tx: &BundleTransaction) -> Option<MaliciousPattern> {
        tx.instructions()
            .iter()
            .filter(|ix| is_system_transfer(ix))
            .filter_map(|ix| decode_system_transfer(ix).ok())
            .find(|transfer| transfer.lamports >= self.large_transfer_lamports)
            .map(|transfer| MaliciousPattern::LargeSystemTransfer {
                lamports: transfer.lamports,
                threshold: self.large_transfer_lamports,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_compute_unit_limit, encode_system_transfer};
    use solana_sdk::{instruction::Instruction, pubkey::Pubkey};

    fn detector() -> MaliciousPatternDetector {
        MaliciousPatternDetector::from_config(&RuleConfig::default())
    }

    #[test]
    fn test_clean_transfer_has_no_pattern() {
        let payer = Pubkey::new_unique();
        let tx = BundleTransaction::new(
            vec![
                encode_compute_unit_limit(150_000),
                encode_system_transfer(&payer, &Pubkey::new_unique(), 1_000_000),
            ],
            Some(payer),
        );
        assert_eq!(detector().detect(&tx), None);
    }

    #[test]
    fn test_excessive_compute_units() {
        let tx = BundleTransaction::new(vec![encode_compute_unit_limit(1_000_000)], None);
        let pattern = detector().detect(&tx).expect("should detect");
        assert_eq!(
            pattern,
            MaliciousPattern::ExcessiveComputeUnits {
                requested: 1_000_000,
                ceiling: 200_000
            }
        );
        assert_eq!(pattern.rule(), RuleId::ComputeBudget);
    }

    #[test]
    fn test_instruction_count_ceiling() {
        let memo = Pubkey::new_unique();
        let ixs = (0..11)
            .map(|i| Instruction::new_with_bytes(memo, &[i as u8], vec![]))
            .collect();
        let tx = BundleTransaction::new(ixs, None);
        assert!(matches!(
            detector().detect(&tx),
            Some(MaliciousPattern::TooManyInstructions { count: 11, max: 10 })
        ));
    }

    #[test]
    fn test_large_transfer() {
        let payer = Pubkey::new_unique();
        let tx = BundleTransaction::new(
            vec![encode_system_transfer(&payer, &Pubkey::new_unique(), 250_000_000_000)],
            Some(payer),
        );
        let pattern = detector().detect(&tx).unwrap();
        assert_eq!(pattern.rule(), RuleId::FeeManipulation);
        assert!(pattern.describe().contains("250000000000"));
    }
}
