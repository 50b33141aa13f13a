//! Bundle record and its status state machine
//!
//! ```text
//! pending ──► simulated ──► executed
//!    │            │
//!    └──► failed ◄┘
//! ```
//!
//! `executed` and `failed` are terminal. A retry creates a new record.

use crate::errors::GuardError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleStatus {
    Pending,
    Simulated,
    Executed,
    Failed,
}

impl BundleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleStatus::Pending => "pending",
            BundleStatus::Simulated => "simulated",
            BundleStatus::Executed => "executed",
            BundleStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BundleStatus::Executed | BundleStatus::Failed)
    }

    pub fn can_transition_to(&self, next: BundleStatus) -> bool {
        matches!(
            (self, next),
            (BundleStatus::Pending, BundleStatus::Simulated)
                | (BundleStatus::Pending, BundleStatus::Failed)
                | (BundleStatus::Simulated, BundleStatus::Executed)
                | (BundleStatus::Simulated, BundleStatus::Failed)
        )
    }
}

impl std::fmt::Display for BundleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent record of one bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleRecord {
    pub id: String,
    pub owner: String,
    pub status: BundleStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Serialized outcome of the latest pass
    pub last_result: serde_json::Value,
}

impl BundleRecord {
    pub fn new(owner: &Pubkey) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            status: BundleStatus::Pending,
            created_at: now,
            updated_at: now,
            last_result: serde_json::Value::Null,
        }
    }

    /// The only mutation path for a record
    pub fn transition(&mut self, next: BundleStatus, result: serde_json::Value) -> Result<(), GuardError> {
        if !self.status.can_transition_to(next) {
            return Err(GuardError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.last_result = result;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_is_pending() {
        let owner = Pubkey::new_unique();
        let record = BundleRecord::new(&owner);
        assert_eq!(record.status, BundleStatus::Pending);
        assert_eq!(record.owner, owner.to_string());
        assert!(Uuid::parse_str(&record.id).is_ok());
        assert_ne!(record.id, BundleRecord::new(&owner).id);
    }

    #[test]
    fn test_valid_transitions() {
        let mut record = BundleRecord::new(&Pubkey::new_unique());
        record
            .transition(BundleStatus::Simulated, serde_json::json!({"ok": true}))
            .unwrap();
        record.transition(BundleStatus::Executed, serde_json::Value::Null).unwrap();
        assert!(record.status.is_terminal());
        assert!(record.updated_at >= record.created_at);
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let mut record = BundleRecord::new(&Pubkey::new_unique());
        record.transition(BundleStatus::Failed, serde_json::Value::Null).unwrap();

        let err = record
            .transition(BundleStatus::Simulated, serde_json::Value::Null)
            .unwrap_err();
        assert!(matches!(err, GuardError::InvalidTransition { .. }));
        assert_eq!(err.to_string(), "Invalid bundle transition: failed -> simulated");
        assert_eq!(record.status, BundleStatus::Failed);
    }

    #[test]
    fn test_pending_cannot_execute() {
        let mut record = BundleRecord::new(&Pubkey::new_unique());
        assert!(record.transition(BundleStatus::Executed, serde_json::Value::Null).is_err());
        assert!(!BundleStatus::Pending.can_transition_to(BundleStatus::Pending));
    }
}
