//! Error types for bundle validation, simulation and submission
//!
//! The taxonomy mirrors the failure classes the engine distinguishes:
//! - Local decode failures, which rules convert into verdicts
//! - Rule rejections, split into ordinary and malicious-pattern failures
//! - Validity-window expiry, recoverable once per pass
//! - Bundle-shape violations caught before any network call
//! - External service failures (chain node, transport, persistence)

use crate::rules::RuleId;
use crate::types::Severity;
use thiserror::Error;

/// Error produced when a fixed-layout instruction payload cannot be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer too short or otherwise unreadable at the expected offsets
    #[error("Malformed instruction: {0}")]
    MalformedInstruction(String),

    /// Instruction is addressed to a different program than the decoder expects
    #[error("Wrong program: expected {expected}, got {actual}")]
    WrongProgram { expected: String, actual: String },

    /// Discriminant present but not the one this decoder reads
    #[error("Unexpected discriminant {found} (expected {expected})")]
    UnexpectedDiscriminant { expected: u32, found: u32 },
}

impl DecodeError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedInstruction(reason.into())
    }
}

/// Comprehensive error type for the bundle guard
///
/// Every user-visible rule failure carries the transaction index, the rule
/// and the severity so callers can render which transaction broke a bundle.
#[derive(Error, Debug)]
pub enum GuardError {
    /// A rule could not decode an instruction payload
    #[error("Malformed instruction at tx {index} (rule={rule}, severity=medium): {source}")]
    MalformedInstruction {
        index: usize,
        rule: RuleId,
        #[source]
        source: DecodeError,
    },

    /// A security rule rejected the transaction
    #[error("Security violation at tx {index} (rule={rule}, severity={severity}): {reason}")]
    SecurityViolation {
        index: usize,
        rule: RuleId,
        severity: Severity,
        reason: String,
    },

    /// The rejection matches an attack-like pattern rather than an ordinary failure
    #[error("Malicious pattern detected at tx {index} (rule={rule}): {reason}")]
    MaliciousPatternDetected {
        index: usize,
        rule: RuleId,
        reason: String,
    },

    /// The node simulated the transaction and it failed
    #[error("Simulation failed at tx {index}: {message}")]
    SimulationFailed { index: usize, message: String },

    /// Validity token too old and the single refresh attempt did not help
    #[error("Validity window expired: {0}")]
    ValidityWindowExpired(String),

    /// Signed transactions carry an expired blockhash; the validated set was
    /// re-bound to `blockhash` and must be signed again
    #[error("Bundle {bundle_id} re-bound to blockhash {blockhash}; re-sign and resubmit")]
    ResignRequired { bundle_id: String, blockhash: String },

    /// Assertion program not deployed on the target network
    #[error("Assertion program unavailable: {0}")]
    AssertionUnavailable(String),

    /// Bundle size or shape constraint violated
    #[error("Bundle constraint violation: {0}")]
    BundleConstraintViolation(String),

    /// Chain node, transport or persistence failure
    #[error("External service error ({service}, transient={transient}): {message}")]
    ExternalService {
        service: &'static str,
        transient: bool,
        message: String,
    },

    /// Bundle record state machine violation
    #[error("Invalid bundle transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// No record with this id in the current session
    #[error("Unknown bundle: {0}")]
    UnknownBundle(String),

    /// Configuration or validation error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A fatal error ended an orchestration pass; the record was marked failed
    #[error("Orchestration pass for bundle {bundle_id} aborted: {source}")]
    PassAborted {
        bundle_id: String,
        #[source]
        source: Box<GuardError>,
    },
}

impl GuardError {
    /// Check if this error is potentially retryable
    ///
    /// Retrying means starting a new orchestration pass (and a new record).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ExternalService { transient, .. } => *transient,
            Self::ValidityWindowExpired(_) => true,
            Self::ResignRequired { .. } => true,
            Self::PassAborted { source, .. } => source.is_retryable(),

            Self::MalformedInstruction { .. } => false,
            Self::SecurityViolation { .. } => false,
            Self::SimulationFailed { .. } => false,
            Self::MaliciousPatternDetected { .. } => false,
            Self::AssertionUnavailable(_) => false,
            Self::BundleConstraintViolation(_) => false,
            Self::InvalidTransition { .. } => false,
            Self::UnknownBundle(_) => false,
            Self::Configuration(_) => false,
        }
    }

    /// Get the error category for metrics and observability
    pub fn category(&self) -> &'static str {
        match self {
            Self::MalformedInstruction { .. } => "decode",
            Self::SecurityViolation { .. } => "security",
            Self::MaliciousPatternDetected { .. } => "malicious",
            Self::SimulationFailed { .. } => "simulation",
            Self::ValidityWindowExpired(_) => "validity_window",
            Self::ResignRequired { .. } => "validity_window",
            Self::AssertionUnavailable(_) => "assertion",
            Self::BundleConstraintViolation(_) => "constraint",
            Self::ExternalService { .. } => "external",
            Self::InvalidTransition { .. } => "state",
            Self::UnknownBundle(_) => "state",
            Self::Configuration(_) => "config",
            Self::PassAborted { source, .. } => source.category(),
        }
    }

    /// Severity of a rule failure, if this error came from a rule
    pub fn severity(&self) -> Option<Severity> {
        match self {
            Self::SecurityViolation { severity, .. } => Some(*severity),
            Self::MalformedInstruction { .. } => Some(Severity::Medium),
            Self::MaliciousPatternDetected { .. } => Some(Severity::High),
            Self::ValidityWindowExpired(_) => Some(Severity::High),
            Self::PassAborted { source, .. } => source.severity(),
            _ => None,
        }
    }
}

// Convenience constructors for common error scenarios
impl GuardError {
    pub fn constraint(reason: impl Into<String>) -> Self {
        Self::BundleConstraintViolation(reason.into())
    }

    pub fn chain_node(transient: bool, message: impl Into<String>) -> Self {
        Self::ExternalService {
            service: "chain-node",
            transient,
            message: message.into(),
        }
    }

    pub fn transport(transient: bool, message: impl Into<String>) -> Self {
        Self::ExternalService {
            service: "bundle-transport",
            transient,
            message: message.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::ExternalService {
            service: "persistence",
            transient: true,
            message: message.into(),
        }
    }

    /// Timeout on an external call; always transient
    pub fn timeout(service: &'static str, timeout_ms: u128) -> Self {
        Self::ExternalService {
            service,
            transient: true,
            message: format!("timed out after {}ms", timeout_ms),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GuardError::SecurityViolation {
            index: 1,
            rule: RuleId::AccountEnumeration,
            severity: Severity::Medium,
            reason: "12 distinct accounts".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Security violation at tx 1 (rule=account_enumeration, severity=medium): 12 distinct accounts"
        );

        let err = GuardError::constraint("bundle has 6 transactions (max 5)");
        assert_eq!(
            err.to_string(),
            "Bundle constraint violation: bundle has 6 transactions (max 5)"
        );
    }

    #[test]
    fn test_error_retryability() {
        assert!(GuardError::chain_node(true, "429").is_retryable());
        assert!(GuardError::timeout("chain-node", 5000).is_retryable());
        assert!(GuardError::ValidityWindowExpired("stale".into()).is_retryable());

        assert!(!GuardError::chain_node(false, "bad request").is_retryable());
        assert!(!GuardError::constraint("empty").is_retryable());
        assert!(!GuardError::MaliciousPatternDetected {
            index: 0,
            rule: RuleId::ComputeBudget,
            reason: "cu".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_pass_aborted_delegates_to_source() {
        let err = GuardError::PassAborted {
            bundle_id: "b1".into(),
            source: Box::new(GuardError::timeout("chain-node", 15_000)),
        };
        assert!(err.is_retryable());
        assert_eq!(err.category(), "external");
    }

    #[test]
    fn test_error_categories_and_severity() {
        assert_eq!(GuardError::constraint("x").category(), "constraint");
        assert_eq!(GuardError::persistence("x").category(), "external");
        assert_eq!(
            GuardError::MaliciousPatternDetected {
                index: 0,
                rule: RuleId::ComputeBudget,
                reason: "x".into(),
            }
            .severity(),
            Some(Severity::High)
        );
        assert_eq!(GuardError::constraint("x").severity(), None);
    }

    #[test]
    fn test_malformed_instruction_carries_rule() {
        let err = GuardError::MalformedInstruction {
            index: 2,
            rule: RuleId::ComputeBudget,
            source: DecodeError::malformed("compute unit price: expected at least 9 bytes, got 2"),
        };
        assert!(err.to_string().starts_with("Malformed instruction at tx 2 (rule=compute_budget"));
        assert_eq!(err.category(), "decode");
        assert_eq!(err.severity(), Some(Severity::Medium));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::malformed("expected 5 bytes, got 2");
        assert_eq!(err.to_string(), "Malformed instruction: expected 5 bytes, got 2");
    }
}
