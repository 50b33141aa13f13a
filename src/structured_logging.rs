//! Structured lifecycle events for bundle records

use crate::errors::GuardError;
use crate::rules::RuleVerdict;

/// Emits bundle lifecycle events keyed by the record id
#[derive(Debug, Clone)]
pub struct BundleLogger {
    bundle_id: String,
}

impl BundleLogger {
    pub fn new(bundle_id: impl Into<String>) -> Self {
        Self {
            bundle_id: bundle_id.into(),
        }
    }

    pub fn bundle_id(&self) -> &str {
        &self.bundle_id
    }

    pub fn log_pass_started(&self, operation: &str, tx_count: usize, owner: &str) {
        tracing::info!(
            bundle_id = %self.bundle_id,
            operation = %operation,
            tx_count = tx_count,
            owner = %owner,
            "Bundle pass started"
        );
    }

    pub fn log_rule_failure(&self, index: usize, verdict: &RuleVerdict) {
        tracing::warn!(
            bundle_id = %self.bundle_id,
            index = index,
            rule = %verdict.rule,
            severity = %verdict.severity,
            malicious = verdict.malicious,
            reason = verdict.reason.as_deref().unwrap_or(""),
            "Transaction rejected by rule"
        );
    }

    pub fn log_bundle_resync(&self, blockhash: &str) {
        tracing::info!(
            bundle_id = %self.bundle_id,
            blockhash = %blockhash,
            "Bundle re-synchronized to refreshed validity token"
        );
    }

    pub fn log_assertions(&self, index: usize, entries: usize, flagged_empty: bool) {
        tracing::debug!(
            bundle_id = %self.bundle_id,
            index = index,
            entries = entries,
            flagged_empty = flagged_empty,
            "Assertions built"
        );
    }

    pub fn log_simulation(&self, index: usize, success: bool, message: Option<&str>) {
        if success {
            tracing::debug!(bundle_id = %self.bundle_id, index = index, "Simulation succeeded");
        } else {
            tracing::warn!(
                bundle_id = %self.bundle_id,
                index = index,
                message = message.unwrap_or(""),
                "Simulation failed"
            );
        }
    }

    pub fn log_transition(&self, from: &str, to: &str) {
        tracing::info!(
            bundle_id = %self.bundle_id,
            from = %from,
            to = %to,
            "Bundle status changed"
        );
    }

    pub fn log_pass_aborted(&self, error: &GuardError) {
        tracing::error!(
            bundle_id = %self.bundle_id,
            category = error.category(),
            retryable = error.is_retryable(),
            error = %error,
            "Bundle pass aborted"
        );
    }

    pub fn log_submitted(&self, signatures: &[String], latency_ms: u64) {
        tracing::info!(
            bundle_id = %self.bundle_id,
            tx_count = signatures.len(),
            first_signature = signatures.first().map(String::as_str).unwrap_or("-"),
            latency_ms = latency_ms,
            "Bundle submitted"
        );
    }

    pub fn log_persistence_error(&self, operation: &str, error: &GuardError) {
        tracing::warn!(
            bundle_id = %self.bundle_id,
            operation = %operation,
            error = %error,
            "Bundle record persistence failed, continuing"
        );
    }
}
