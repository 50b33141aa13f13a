//! Security rule engine
//!
//! Every transaction runs through a fixed, ordered battery of rules. The
//! battery stops at the first high-severity failure; lower-severity failures
//! are collected and evaluation continues. Each rule is also callable on
//! its own.
//!
//! | # | Rule               | Failure severity |
//! |---|--------------------|------------------|
//! | 1 | structure          | high             |
//! | 2 | freshness          | high             |
//! | 3 | compute budget     | high (malicious) / medium (malformed) |
//! | 4 | account enumeration| medium           |
//! | 5 | program invocation | high             |
//! | 6 | fee manipulation   | medium           |
//! | 7 | rate limit         | medium           |
//! | 8 | token accounts     | high / medium (malformed) |

pub mod malicious;
pub mod rate_limit;

pub use malicious::{MaliciousPattern, MaliciousPatternDetector};
pub use rate_limit::RateLimiter;

use crate::chain::ChainNode;
use crate::codec::{
    decode_compute_unit_limit, decode_compute_unit_price, decode_system_transfer,
    decode_token_opcode, COMPUTE_UNIT_LIMIT_DISCRIMINANT, COMPUTE_UNIT_PRICE_DISCRIMINANT,
};
use crate::config::RuleConfig;
use crate::errors::{DecodeError, GuardError};
use crate::resolver::{AccountStateResolver, ClassifiedAccount};
use crate::types::{BundleTransaction, Severity, ValidityToken};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use solana_sdk::{compute_budget, pubkey::Pubkey, system_program};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Identifies a rule in verdicts, errors and metrics
///
/// The last three tag failures raised by the orchestrator after the battery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    Structure,
    Freshness,
    ComputeBudget,
    AccountEnumeration,
    ProgramInvocation,
    FeeManipulation,
    RateLimit,
    TokenAccounts,
    /// Assertion program missing or companion rejected
    Assertions,
    /// Node simulation reported an error
    Simulation,
    /// Failed because another transaction in the bundle was malicious
    BundlePolicy,
}

impl RuleId {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::Structure => "structure",
            RuleId::Freshness => "freshness",
            RuleId::ComputeBudget => "compute_budget",
            RuleId::AccountEnumeration => "account_enumeration",
            RuleId::ProgramInvocation => "program_invocation",
            RuleId::FeeManipulation => "fee_manipulation",
            RuleId::RateLimit => "rate_limit",
            RuleId::TokenAccounts => "token_accounts",
            RuleId::Assertions => "assertions",
            RuleId::Simulation => "simulation",
            RuleId::BundlePolicy => "bundle_policy",
        }
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one rule against one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleVerdict {
    pub rule: RuleId,
    pub is_valid: bool,
    pub reason: Option<String>,
    pub severity: Severity,
    /// Failure matches an attack pattern rather than an ordinary mistake
    pub malicious: bool,
    /// Set when the failure is an undecodable instruction payload
    #[serde(skip)]
    pub decode_error: Option<DecodeError>,
}

impl RuleVerdict {
    pub fn pass(rule: RuleId) -> Self {
        Self {
            rule,
            is_valid: true,
            reason: None,
            severity: Severity::Low,
            malicious: false,
            decode_error: None,
        }
    }

    /// Valid, with a note (e.g. the validity token was refreshed)
    pub fn pass_with(rule: RuleId, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::pass(rule)
        }
    }

    pub fn fail(rule: RuleId, severity: Severity, reason: impl Into<String>) -> Self {
        Self {
            rule,
            is_valid: false,
            reason: Some(reason.into()),
            severity,
            malicious: false,
            decode_error: None,
        }
    }

    /// Medium failure for the undecodable payload of instruction `instruction`
    pub fn malformed(rule: RuleId, instruction: usize, error: DecodeError) -> Self {
        Self {
            decode_error: Some(error.clone()),
            ..Self::fail(rule, Severity::Medium, format!("instruction {}: {}", instruction, error))
        }
    }

    pub fn malicious(rule: RuleId, reason: impl Into<String>) -> Self {
        Self {
            malicious: true,
            ..Self::fail(rule, Severity::High, reason)
        }
    }

    fn stops_battery(&self) -> bool {
        !self.is_valid && self.severity == Severity::High
    }
}

/// All verdicts for one transaction, plus the (possibly rebound) transaction
#[derive(Debug, Clone)]
pub struct TransactionVerdict {
    pub index: usize,
    pub transaction: BundleTransaction,
    pub verdicts: Vec<RuleVerdict>,
    /// The freshness rule replaced the validity token
    pub refreshed: bool,
    /// Result of the malicious-pattern pass, independent of the battery
    pub pattern: Option<MaliciousPattern>,
}

impl TransactionVerdict {
    pub fn is_valid(&self) -> bool {
        self.verdicts.iter().all(|v| v.is_valid)
    }

    pub fn is_malicious(&self) -> bool {
        self.verdicts.iter().any(|v| !v.is_valid && v.malicious)
    }

    pub fn failures(&self) -> impl Iterator<Item = &RuleVerdict> {
        self.verdicts.iter().filter(|v| !v.is_valid)
    }

    /// Most severe failure; the earliest one wins ties
    pub fn worst_failure(&self) -> Option<&RuleVerdict> {
        self.failures().fold(None, |worst: Option<&RuleVerdict>, v| match worst {
            Some(w) if w.severity >= v.severity => Some(w),
            _ => Some(v),
        })
    }

    /// Fold the failures into a single error
    pub fn error(&self) -> Option<GuardError> {
        if let Some(v) = self.failures().find(|v| v.malicious) {
            return Some(GuardError::MaliciousPatternDetected {
                index: self.index,
                rule: v.rule,
                reason: v.reason.clone().unwrap_or_default(),
            });
        }
        if let Some(v) = self.failures().find(|v| v.rule == RuleId::Freshness) {
            return Some(GuardError::ValidityWindowExpired(
                v.reason.clone().unwrap_or_default(),
            ));
        }
        self.worst_failure().map(|v| match &v.decode_error {
            Some(source) => GuardError::MalformedInstruction {
                index: self.index,
                rule: v.rule,
                source: source.clone(),
            },
            None => GuardError::SecurityViolation {
                index: self.index,
                rule: v.rule,
                severity: v.severity,
                reason: v.reason.clone().unwrap_or_default(),
            },
        })
    }
}

/// Ordered rule battery
pub struct SecurityRuleEngine {
    config: RuleConfig,
    compute_unit_ceiling: u32,
    denied_programs: HashSet<Pubkey>,
    node: Arc<dyn ChainNode>,
    node_timeout: Duration,
    resolver: AccountStateResolver,
    rate_limiter: Arc<RateLimiter>,
    detector: MaliciousPatternDetector,
}

impl SecurityRuleEngine {
    pub fn new(
        config: RuleConfig,
        node: Arc<dyn ChainNode>,
        resolver: AccountStateResolver,
        rate_limiter: Arc<RateLimiter>,
    ) -> Result<Self, GuardError> {
        let denied_programs = config.denied_program_ids()?.into_iter().collect();
        Ok(Self {
            compute_unit_ceiling: config.compute_unit_ceiling(),
            detector: MaliciousPatternDetector::from_config(&config),
            denied_programs,
            config,
            node,
            node_timeout: Duration::from_secs(15),
            resolver,
            rate_limiter,
        })
    }

    /// Timeout for the slot and blockhash calls made by the freshness rule
    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    pub fn detector(&self) -> &MaliciousPatternDetector {
        &self.detector
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn compute_unit_ceiling(&self) -> u32 {
        self.compute_unit_ceiling
    }

    /// Run the full battery plus the malicious-pattern pass
    pub async fn evaluate(&self, index: usize, tx: &BundleTransaction) -> TransactionVerdict {
        let mut result = TransactionVerdict {
            index,
            transaction: tx.clone(),
            verdicts: Vec::with_capacity(8),
            refreshed: false,
            pattern: self.detector.detect(tx),
        };

        let structure = self.check_structure(tx);
        let stop = structure.stops_battery();
        result.verdicts.push(structure);
        if stop {
            return self.finish(result);
        }

        let (freshness, rebound) = self.check_freshness(tx).await;
        if let Some(rebound) = rebound {
            result.transaction = rebound;
            result.refreshed = true;
        }
        let stop = freshness.stops_battery();
        result.verdicts.push(freshness);
        if stop {
            return self.finish(result);
        }

        let current = result.transaction.clone();
        let sync_rules: [fn(&Self, &BundleTransaction) -> RuleVerdict; 4] = [
            Self::check_compute_budget,
            Self::check_account_enumeration,
            Self::check_program_invocation,
            Self::check_fee_manipulation,
        ];
        for rule in sync_rules {
            let verdict = rule(self, &current);
            let stop = verdict.stops_battery();
            result.verdicts.push(verdict);
            if stop {
                return self.finish(result);
            }
        }

        let rate = self.check_rate_limit(&current, Instant::now());
        let stop = rate.stops_battery();
        result.verdicts.push(rate);
        if stop {
            return self.finish(result);
        }

        let token = self.check_token_accounts(&current).await;
        result.verdicts.push(token);
        self.finish(result)
    }

    fn finish(&self, result: TransactionVerdict) -> TransactionVerdict {
        for v in result.failures() {
            debug!(
                index = result.index,
                rule = %v.rule,
                severity = %v.severity,
                malicious = v.malicious,
                reason = v.reason.as_deref().unwrap_or(""),
                "Rule failed"
            );
        }
        result
    }

    /// Rule 1: instructions, fee payer and validity token are present
    pub fn check_structure(&self, tx: &BundleTransaction) -> RuleVerdict {
        if tx.instructions().is_empty() {
            return RuleVerdict::fail(RuleId::Structure, Severity::High, "transaction has no instructions");
        }
        if tx.fee_payer().is_none() {
            return RuleVerdict::fail(RuleId::Structure, Severity::High, "transaction has no fee payer");
        }
        if tx.validity_token().is_none() {
            return RuleVerdict::fail(RuleId::Structure, Severity::High, "transaction has no validity token");
        }
        RuleVerdict::pass(RuleId::Structure)
    }

    /// Rule 2: validity token age, with exactly one refresh attempt when stale
    ///
    /// Returns the rebound transaction when the refresh succeeded.
    pub async fn check_freshness(&self, tx: &BundleTransaction) -> (RuleVerdict, Option<BundleTransaction>) {
        let Some(token) = tx.validity_token() else {
            return (
                RuleVerdict::fail(RuleId::Freshness, Severity::High, "transaction has no validity token"),
                None,
            );
        };

        let current_slot = match self.fetch_slot().await {
            Ok(slot) => slot,
            Err(e) => {
                return (
                    RuleVerdict::fail(
                        RuleId::Freshness,
                        Severity::High,
                        format!("could not determine current slot: {}", e),
                    ),
                    None,
                )
            }
        };

        let age = token.age_at(current_slot);
        if age <= self.config.max_validity_age_slots {
            return (RuleVerdict::pass(RuleId::Freshness), None);
        }

        match self.fetch_token().await {
            Ok(fresh) => {
                info!(
                    age_slots = age,
                    old_blockhash = %token.blockhash,
                    new_blockhash = %fresh.blockhash,
                    "Validity token refreshed"
                );
                (
                    RuleVerdict::pass_with(
                        RuleId::Freshness,
                        format!("validity token refreshed after {} slots", age),
                    ),
                    Some(tx.with_validity_token(fresh)),
                )
            }
            Err(e) => {
                warn!(age_slots = age, error = %e, "Validity token refresh failed");
                (
                    RuleVerdict::fail(
                        RuleId::Freshness,
                        Severity::High,
                        format!(
                            "validity token is {} slots old (max {}) and refresh failed: {}",
                            age, self.config.max_validity_age_slots, e
                        ),
                    ),
                    None,
                )
            }
        }
    }

    /// Rule 3: requested compute units within the ceiling
    ///
    /// Every limit is compared against the ceiling before malformed payloads
    /// are reported, so a bad instruction cannot mask an oversized limit.
    pub fn check_compute_budget(&self, tx: &BundleTransaction) -> RuleVerdict {
        let budget_ixs = || {
            tx.instructions()
                .iter()
                .enumerate()
                .filter(|(_, ix)| ix.program_id == compute_budget::id())
        };

        let oversized = budget_ixs()
            .filter(|(_, ix)| ix.data.first() == Some(&COMPUTE_UNIT_LIMIT_DISCRIMINANT))
            .find_map(|(i, ix)| {
                decode_compute_unit_limit(ix)
                    .ok()
                    .filter(|units| *units > self.compute_unit_ceiling)
                    .map(|units| (i, units))
            });
        if let Some((i, units)) = oversized {
            return RuleVerdict::malicious(
                RuleId::ComputeBudget,
                format!(
                    "instruction {}: compute unit limit {} exceeds ceiling {}",
                    i, units, self.compute_unit_ceiling
                ),
            );
        }

        for (i, ix) in budget_ixs() {
            let decoded = match ix.data.first() {
                None => Err(DecodeError::malformed("empty compute budget payload")),
                Some(&COMPUTE_UNIT_LIMIT_DISCRIMINANT) => decode_compute_unit_limit(ix).map(|_| ()),
                Some(&COMPUTE_UNIT_PRICE_DISCRIMINANT) => decode_compute_unit_price(ix).map(|_| ()),
                Some(_) => Ok(()),
            };
            if let Err(e) = decoded {
                return RuleVerdict::malformed(RuleId::ComputeBudget, i, e);
            }
        }
        RuleVerdict::pass(RuleId::ComputeBudget)
    }

    /// Rule 4: distinct referenced accounts within the limit
    pub fn check_account_enumeration(&self, tx: &BundleTransaction) -> RuleVerdict {
        let count = tx.distinct_accounts().len();
        if count > self.config.max_distinct_accounts {
            return RuleVerdict::fail(
                RuleId::AccountEnumeration,
                Severity::Medium,
                format!(
                    "{} distinct accounts (max {})",
                    count, self.config.max_distinct_accounts
                ),
            );
        }
        RuleVerdict::pass(RuleId::AccountEnumeration)
    }

    /// Rule 5: no instruction targets a denied program
    pub fn check_program_invocation(&self, tx: &BundleTransaction) -> RuleVerdict {
        match tx
            .instructions()
            .iter()
            .position(|ix| self.denied_programs.contains(&ix.program_id))
        {
            Some(i) => RuleVerdict::malicious(
                RuleId::ProgramInvocation,
                format!(
                    "instruction {} invokes denied program {}",
                    i,
                    tx.instructions()[i].program_id
                ),
            ),
            None => RuleVerdict::pass(RuleId::ProgramInvocation),
        }
    }

    /// Rule 6: at most the configured number of system transfers
    pub fn check_fee_manipulation(&self, tx: &BundleTransaction) -> RuleVerdict {
        let mut transfers = 0usize;
        for (i, ix) in tx.instructions().iter().enumerate() {
            if ix.program_id != system_program::id() {
                continue;
            }
            match decode_system_transfer(ix) {
                Ok(_) => transfers += 1,
                Err(DecodeError::UnexpectedDiscriminant { .. }) => {}
                Err(e) => return RuleVerdict::malformed(RuleId::FeeManipulation, i, e),
            }
        }

        if transfers > self.config.max_system_transfers {
            return RuleVerdict::fail(
                RuleId::FeeManipulation,
                Severity::Medium,
                format!(
                    "{} system transfers (max {})",
                    transfers, self.config.max_system_transfers
                ),
            );
        }
        RuleVerdict::pass(RuleId::FeeManipulation)
    }

    /// Rule 7: per-fee-payer rate limit; consumes quota on success
    pub fn check_rate_limit(&self, tx: &BundleTransaction, now: Instant) -> RuleVerdict {
        let Some(fee_payer) = tx.fee_payer() else {
            return RuleVerdict::fail(RuleId::RateLimit, Severity::Medium, "no fee payer to rate limit");
        };
        if self.rate_limiter.check_and_increment(&fee_payer, now) {
            return RuleVerdict::pass(RuleId::RateLimit);
        }
        RuleVerdict::fail(
            RuleId::RateLimit,
            Severity::Medium,
            format!(
                "fee payer {} exceeded {} transactions per {}s",
                fee_payer,
                self.rate_limiter.max_per_window(),
                self.rate_limiter.window().as_secs()
            ),
        )
    }

    /// Rule 8: source accounts of transfer-like token instructions are token accounts
    pub async fn check_token_accounts(&self, tx: &BundleTransaction) -> RuleVerdict {
        let mut sources = Vec::new();
        for (i, ix) in tx.instructions().iter().enumerate() {
            if ix.program_id != spl_token::id() {
                continue;
            }
            let opcode = match decode_token_opcode(ix) {
                Ok(opcode) => opcode,
                Err(e) => return RuleVerdict::malformed(RuleId::TokenAccounts, i, e),
            };
            if !opcode.is_transfer_like() {
                continue;
            }
            match ix.accounts.first() {
                Some(meta) => sources.push((i, meta.pubkey)),
                None => {
                    return RuleVerdict::fail(
                        RuleId::TokenAccounts,
                        Severity::High,
                        format!("instruction {}: {:?} has no source account", i, opcode),
                    )
                }
            }
        }

        if sources.is_empty() {
            return RuleVerdict::pass(RuleId::TokenAccounts);
        }

        let resolved = join_all(
            sources
                .iter()
                .map(|(_, address)| self.resolver.resolve_classified(address)),
        )
        .await;

        for ((i, address), account) in sources.iter().zip(resolved) {
            match account {
                Some(ClassifiedAccount::Token(_)) => {}
                Some(other) => {
                    return RuleVerdict::fail(
                        RuleId::TokenAccounts,
                        Severity::High,
                        format!(
                            "instruction {}: source {} is a {} account, not a token account",
                            i,
                            address,
                            other.kind()
                        ),
                    )
                }
                None => {
                    return RuleVerdict::fail(
                        RuleId::TokenAccounts,
                        Severity::High,
                        format!("instruction {}: source account {} could not be resolved", i, address),
                    )
                }
            }
        }
        RuleVerdict::pass(RuleId::TokenAccounts)
    }

    async fn fetch_slot(&self) -> Result<u64, GuardError> {
        tokio::time::timeout(self.node_timeout, self.node.get_slot())
            .await
            .map_err(|_| GuardError::timeout("chain-node", self.node_timeout.as_millis()))?
    }

    /// Fetch a fresh validity token: latest blockhash, then the current slot
    pub async fn fetch_token(&self) -> Result<ValidityToken, GuardError> {
        let latest = tokio::time::timeout(self.node_timeout, self.node.get_latest_blockhash())
            .await
            .map_err(|_| GuardError::timeout("chain-node", self.node_timeout.as_millis()))??;
        let slot = self.fetch_slot().await?;
        Ok(ValidityToken::new(
            latest.blockhash,
            latest.last_valid_block_height,
            slot,
        ))
    }
}
