//! Bundle orchestration
//!
//! One `validate_bundle` call is one pass:
//! 1. size check (no record, no network)
//! 2. pending record
//! 3. one validity token for the whole bundle
//! 4. rule battery + malicious-pattern pass, fanned out per transaction
//! 5. bundle-wide resync if any freshness refresh happened
//! 6. assertion companions for the transactions that passed
//! 7. malicious policy
//! 8. submission-set size check (originals plus companions)
//! 9. sequential simulation of each passing transaction and its companion
//! 10. `simulated` iff every transaction passed, else `failed`
//!
//! A hard chain-node error or timeout in steps 3 or 9, or an oversized
//! submission set in step 8, aborts the pass and marks the record failed.
//! Persistence is best-effort throughout.
//!
//! `submit_bundle` claims the record before any I/O so a bundle is handed
//! to the transport at most once. When the signed set carries an expired
//! blockhash the validated unsigned set is re-bound to a fresh token,
//! re-simulated and returned for re-signing (`ResignRequired`).

pub mod persistence;
pub mod record;

pub use persistence::{BundleStore, MemoryBundleStore, SledBundleStore};
pub use record::{BundleRecord, BundleStatus};

use crate::assertions::{AssertionBuilder, AssertionResult};
use crate::chain::{ChainNode, SimulationOutcome};
use crate::config::{AssertionUnavailablePolicy, GuardConfig, MaliciousPolicy};
use crate::errors::GuardError;
use crate::gateway::{check_bundle_size, BundleTransport, SubmissionGateway};
use crate::metrics::{metrics, Timer};
use crate::observability::{CorrelationId, TraceContext};
use crate::resolver::AccountStateResolver;
use crate::rules::{RateLimiter, RuleId, SecurityRuleEngine, TransactionVerdict};
use crate::structured_logging::BundleLogger;
use crate::types::{BundleTransaction, Severity, ValidityToken};
use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use serde::Serialize;
use solana_sdk::{hash::Hash, pubkey::Pubkey, transaction::VersionedTransaction};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{warn, Instrument};

/// Why a transaction failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Rule rejection or simulation error without an attack pattern
    Ordinary,
    /// Matches an attack pattern
    Malicious,
    /// Healthy transaction failed because another one in the bundle was malicious
    BundleFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureDetail {
    pub rule: RuleId,
    pub severity: Severity,
    pub kind: FailureKind,
}

/// Per-transaction outcome of a pass
#[derive(Debug, Clone, Serialize)]
pub struct SimulationResult {
    pub index: usize,
    pub success: bool,
    pub message: Option<String>,
    pub bundle_id: String,
    pub verdicts: Vec<crate::rules::RuleVerdict>,
    pub malicious: bool,
    pub failure: Option<FailureDetail>,
    pub assertion: Option<AssertionResult>,
    pub simulation: Option<SimulationOutcome>,
    pub companion_simulation: Option<SimulationOutcome>,
    /// Transaction as simulated, bound to the pass validity token
    #[serde(skip)]
    pub transaction: BundleTransaction,
}

/// Outcome of `validate_bundle`
#[derive(Debug, Clone, Serialize)]
pub struct BundleValidation {
    pub bundle_id: String,
    pub status: BundleStatus,
    pub validity_token: ValidityToken,
    pub results: Vec<SimulationResult>,
}

impl BundleValidation {
    pub fn successes(&self) -> Vec<bool> {
        self.results.iter().map(|r| r.success).collect()
    }

    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }

    /// Each passing transaction followed by its assertion companion
    pub fn submission_set(&self) -> Vec<BundleTransaction> {
        let mut out = Vec::new();
        for result in self.results.iter().filter(|r| r.success) {
            out.push(result.transaction.clone());
            if let Some(companion) = result
                .assertion
                .as_ref()
                .and_then(|a| a.assertion_transaction.as_ref())
            {
                out.push(companion.clone());
            }
        }
        out
    }

    /// Unsigned submission set; the caller signs these and passes them to
    /// `submit_bundle`
    pub fn submission_transactions(&self) -> Result<Vec<VersionedTransaction>, GuardError> {
        self.submission_set()
            .iter()
            .map(BundleTransaction::to_versioned)
            .collect()
    }
}

/// Working state for one transaction during a pass
struct TxState {
    verdict: TransactionVerdict,
    transaction: BundleTransaction,
    failure: Option<(String, FailureDetail)>,
    assertion: Option<AssertionResult>,
    simulation: Option<SimulationOutcome>,
    companion_simulation: Option<SimulationOutcome>,
}

impl TxState {
    fn passing(&self) -> bool {
        self.failure.is_none()
    }

    fn is_malicious(&self) -> bool {
        matches!(&self.failure, Some((_, detail)) if detail.kind == FailureKind::Malicious)
    }

    /// Transactions this one contributes to the submission set
    fn submission_len(&self) -> usize {
        let companion = self
            .assertion
            .as_ref()
            .is_some_and(|a| a.assertion_transaction.is_some());
        1 + usize::from(companion)
    }

    fn fail(&mut self, message: String, rule: RuleId, severity: Severity, kind: FailureKind) {
        self.failure = Some((message, FailureDetail { rule, severity, kind }));
    }
}

/// Exclusive right to submit one bundle; released on drop
struct SubmissionClaim<'a> {
    in_flight: &'a DashSet<String>,
    bundle_id: String,
}

impl Drop for SubmissionClaim<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.bundle_id);
    }
}

/// Drives validation, simulation and submission of bundles
pub struct BundleOrchestrator {
    engine: SecurityRuleEngine,
    assertions: AssertionBuilder,
    gateway: SubmissionGateway,
    store: Arc<dyn BundleStore>,
    records: DashMap<String, BundleRecord>,
    /// Unsigned originals and companions of each `simulated` bundle
    submission_sets: DashMap<String, Vec<BundleTransaction>>,
    in_flight: DashSet<String>,
    malicious_policy: MaliciousPolicy,
    unavailable_policy: AssertionUnavailablePolicy,
    node: Arc<dyn ChainNode>,
    simulation_timeout: Duration,
    persistence_timeout: Duration,
}

impl BundleOrchestrator {
    pub fn new(
        config: &GuardConfig,
        node: Arc<dyn ChainNode>,
        transport: Arc<dyn BundleTransport>,
        store: Arc<dyn BundleStore>,
    ) -> Result<Self, GuardError> {
        let rate_limiter = Arc::new(RateLimiter::new(
            Duration::from_secs(config.rules.rate_limit_window_secs),
            config.rules.rate_limit_max_transactions,
        ));
        Self::with_rate_limiter(config, node, transport, store, rate_limiter)
    }

    /// Build with a caller-owned rate limiter (shared across orchestrators or tests)
    pub fn with_rate_limiter(
        config: &GuardConfig,
        node: Arc<dyn ChainNode>,
        transport: Arc<dyn BundleTransport>,
        store: Arc<dyn BundleStore>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Result<Self, GuardError> {
        config.validate()?;

        let node_timeout = Duration::from_millis(config.rpc.timeout_ms);
        let resolver = AccountStateResolver::new(
            node.clone(),
            Duration::from_millis(config.rpc.account_timeout_ms),
        );
        let engine = SecurityRuleEngine::new(
            config.rules.clone(),
            node.clone(),
            resolver.clone(),
            rate_limiter,
        )?
        .with_node_timeout(node_timeout);
        let assertions = AssertionBuilder::from_config(resolver, &config.assertions)?;
        let gateway = SubmissionGateway::new(
            transport,
            config.gateway.max_bundle_size,
            Duration::from_millis(config.gateway.submit_timeout_ms),
        );

        Ok(Self {
            engine,
            assertions,
            gateway,
            store,
            records: DashMap::new(),
            submission_sets: DashMap::new(),
            in_flight: DashSet::new(),
            malicious_policy: config.orchestrator.malicious_policy,
            unavailable_policy: config.assertions.unavailable_policy,
            node,
            simulation_timeout: Duration::from_millis(config.orchestrator.simulation_timeout_ms),
            persistence_timeout: Duration::from_millis(config.orchestrator.persistence_timeout_ms),
        })
    }

    pub fn engine(&self) -> &SecurityRuleEngine {
        &self.engine
    }

    pub fn gateway(&self) -> &SubmissionGateway {
        &self.gateway
    }

    /// Session copy of a record
    pub fn record(&self, bundle_id: &str) -> Option<BundleRecord> {
        self.records.get(bundle_id).map(|r| r.value().clone())
    }

    /// Current unsigned submission set of a `simulated` bundle
    ///
    /// After a `ResignRequired` error this is the set re-bound to the fresh
    /// blockhash.
    pub fn submission_transactions(&self, bundle_id: &str) -> Result<Vec<VersionedTransaction>, GuardError> {
        let set = self
            .submission_sets
            .get(bundle_id)
            .ok_or_else(|| GuardError::UnknownBundle(bundle_id.to_string()))?;
        set.iter().map(BundleTransaction::to_versioned).collect()
    }

    pub async fn validate_bundle(
        &self,
        transactions: Vec<BundleTransaction>,
        owner: &Pubkey,
    ) -> Result<BundleValidation, GuardError> {
        if let Err(e) = check_bundle_size(transactions.len(), self.gateway.max_bundle_size()) {
            metrics().bundles_rejected.inc();
            return Err(e);
        }

        let timer = Timer::start();
        let record = BundleRecord::new(owner);
        let bundle_id = record.id.clone();
        let logger = BundleLogger::new(bundle_id.as_str());
        let trace = TraceContext::new("validate_bundle", CorrelationId::from(bundle_id.as_str()));

        logger.log_pass_started("validate_bundle", transactions.len(), &record.owner);
        self.records.insert(bundle_id.clone(), record.clone());
        self.persist(&logger, "create", self.store.create_bundle_record(&record))
            .await;

        metrics().bundles_validated.inc();
        metrics().active_passes.inc();
        let outcome = self
            .run_validation(&bundle_id, transactions, &logger, &trace)
            .instrument(trace.span())
            .await;
        metrics().active_passes.dec();

        match outcome {
            Ok(validation) => {
                let result = serde_json::to_value(&validation)
                    .map_err(|e| GuardError::persistence(e.to_string()))?;
                if validation.status == BundleStatus::Simulated {
                    self.submission_sets
                        .insert(bundle_id.clone(), validation.submission_set());
                }
                self.transition(&bundle_id, validation.status, result, &logger)
                    .await?;
                timer.observe_duration(&metrics().validation_latency);
                Ok(validation)
            }
            Err(e) => {
                logger.log_pass_aborted(&e);
                let result = serde_json::json!({
                    "error": e.to_string(),
                    "category": e.category(),
                    "retryable": e.is_retryable(),
                });
                if let Err(te) = self
                    .transition(&bundle_id, BundleStatus::Failed, result, &logger)
                    .await
                {
                    warn!(bundle_id = %bundle_id, error = %te, "Could not mark aborted bundle failed");
                }
                Err(GuardError::PassAborted {
                    bundle_id,
                    source: Box::new(e),
                })
            }
        }
    }

    async fn run_validation(
        &self,
        bundle_id: &str,
        transactions: Vec<BundleTransaction>,
        logger: &BundleLogger,
        trace: &TraceContext,
    ) -> Result<BundleValidation, GuardError> {
        let mut token = self.engine.fetch_token().await?;
        let bound: Vec<BundleTransaction> = transactions
            .iter()
            .map(|tx| tx.with_validity_token(token))
            .collect();

        let verdicts = join_all(
            bound
                .iter()
                .enumerate()
                .map(|(index, tx)| self.engine.evaluate(index, tx)),
        )
        .await;
        metrics()
            .transactions_evaluated
            .inc_by(verdicts.len() as u64);

        // one resync to the newest refreshed token
        if let Some(newest) = verdicts
            .iter()
            .filter(|v| v.refreshed)
            .filter_map(|v| v.transaction.validity_token().copied())
            .max_by_key(|t| t.issued_at_slot)
        {
            token = newest;
            metrics().validity_refreshes.inc();
            logger.log_bundle_resync(&newest.blockhash.to_string());
        }

        let mut states: Vec<TxState> = verdicts
            .into_iter()
            .map(|verdict| {
                let transaction = verdict.transaction.with_validity_token(token);
                let mut state = TxState {
                    verdict,
                    transaction,
                    failure: None,
                    assertion: None,
                    simulation: None,
                    companion_simulation: None,
                };
                self.apply_rule_failures(&mut state, logger);
                state
            })
            .collect();

        self.build_assertions(&mut states, logger).await;

        // Only a bundle that can still reach `simulated` is ever submitted
        if states.iter().all(TxState::passing) {
            let submission_len: usize = states.iter().map(TxState::submission_len).sum();
            let max = self.gateway.max_bundle_size();
            if submission_len > max {
                return Err(GuardError::constraint(format!(
                    "{} transactions need {} with assertion companions (max {})",
                    states.len(),
                    submission_len,
                    max
                )));
            }
        }

        let poisoned = self.malicious_policy == MaliciousPolicy::FailBundle
            && states.iter().any(TxState::is_malicious);
        if !poisoned {
            self.simulate_passing(&mut states, logger)
                .instrument(trace.child_span("simulate").span())
                .await?;
        }
        self.apply_malicious_policy(&mut states);

        let results: Vec<SimulationResult> = states
            .into_iter()
            .map(|state| SimulationResult {
                index: state.verdict.index,
                success: state.passing(),
                message: state.failure.as_ref().map(|(m, _)| m.clone()),
                bundle_id: bundle_id.to_string(),
                verdicts: state.verdict.verdicts.clone(),
                malicious: state.is_malicious(),
                failure: state.failure.map(|(_, d)| d),
                assertion: state.assertion,
                simulation: state.simulation,
                companion_simulation: state.companion_simulation,
                transaction: state.transaction,
            })
            .collect();

        let status = if results.iter().all(|r| r.success) {
            BundleStatus::Simulated
        } else {
            BundleStatus::Failed
        };

        Ok(BundleValidation {
            bundle_id: bundle_id.to_string(),
            status,
            validity_token: token,
            results,
        })
    }

    fn apply_rule_failures(&self, state: &mut TxState, logger: &BundleLogger) {
        let index = state.verdict.index;
        for v in state.verdict.failures() {
            logger.log_rule_failure(index, v);
            metrics().record_rule_rejection(v.rule.as_str(), &v.severity.to_string());
        }

        let Some(error) = state.verdict.error() else {
            return;
        };
        let malicious = state.verdict.is_malicious();
        let culprit = if malicious {
            state.verdict.failures().find(|v| v.malicious)
        } else {
            state.verdict.worst_failure()
        };
        let (rule, severity) = culprit
            .map(|v| (v.rule, v.severity))
            .unwrap_or((RuleId::Structure, Severity::High));

        if malicious {
            metrics().malicious_detected.inc();
        }
        let kind = if malicious {
            FailureKind::Malicious
        } else {
            FailureKind::Ordinary
        };
        state.fail(error.to_string(), rule, severity, kind);
    }

    async fn build_assertions(&self, states: &mut [TxState], logger: &BundleLogger) {
        let passing: Vec<usize> = (0..states.len()).filter(|&i| states[i].passing()).collect();
        let built = join_all(
            passing
                .iter()
                .map(|&i| self.assertions.build_assertions(&states[i].transaction)),
        )
        .await;

        for (i, result) in passing.into_iter().zip(built) {
            let state = &mut states[i];
            if !result.is_program_available {
                match self.unavailable_policy {
                    AssertionUnavailablePolicy::Reject => {
                        let error = GuardError::AssertionUnavailable(
                            result.failure_reason.clone().unwrap_or_default(),
                        );
                        state.fail(
                            error.to_string(),
                            RuleId::Assertions,
                            Severity::High,
                            FailureKind::Ordinary,
                        );
                    }
                    AssertionUnavailablePolicy::ProceedUnprotected => {
                        warn!(index = i, "Assertion program unavailable, proceeding unprotected");
                    }
                }
            } else if result.flagged_empty {
                metrics().assertions_empty.inc();
            } else if result.assertion_transaction.is_some() {
                metrics().assertions_built.inc();
            }
            logger.log_assertions(i, result.entries.len(), result.flagged_empty);
            state.assertion = Some(result);
        }
    }

    /// Sequential simulation; a hard node error ends the pass
    async fn simulate_passing(&self, states: &mut [TxState], logger: &BundleLogger) -> Result<(), GuardError> {
        for state in states.iter_mut().filter(|s| s.passing()) {
            let index = state.verdict.index;
            let outcome = self.simulate(&state.transaction.to_versioned()?).await?;
            logger.log_simulation(index, outcome.ok, outcome.error.as_deref());

            if !outcome.ok {
                let message = GuardError::SimulationFailed {
                    index,
                    message: outcome.error.clone().unwrap_or_default(),
                }
                .to_string();
                match state.verdict.pattern {
                    Some(pattern) => {
                        metrics().malicious_detected.inc();
                        state.fail(
                            format!("{} ({})", message, pattern.describe()),
                            pattern.rule(),
                            Severity::High,
                            FailureKind::Malicious,
                        );
                    }
                    None => state.fail(message, RuleId::Simulation, Severity::Medium, FailureKind::Ordinary),
                }
                state.simulation = Some(outcome);
                continue;
            }
            state.simulation = Some(outcome);

            let companion = state
                .assertion
                .as_ref()
                .and_then(|a| a.assertion_transaction.as_ref())
                .map(BundleTransaction::to_versioned)
                .transpose()?;
            if let Some(companion) = companion {
                let outcome = self.simulate(&companion).await?;
                if !outcome.ok {
                    state.fail(
                        format!(
                            "Assertion companion for tx {} failed simulation: {}",
                            index,
                            outcome.error.as_deref().unwrap_or("")
                        ),
                        RuleId::Assertions,
                        Severity::Medium,
                        FailureKind::Ordinary,
                    );
                }
                state.companion_simulation = Some(outcome);
            }
        }
        Ok(())
    }

    fn apply_malicious_policy(&self, states: &mut [TxState]) {
        if self.malicious_policy != MaliciousPolicy::FailBundle {
            return;
        }
        let Some(culprit) = states.iter().find(|s| s.is_malicious()).map(|s| s.verdict.index) else {
            return;
        };
        for state in states.iter_mut().filter(|s| s.passing()) {
            state.fail(
                format!("Bundle failed: tx {} matched a malicious pattern", culprit),
                RuleId::BundlePolicy,
                Severity::High,
                FailureKind::BundleFailed,
            );
        }
    }

    /// Submit signed transactions for a `simulated` record
    ///
    /// Returns `ResignRequired` (record stays `simulated`) when the signed
    /// blockhash expired and the validated set was re-bound; fetch it again
    /// with [`Self::submission_transactions`], sign and resubmit.
    pub async fn submit_bundle(
        &self,
        bundle_id: &str,
        signed: Vec<VersionedTransaction>,
    ) -> Result<Vec<String>, GuardError> {
        let _claim = self.claim_submission(bundle_id)?;

        let logger = BundleLogger::new(bundle_id);
        let trace = TraceContext::new("submit_bundle", CorrelationId::from(bundle_id));
        let timer = Timer::start();

        let outcome = self
            .run_submission(bundle_id, &signed, &logger, &trace)
            .instrument(trace.span())
            .await;

        match outcome {
            Ok(signatures) => {
                timer.observe_duration(&metrics().submission_latency);
                logger.log_submitted(&signatures, (timer.elapsed_secs() * 1000.0) as u64);
                self.transition(
                    bundle_id,
                    BundleStatus::Executed,
                    serde_json::json!({ "signatures": signatures }),
                    &logger,
                )
                .await?;
                self.submission_sets.remove(bundle_id);
                Ok(signatures)
            }
            Err(e @ GuardError::ResignRequired { .. }) => {
                warn!(bundle_id = %bundle_id, error = %e, "Submission set re-bound, awaiting re-signed bundle");
                Err(e)
            }
            Err(e) => {
                logger.log_pass_aborted(&e);
                let result = serde_json::json!({
                    "error": e.to_string(),
                    "category": e.category(),
                    "retryable": e.is_retryable(),
                });
                if let Err(te) = self
                    .transition(bundle_id, BundleStatus::Failed, result, &logger)
                    .await
                {
                    warn!(bundle_id = %bundle_id, error = %te, "Could not mark bundle failed");
                }
                self.submission_sets.remove(bundle_id);
                Err(e)
            }
        }
    }

    /// Check the record is `simulated` and mark it in flight, atomically
    /// under the record's map lock
    fn claim_submission(&self, bundle_id: &str) -> Result<SubmissionClaim<'_>, GuardError> {
        let record = self
            .records
            .get_mut(bundle_id)
            .ok_or_else(|| GuardError::UnknownBundle(bundle_id.to_string()))?;
        if record.status != BundleStatus::Simulated {
            return Err(GuardError::InvalidTransition {
                from: record.status.to_string(),
                to: BundleStatus::Executed.to_string(),
            });
        }
        if !self.in_flight.insert(bundle_id.to_string()) {
            return Err(GuardError::InvalidTransition {
                from: "submitting".to_string(),
                to: BundleStatus::Executed.to_string(),
            });
        }
        Ok(SubmissionClaim {
            in_flight: &self.in_flight,
            bundle_id: bundle_id.to_string(),
        })
    }

    async fn run_submission(
        &self,
        bundle_id: &str,
        signed: &[VersionedTransaction],
        logger: &BundleLogger,
        trace: &TraceContext,
    ) -> Result<Vec<String>, GuardError> {
        self.gateway.check_constraints(signed)?;

        for (index, tx) in signed.iter().enumerate() {
            let outcome = self.simulate(tx).await?;
            logger.log_simulation(index, outcome.ok, outcome.error.as_deref());

            if outcome.is_blockhash_expired() {
                let fresh = self
                    .rebind_submission_set(bundle_id, index, *tx.message.recent_blockhash(), logger)
                    .instrument(trace.child_span("resync").span())
                    .await?;
                return Err(GuardError::ResignRequired {
                    bundle_id: bundle_id.to_string(),
                    blockhash: fresh.blockhash.to_string(),
                });
            }
            if !outcome.ok {
                return Err(GuardError::SimulationFailed {
                    index,
                    message: outcome.error.unwrap_or_default(),
                });
            }
        }

        self.gateway.submit(signed).await
    }

    /// Re-bind the validated unsigned set to a fresh token and re-simulate it
    async fn rebind_submission_set(
        &self,
        bundle_id: &str,
        index: usize,
        stale: Hash,
        logger: &BundleLogger,
    ) -> Result<ValidityToken, GuardError> {
        let fresh = self.engine.fetch_token().await?;
        metrics().validity_refreshes.inc();
        logger.log_bundle_resync(&fresh.blockhash.to_string());

        if fresh.blockhash == stale {
            return Err(GuardError::ValidityWindowExpired(format!(
                "tx {} blockhash {} expired and the node reports no newer blockhash",
                index, stale
            )));
        }

        let rebound: Vec<BundleTransaction> = self
            .submission_sets
            .get(bundle_id)
            .ok_or_else(|| GuardError::UnknownBundle(bundle_id.to_string()))?
            .iter()
            .map(|tx| tx.with_validity_token(fresh))
            .collect();

        for (i, tx) in rebound.iter().enumerate() {
            let outcome = self.simulate(&tx.to_versioned()?).await?;
            if outcome.is_blockhash_expired() {
                return Err(GuardError::ValidityWindowExpired(format!(
                    "tx {} still expired after rebinding to {}",
                    i, fresh.blockhash
                )));
            }
            if !outcome.ok {
                return Err(GuardError::SimulationFailed {
                    index: i,
                    message: outcome.error.unwrap_or_default(),
                });
            }
        }

        self.submission_sets.insert(bundle_id.to_string(), rebound);
        Ok(fresh)
    }

    async fn simulate(&self, tx: &VersionedTransaction) -> Result<SimulationOutcome, GuardError> {
        let timer = Timer::start();
        let outcome = tokio::time::timeout(self.simulation_timeout, self.node.simulate_transaction(tx))
            .await
            .map_err(|_| GuardError::timeout("chain-node", self.simulation_timeout.as_millis()))??;
        timer.observe_duration(&metrics().simulation_latency);
        Ok(outcome)
    }

    async fn transition(
        &self,
        bundle_id: &str,
        next: BundleStatus,
        result: serde_json::Value,
        logger: &BundleLogger,
    ) -> Result<(), GuardError> {
        let from = {
            let mut record = self
                .records
                .get_mut(bundle_id)
                .ok_or_else(|| GuardError::UnknownBundle(bundle_id.to_string()))?;
            let from = record.status;
            record.transition(next, result.clone())?;
            from
        };
        logger.log_transition(from.as_str(), next.as_str());

        match next {
            BundleStatus::Simulated => metrics().bundles_simulated.inc(),
            BundleStatus::Executed => metrics().bundles_executed.inc(),
            BundleStatus::Failed => metrics().bundles_failed.inc(),
            BundleStatus::Pending => {}
        }

        self.persist(
            logger,
            "update",
            self.store.update_bundle_record(bundle_id, next, &result),
        )
        .await;
        Ok(())
    }

    async fn persist<F>(&self, logger: &BundleLogger, operation: &str, fut: F)
    where
        F: Future<Output = Result<(), GuardError>>,
    {
        let error = match tokio::time::timeout(self.persistence_timeout, fut).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(_) => GuardError::timeout("persistence", self.persistence_timeout.as_millis()),
        };
        metrics().persistence_errors.inc();
        logger.log_persistence_error(operation, &error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_compute_unit_limit;
    use crate::test_utils::{transfer_tx, FailingBundleStore, MockChainNode, MockTransport};

    struct Harness {
        node: Arc<MockChainNode>,
        transport: Arc<MockTransport>,
        store: Arc<MemoryBundleStore>,
        orchestrator: BundleOrchestrator,
    }

    fn harness(config: GuardConfig) -> Harness {
        let node = Arc::new(MockChainNode::new());
        let program = config.assertions.program_pubkey().unwrap();
        node.add_program(program);
        let transport = Arc::new(MockTransport::new_success());
        let store = Arc::new(MemoryBundleStore::new());
        let orchestrator =
            BundleOrchestrator::new(&config, node.clone(), transport.clone(), store.clone()).unwrap();
        Harness {
            node,
            transport,
            store,
            orchestrator,
        }
    }

    fn funded_transfer(node: &MockChainNode) -> BundleTransaction {
        let payer = Pubkey::new_unique();
        let dest = Pubkey::new_unique();
        node.add_system_account(payer, 50_000_000);
        node.add_system_account(dest, 1_000);
        transfer_tx(&payer, &dest, 10_000)
    }

    #[tokio::test]
    async fn test_valid_bundle_is_simulated() {
        let h = harness(GuardConfig::default());
        let txs = vec![funded_transfer(&h.node), funded_transfer(&h.node)];

        let validation = h
            .orchestrator
            .validate_bundle(txs, &Pubkey::new_unique())
            .await
            .unwrap();

        assert_eq!(validation.status, BundleStatus::Simulated);
        assert_eq!(validation.successes(), vec![true, true]);
        assert!(validation.results.iter().all(|r| r.assertion.is_some()));
        let record = h.orchestrator.record(&validation.bundle_id).unwrap();
        assert_eq!(record.status, BundleStatus::Simulated);

        let stored = h.store.get_bundle_record(&validation.bundle_id).await.unwrap().unwrap();
        assert_eq!(stored.status, BundleStatus::Simulated);
        // 2 originals + 2 companions
        assert_eq!(validation.submission_transactions().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_oversized_bundle_creates_no_record() {
        let h = harness(GuardConfig::default());
        let txs = (0..6).map(|_| funded_transfer(&h.node)).collect();

        let err = h
            .orchestrator
            .validate_bundle(txs, &Pubkey::new_unique())
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::BundleConstraintViolation(_)));
        assert!(h.store.is_empty());
        assert_eq!(h.node.blockhash_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malicious_transaction_isolated() {
        let h = harness(GuardConfig::default());
        let mut evil = funded_transfer(&h.node);
        evil = BundleTransaction::new(
            vec![encode_compute_unit_limit(1_400_000)],
            evil.fee_payer(),
        );
        let txs = vec![funded_transfer(&h.node), evil, funded_transfer(&h.node)];

        let validation = h
            .orchestrator
            .validate_bundle(txs, &Pubkey::new_unique())
            .await
            .unwrap();
        assert_eq!(validation.successes(), vec![true, false, true]);
        assert_eq!(validation.status, BundleStatus::Failed);
        let failure = validation.results[1].failure.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::Malicious);
        assert_eq!(failure.rule, RuleId::ComputeBudget);
        assert!(validation.results[1].malicious);
    }

    #[tokio::test]
    async fn test_assertion_program_missing_rejects_by_default() {
        let config = GuardConfig::default();
        let node = Arc::new(MockChainNode::new());
        let orchestrator = BundleOrchestrator::new(
            &config,
            node.clone(),
            Arc::new(MockTransport::new_success()),
            Arc::new(MemoryBundleStore::new()),
        )
        .unwrap();

        let validation = orchestrator
            .validate_bundle(vec![funded_transfer(&node)], &Pubkey::new_unique())
            .await
            .unwrap();
        assert_eq!(validation.successes(), vec![false]);
        assert!(validation.results[0]
            .message
            .as_deref()
            .unwrap()
            .contains("Assertion program unavailable"));
        assert_eq!(
            validation.results[0].failure.as_ref().unwrap().rule,
            RuleId::Assertions
        );
    }

    #[tokio::test]
    async fn test_assertion_program_missing_proceed_unprotected() {
        let mut config = GuardConfig::default();
        config.assertions.unavailable_policy = AssertionUnavailablePolicy::ProceedUnprotected;
        let node = Arc::new(MockChainNode::new());
        let orchestrator = BundleOrchestrator::new(
            &config,
            node.clone(),
            Arc::new(MockTransport::new_success()),
            Arc::new(MemoryBundleStore::new()),
        )
        .unwrap();

        let validation = orchestrator
            .validate_bundle(vec![funded_transfer(&node)], &Pubkey::new_unique())
            .await
            .unwrap();
        assert_eq!(validation.status, BundleStatus::Simulated);
        assert!(!validation.results[0].assertion.as_ref().unwrap().is_program_available);
    }

    #[tokio::test]
    async fn test_unprotected_transactions_need_no_companion_slot() {
        let mut config = GuardConfig::default();
        config.assertions.unavailable_policy = AssertionUnavailablePolicy::ProceedUnprotected;
        let node = Arc::new(MockChainNode::new());
        let orchestrator = BundleOrchestrator::new(
            &config,
            node.clone(),
            Arc::new(MockTransport::new_success()),
            Arc::new(MemoryBundleStore::new()),
        )
        .unwrap();

        // No companions, so five originals still fit
        let txs = (0..5).map(|_| funded_transfer(&node)).collect();
        let validation = orchestrator
            .validate_bundle(txs, &Pubkey::new_unique())
            .await
            .unwrap();
        assert_eq!(validation.status, BundleStatus::Simulated);
        assert_eq!(validation.submission_transactions().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_hard_simulation_error_aborts_pass() {
        let h = harness(GuardConfig::default());
        h.node.set_simulation_hard_error(true);

        let err = h
            .orchestrator
            .validate_bundle(vec![funded_transfer(&h.node)], &Pubkey::new_unique())
            .await
            .unwrap_err();

        let GuardError::PassAborted { bundle_id, .. } = &err else {
            panic!("Expected PassAborted, got {:?}", err);
        };
        assert_eq!(
            h.orchestrator.record(bundle_id).unwrap().status,
            BundleStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_block() {
        let config = GuardConfig::default();
        let node = Arc::new(MockChainNode::new());
        node.add_program(config.assertions.program_pubkey().unwrap());
        let store = Arc::new(FailingBundleStore::new(Duration::ZERO));
        let orchestrator = BundleOrchestrator::new(
            &config,
            node.clone(),
            Arc::new(MockTransport::new_success()),
            store.clone(),
        )
        .unwrap();

        let validation = orchestrator
            .validate_bundle(vec![funded_transfer(&node)], &Pubkey::new_unique())
            .await
            .unwrap();
        assert_eq!(validation.status, BundleStatus::Simulated);
        assert!(store.calls.load(std::sync::atomic::Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_submit_requires_simulated_record() {
        let h = harness(GuardConfig::default());
        let err = h
            .orchestrator
            .submit_bundle("missing", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::UnknownBundle(_)));
        assert_eq!(h.transport.call_count(), 0);
    }
}
