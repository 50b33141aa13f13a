//! Integration tests for the security rule engine
//!
//! This test validates:
//! - Compute ceiling rejection as a malicious pattern, whatever else the
//!   transaction contains (including malformed compute-budget payloads)
//! - Rate limiting across transactions and window reset
//! - Verdict folding into errors

use bundle_guard::codec::{decode_compute_unit_limit, encode_compute_unit_limit, encode_system_transfer};
use bundle_guard::config::{ComputeMode, RuleConfig};
use bundle_guard::resolver::AccountStateResolver;
use bundle_guard::rules::{RateLimiter, RuleId, SecurityRuleEngine};
use bundle_guard::test_utils::{transfer_tx, MockChainNode};
use bundle_guard::{BundleTransaction, GuardError, Severity, ValidityToken};
use proptest::prelude::*;
use solana_sdk::{compute_budget, hash::Hash, instruction::Instruction, pubkey::Pubkey};
use std::sync::Arc;
use std::time::Duration;

fn engine(node: Arc<MockChainNode>, config: RuleConfig) -> SecurityRuleEngine {
    let limiter = Arc::new(RateLimiter::new(
        Duration::from_secs(config.rate_limit_window_secs),
        config.rate_limit_max_transactions,
    ));
    let resolver = AccountStateResolver::new(node.clone(), Duration::from_secs(5));
    SecurityRuleEngine::new(config, node, resolver, limiter).unwrap()
}

fn token() -> ValidityToken {
    // MockChainNode reports slot 1000
    ValidityToken::new(Hash::new_from_array([7u8; 32]), 1_150, 1_000)
}

fn evaluate_blocking(engine: &SecurityRuleEngine, tx: &BundleTransaction) -> Option<GuardError> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(engine.evaluate(0, tx)).error()
}

fn arbitrary_instruction() -> impl Strategy<Value = Instruction> {
    (any::<[u8; 32]>(), proptest::collection::vec(any::<u8>(), 0..16)).prop_map(|(program, data)| {
        Instruction::new_with_bytes(Pubkey::new_from_array(program), &data, vec![])
    })
}

/// Compute-budget instructions with short or unknown payloads
fn garbage_compute_budget_instruction() -> impl Strategy<Value = Instruction> {
    prop_oneof![
        Just(Vec::<u8>::new()),
        (0u8..=4, proptest::collection::vec(any::<u8>(), 0..4)).prop_map(|(tag, rest)| {
            let mut data = vec![tag];
            data.extend(rest);
            data
        }),
    ]
    .prop_map(|data| Instruction::new_with_bytes(compute_budget::id(), &data, vec![]))
}

fn other_instruction() -> impl Strategy<Value = Instruction> {
    prop_oneof![arbitrary_instruction(), garbage_compute_budget_instruction()]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn compute_limit_above_ceiling_is_malicious(
        units in 200_001u32..=u32::MAX,
        before in proptest::collection::vec(other_instruction(), 0..3),
        after in proptest::collection::vec(other_instruction(), 0..3),
        lamports in 1u64..1_000_000_000,
    ) {
        let node = Arc::new(MockChainNode::new());
        let engine = engine(node, RuleConfig::default());
        let payer = Pubkey::new_unique();

        let mut ixs = before;
        ixs.push(encode_compute_unit_limit(units));
        ixs.push(encode_system_transfer(&payer, &Pubkey::new_unique(), lamports));
        ixs.extend(after);
        let tx = BundleTransaction::new(ixs, Some(payer)).with_validity_token(token());

        let err = evaluate_blocking(&engine, &tx);
        let is_malicious_compute = matches!(
            err,
            Some(GuardError::MaliciousPatternDetected { rule: RuleId::ComputeBudget, .. })
        );
        prop_assert!(is_malicious_compute, "unexpected result: {:?}", err);
    }

    #[test]
    fn compute_limit_within_ceiling_passes_compute_rule(units in 0u32..=200_000) {
        let node = Arc::new(MockChainNode::new());
        let engine = engine(node, RuleConfig::default());
        let tx = BundleTransaction::new(vec![encode_compute_unit_limit(units)], Some(Pubkey::new_unique()))
            .with_validity_token(token());

        prop_assert!(engine.check_compute_budget(&tx).is_valid);
        prop_assert_eq!(decode_compute_unit_limit(&encode_compute_unit_limit(units)), Ok(units));
    }
}

#[tokio::test]
async fn test_permissive_mode_allows_runtime_maximum() {
    let node = Arc::new(MockChainNode::new());
    let config = RuleConfig {
        compute_mode: ComputeMode::Permissive,
        ..RuleConfig::default()
    };
    let engine = engine(node, config);
    let payer = Pubkey::new_unique();
    let tx = BundleTransaction::new(
        vec![encode_compute_unit_limit(1_400_000)],
        Some(payer),
    )
    .with_validity_token(token());

    let verdict = engine.evaluate(0, &tx).await;
    assert!(verdict.is_valid(), "{:?}", verdict.error());
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_rejects_eleventh_then_resets() {
    let node = Arc::new(MockChainNode::new());
    let engine = engine(node, RuleConfig::default());
    let payer = Pubkey::new_unique();

    for i in 0..10 {
        let tx = transfer_tx(&payer, &Pubkey::new_unique(), 1).with_validity_token(token());
        let verdict = engine.evaluate(i, &tx).await;
        assert!(verdict.is_valid(), "tx {} should pass: {:?}", i, verdict.error());
    }

    let eleventh = transfer_tx(&payer, &Pubkey::new_unique(), 1).with_validity_token(token());
    let verdict = engine.evaluate(10, &eleventh).await;
    match verdict.error() {
        Some(GuardError::SecurityViolation { index, rule, severity, .. }) => {
            assert_eq!(index, 10);
            assert_eq!(rule, RuleId::RateLimit);
            assert_eq!(severity, Severity::Medium);
        }
        other => panic!("Expected rate limit violation, got {:?}", other),
    }

    // Another payer is unaffected
    let other = transfer_tx(&Pubkey::new_unique(), &Pubkey::new_unique(), 1).with_validity_token(token());
    assert!(engine.evaluate(0, &other).await.is_valid());

    tokio::time::advance(Duration::from_secs(61)).await;

    let twelfth = transfer_tx(&payer, &Pubkey::new_unique(), 1).with_validity_token(token());
    assert!(engine.evaluate(11, &twelfth).await.is_valid());
}

#[tokio::test]
async fn test_medium_failures_collected_without_short_circuit() {
    let node = Arc::new(MockChainNode::new());
    let config = RuleConfig {
        max_distinct_accounts: 1,
        ..RuleConfig::default()
    };
    let engine = engine(node, config);
    let payer = Pubkey::new_unique();
    let tx = BundleTransaction::new(
        vec![
            encode_system_transfer(&payer, &Pubkey::new_unique(), 1),
            encode_system_transfer(&payer, &Pubkey::new_unique(), 2),
        ],
        Some(payer),
    )
    .with_validity_token(token());

    let verdict = engine.evaluate(2, &tx).await;
    let failed: Vec<RuleId> = verdict.failures().map(|v| v.rule).collect();
    assert_eq!(failed, vec![RuleId::AccountEnumeration, RuleId::FeeManipulation]);
    assert_eq!(verdict.verdicts.len(), 8);
    assert!(matches!(
        verdict.error(),
        Some(GuardError::SecurityViolation { index: 2, rule: RuleId::AccountEnumeration, .. })
    ));
}
