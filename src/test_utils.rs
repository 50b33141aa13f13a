//! Test Utilities Module
//!
//! Deterministic doubles for the chain node, the bundle transport and the
//! bundle store, plus builders for common transactions and account layouts.
//!
//! These utilities are only compiled when running tests or when the
//! `test_utils` feature is enabled.

#![cfg(any(test, feature = "test_utils"))]

use crate::chain::{ChainNode, LatestBlockhash, SimulationOutcome};
use crate::codec::{encode_compute_unit_limit, encode_system_transfer};
use crate::errors::GuardError;
use crate::gateway::{BundleReceipt, BundleRequest, BundleTransport};
use crate::orchestrator::{BundleRecord, BundleStatus, BundleStore};
use crate::resolver::TOKEN_ACCOUNT_LEN;
use crate::types::{AccountSnapshot, BundleTransaction};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use solana_sdk::{
    hash::Hash,
    instruction::Instruction,
    pubkey::Pubkey,
    signature::{Keypair, Signer},
    system_program,
    transaction::{Transaction, VersionedTransaction},
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Mock chain node
///
/// Accounts, slot and blockhash are set up front; simulation failures are
/// scripted per account key so a single transaction inside a bundle can be
/// made to fail. Slot and blockhash reads can be scripted per call to move
/// the chain forward in the middle of a pass.
pub struct MockChainNode {
    accounts: DashMap<Pubkey, AccountSnapshot>,
    failing_accounts: DashSet<Pubkey>,
    account_delay_ms: AtomicU64,

    latest: Mutex<LatestBlockhash>,
    slot: AtomicU64,
    fail_blockhash: AtomicBool,
    scripted_blockhashes: Mutex<VecDeque<LatestBlockhash>>,
    scripted_slots: Mutex<VecDeque<u64>>,

    simulation_failures: DashMap<Pubkey, String>,
    simulation_hard_error: AtomicBool,
    simulation_delay_ms: AtomicU64,
    expired_blockhashes: DashSet<Hash>,

    pub account_calls: AtomicUsize,
    pub simulate_calls: AtomicUsize,
    pub blockhash_calls: AtomicUsize,
    pub slot_calls: AtomicUsize,
}

impl Default for MockChainNode {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChainNode {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            failing_accounts: DashSet::new(),
            account_delay_ms: AtomicU64::new(0),
            latest: Mutex::new(LatestBlockhash {
                blockhash: Hash::new_from_array([7u8; 32]),
                last_valid_block_height: 1_150,
            }),
            slot: AtomicU64::new(1_000),
            fail_blockhash: AtomicBool::new(false),
            scripted_blockhashes: Mutex::new(VecDeque::new()),
            scripted_slots: Mutex::new(VecDeque::new()),
            simulation_failures: DashMap::new(),
            simulation_hard_error: AtomicBool::new(false),
            simulation_delay_ms: AtomicU64::new(0),
            expired_blockhashes: DashSet::new(),
            account_calls: AtomicUsize::new(0),
            simulate_calls: AtomicUsize::new(0),
            blockhash_calls: AtomicUsize::new(0),
            slot_calls: AtomicUsize::new(0),
        }
    }

    pub fn add_account(&self, snapshot: AccountSnapshot) {
        self.accounts.insert(snapshot.address, snapshot);
    }

    pub fn add_system_account(&self, address: Pubkey, lamports: u64) {
        self.add_account(AccountSnapshot {
            address,
            lamports,
            owner: system_program::id(),
            data: vec![],
            executable: false,
        });
    }

    pub fn add_token_account(&self, address: Pubkey, mint: Pubkey, owner: Pubkey, amount: u64) {
        self.add_account(AccountSnapshot {
            address,
            lamports: 2_039_280,
            owner: spl_token::id(),
            data: token_account_data(&mint, &owner, amount, None, 0),
            executable: false,
        });
    }

    pub fn add_program(&self, program_id: Pubkey) {
        self.add_account(AccountSnapshot {
            address: program_id,
            lamports: 1_141_440,
            owner: Pubkey::new_from_array([2u8; 32]),
            data: vec![0u8; 36],
            executable: true,
        });
    }

    pub fn set_balance(&self, address: &Pubkey, lamports: u64) {
        if let Some(mut entry) = self.accounts.get_mut(address) {
            entry.lamports = lamports;
        }
    }

    pub fn fail_account(&self, address: Pubkey) {
        self.failing_accounts.insert(address);
    }

    pub fn set_account_delay(&self, delay: Duration) {
        self.account_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_slot(&self, slot: u64) {
        self.slot.store(slot, Ordering::SeqCst);
    }

    pub fn set_latest_blockhash(&self, blockhash: Hash, last_valid_block_height: u64) {
        let mut latest = self.latest.lock().unwrap();
        *latest = LatestBlockhash {
            blockhash,
            last_valid_block_height,
        };
    }

    pub fn current_blockhash(&self) -> Hash {
        self.latest.lock().unwrap().blockhash
    }

    pub fn set_blockhash_failure(&self, fail: bool) {
        self.fail_blockhash.store(fail, Ordering::SeqCst);
    }

    /// Any simulated transaction that references `account` fails with `error`
    pub fn fail_simulation_for(&self, account: Pubkey, error: impl Into<String>) {
        self.simulation_failures.insert(account, error.into());
    }

    pub fn set_simulation_hard_error(&self, fail: bool) {
        self.simulation_hard_error.store(fail, Ordering::SeqCst);
    }

    pub fn set_simulation_delay(&self, delay: Duration) {
        self.simulation_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Simulations of transactions bound to `blockhash` report it expired
    pub fn expire_blockhash(&self, blockhash: Hash) {
        self.expired_blockhashes.insert(blockhash);
    }

    /// The next `get_latest_blockhash` calls return these in order, then the
    /// configured blockhash
    pub fn script_blockhashes(&self, script: Vec<LatestBlockhash>) {
        self.scripted_blockhashes.lock().unwrap().extend(script);
    }

    /// The next `get_slot` calls return these in order, then the configured slot
    pub fn script_slots(&self, script: Vec<u64>) {
        self.scripted_slots.lock().unwrap().extend(script);
    }

    pub fn total_calls(&self) -> usize {
        self.account_calls.load(Ordering::SeqCst)
            + self.simulate_calls.load(Ordering::SeqCst)
            + self.blockhash_calls.load(Ordering::SeqCst)
            + self.slot_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainNode for MockChainNode {
    async fn get_account_info(&self, address: &Pubkey) -> Result<Option<AccountSnapshot>, GuardError> {
        self.account_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.account_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing_accounts.contains(address) {
            return Err(GuardError::chain_node(true, "mock account failure"));
        }
        Ok(self.accounts.get(address).map(|entry| entry.value().clone()))
    }

    async fn simulate_transaction(&self, tx: &VersionedTransaction) -> Result<SimulationOutcome, GuardError> {
        self.simulate_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.simulation_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.simulation_hard_error.load(Ordering::SeqCst) {
            return Err(GuardError::chain_node(false, "mock simulation failure"));
        }

        if self
            .expired_blockhashes
            .contains(tx.message.recent_blockhash())
        {
            return Ok(SimulationOutcome::failure("BlockhashNotFound"));
        }

        for key in tx.message.static_account_keys() {
            if let Some(error) = self.simulation_failures.get(key) {
                return Ok(SimulationOutcome::failure(error.value().clone()));
            }
        }
        Ok(SimulationOutcome {
            ok: true,
            units_consumed: Some(1_500),
            ..Default::default()
        })
    }

    async fn get_latest_blockhash(&self) -> Result<LatestBlockhash, GuardError> {
        self.blockhash_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_blockhash.load(Ordering::SeqCst) {
            return Err(GuardError::chain_node(true, "mock blockhash failure"));
        }
        if let Some(scripted) = self.scripted_blockhashes.lock().unwrap().pop_front() {
            return Ok(scripted);
        }
        Ok(*self.latest.lock().unwrap())
    }

    async fn get_slot(&self) -> Result<u64, GuardError> {
        self.slot_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.scripted_slots.lock().unwrap().pop_front() {
            return Ok(scripted);
        }
        Ok(self.slot.load(Ordering::SeqCst))
    }
}

/// Mock bundle transport that records every request
pub struct MockTransport {
    should_succeed: AtomicBool,
    pub calls: AtomicUsize,
    pub last_request: Mutex<Option<BundleRequest>>,
}

impl MockTransport {
    pub fn new_success() -> Self {
        Self {
            should_succeed: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn new_failure() -> Self {
        let transport = Self::new_success();
        transport.should_succeed.store(false, Ordering::SeqCst);
        transport
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BundleTransport for MockTransport {
    async fn submit_bundle(&self, request: &BundleRequest) -> Result<BundleReceipt, GuardError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());

        if self.should_succeed.load(Ordering::SeqCst) {
            Ok(BundleReceipt {
                bundle_id: Some("mock-bundle".to_string()),
            })
        } else {
            Err(GuardError::transport(false, "mock transport rejected bundle"))
        }
    }
}

/// Bundle store whose every call fails, optionally after a delay
pub struct FailingBundleStore {
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl FailingBundleStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    async fn fail(&self) -> GuardError {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        GuardError::persistence("mock store unavailable")
    }
}

#[async_trait]
impl BundleStore for FailingBundleStore {
    async fn create_bundle_record(&self, _record: &BundleRecord) -> Result<(), GuardError> {
        Err(self.fail().await)
    }

    async fn update_bundle_record(
        &self,
        _id: &str,
        _status: BundleStatus,
        _result: &serde_json::Value,
    ) -> Result<(), GuardError> {
        Err(self.fail().await)
    }

    async fn get_bundle_record(&self, _id: &str) -> Result<Option<BundleRecord>, GuardError> {
        Err(self.fail().await)
    }
}

/// Serialize an initialized SPL token account
pub fn token_account_data(
    mint: &Pubkey,
    owner: &Pubkey,
    amount: u64,
    delegate: Option<Pubkey>,
    delegated_amount: u64,
) -> Vec<u8> {
    let mut data = vec![0u8; TOKEN_ACCOUNT_LEN];
    data[0..32].copy_from_slice(mint.as_ref());
    data[32..64].copy_from_slice(owner.as_ref());
    data[64..72].copy_from_slice(&amount.to_le_bytes());
    if let Some(delegate) = delegate {
        data[72..76].copy_from_slice(&1u32.to_le_bytes());
        data[76..108].copy_from_slice(delegate.as_ref());
    }
    // Initialized
    data[108] = 1;
    data[121..129].copy_from_slice(&delegated_amount.to_le_bytes());
    data
}

/// A plain transfer with a modest compute budget
pub fn transfer_tx(payer: &Pubkey, to: &Pubkey, lamports: u64) -> BundleTransaction {
    BundleTransaction::new(
        vec![
            encode_compute_unit_limit(100_000),
            encode_system_transfer(payer, to, lamports),
        ],
        Some(*payer),
    )
}

/// A token transfer from `source` to `dest` signed by `authority`
pub fn token_transfer_ix(source: &Pubkey, dest: &Pubkey, authority: &Pubkey, amount: u64) -> Instruction {
    let mut data = vec![3u8];
    data.extend_from_slice(&amount.to_le_bytes());
    Instruction {
        program_id: spl_token::id(),
        accounts: vec![
            solana_sdk::instruction::AccountMeta::new(*source, false),
            solana_sdk::instruction::AccountMeta::new(*dest, false),
            solana_sdk::instruction::AccountMeta::new_readonly(*authority, true),
        ],
        data,
    }
}

/// Signed transfers sharing one blockhash
pub fn signed_bundle(count: usize, blockhash: Hash) -> Vec<VersionedTransaction> {
    (0..count)
        .map(|_| {
            let payer = Keypair::new();
            let ix = encode_system_transfer(&payer.pubkey(), &Pubkey::new_unique(), 1_000);
            let tx = Transaction::new_signed_with_payer(&[ix], Some(&payer.pubkey()), &[&payer], blockhash);
            VersionedTransaction::from(tx)
        })
        .collect()
}
