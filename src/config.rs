//! Configuration module for the bundle guard
//!
//! Loaded from a TOML file, with `.env` support and a few environment
//! overrides for the endpoints and compute mode. Every field has a default,
//! so an empty file is a valid configuration.

use crate::assertions::AssertionStrategy;
use crate::errors::GuardError;
use serde::{Deserialize, Serialize};
use solana_sdk::{commitment_config::CommitmentConfig, pubkey::Pubkey};
use std::path::Path;
use std::str::FromStr;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default)]
    pub rpc: RpcConfig,

    #[serde(default)]
    pub rules: RuleConfig,

    #[serde(default)]
    pub assertions: AssertionConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Chain node RPC endpoint
    #[serde(default = "default_rpc_url")]
    pub url: String,

    /// Timeout for blockhash, slot and simulation calls
    #[serde(default = "default_rpc_timeout_ms")]
    pub timeout_ms: u64,

    /// Timeout for account lookups (a timeout means "unresolved")
    #[serde(default = "default_account_timeout_ms")]
    pub account_timeout_ms: u64,

    /// processed | confirmed | finalized
    #[serde(default = "default_commitment")]
    pub commitment: String,
}

impl RpcConfig {
    pub fn commitment_config(&self) -> Result<CommitmentConfig, GuardError> {
        match self.commitment.as_str() {
            "processed" => Ok(CommitmentConfig::processed()),
            "confirmed" => Ok(CommitmentConfig::confirmed()),
            "finalized" => Ok(CommitmentConfig::finalized()),
            other => Err(GuardError::config(format!(
                "rpc.commitment must be processed, confirmed or finalized, got {}",
                other
            ))),
        }
    }
}

/// Compute-unit ceiling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeMode {
    /// 200,000 units
    Strict,
    /// 1,400,000 units, the runtime maximum
    Permissive,
}

impl ComputeMode {
    pub fn default_ceiling(&self) -> u32 {
        match self {
            ComputeMode::Strict => 200_000,
            ComputeMode::Permissive => 1_400_000,
        }
    }
}

impl FromStr for ComputeMode {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(ComputeMode::Strict),
            "permissive" | "demo" => Ok(ComputeMode::Permissive),
            other => Err(GuardError::config(format!("unknown compute mode '{}'", other))),
        }
    }
}

/// Security rule thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Maximum slots between validity-token fetch and evaluation
    #[serde(default = "default_max_validity_age")]
    pub max_validity_age_slots: u64,

    #[serde(default = "default_compute_mode")]
    pub compute_mode: ComputeMode,

    /// Explicit ceiling, overriding the mode default
    #[serde(default)]
    pub compute_unit_ceiling: Option<u32>,

    #[serde(default = "default_max_distinct_accounts")]
    pub max_distinct_accounts: usize,

    /// Base58 program ids that may never be invoked
    #[serde(default)]
    pub denied_programs: Vec<String>,

    #[serde(default = "default_max_system_transfers")]
    pub max_system_transfers: usize,

    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,

    #[serde(default = "default_rate_limit_max_transactions")]
    pub rate_limit_max_transactions: usize,

    /// Malicious-pattern pass: instruction-count ceiling
    #[serde(default = "default_max_instructions")]
    pub max_instructions: usize,

    /// Malicious-pattern pass: system transfers at or above this are suspicious
    #[serde(default = "default_large_transfer_lamports")]
    pub large_transfer_lamports: u64,
}

impl RuleConfig {
    pub fn compute_unit_ceiling(&self) -> u32 {
        self.compute_unit_ceiling
            .unwrap_or_else(|| self.compute_mode.default_ceiling())
    }

    pub fn denied_program_ids(&self) -> Result<Vec<Pubkey>, GuardError> {
        self.denied_programs
            .iter()
            .map(|s| {
                Pubkey::from_str(s)
                    .map_err(|e| GuardError::config(format!("invalid denied program '{}': {}", s, e)))
            })
            .collect()
    }
}

/// What to do when the assertion program is not deployed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionUnavailablePolicy {
    /// Fail the transaction (and therefore the bundle)
    Reject,
    /// Continue without assertion protection
    ProceedUnprotected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionConfig {
    /// Assertion program id (base58)
    #[serde(default = "default_assertion_program")]
    pub program_id: String,

    #[serde(default = "default_unavailable_policy")]
    pub unavailable_policy: AssertionUnavailablePolicy,

    /// Strategy for plain transfers + compute budget
    #[serde(default = "AssertionStrategy::relaxed")]
    pub relaxed: AssertionStrategy,

    /// Strategy for everything else
    #[serde(default = "AssertionStrategy::strict")]
    pub strict: AssertionStrategy,
}

impl AssertionConfig {
    pub fn program_pubkey(&self) -> Result<Pubkey, GuardError> {
        Pubkey::from_str(&self.program_id).map_err(|e| {
            GuardError::config(format!("invalid assertion program '{}': {}", self.program_id, e))
        })
    }
}

/// How a malicious transaction affects the rest of its bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaliciousPolicy {
    /// Only the offending transaction is reported as failed
    Isolate,
    /// Every transaction in the bundle is reported as failed
    FailBundle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_malicious_policy")]
    pub malicious_policy: MaliciousPolicy,

    /// Simulation timeout; expiry is fatal to the pass
    #[serde(default = "default_rpc_timeout_ms")]
    pub simulation_timeout_ms: u64,

    /// Persistence timeout; expiry is logged and ignored
    #[serde(default = "default_persistence_timeout_ms")]
    pub persistence_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Block engine JSON-RPC endpoint
    #[serde(default = "default_block_engine_url")]
    pub block_engine_url: String,

    #[serde(default = "default_max_bundle_size")]
    pub max_bundle_size: usize,

    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    Memory,
    Sled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_persistence_backend")]
    pub backend: PersistenceBackend,

    /// Database directory for the sled backend
    #[serde(default = "default_persistence_path")]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,

    #[serde(default)]
    pub json: bool,
}

// Default value functions
fn default_rpc_url() -> String { "https://api.mainnet-beta.solana.com".to_string() }
fn default_rpc_timeout_ms() -> u64 { 15_000 }
fn default_account_timeout_ms() -> u64 { 5_000 }
fn default_commitment() -> String { "confirmed".to_string() }
fn default_max_validity_age() -> u64 { 1_500 }
fn default_compute_mode() -> ComputeMode { ComputeMode::Strict }
fn default_max_distinct_accounts() -> usize { 10 }
fn default_max_system_transfers() -> usize { 1 }
fn default_rate_limit_window_secs() -> u64 { 60 }
fn default_rate_limit_max_transactions() -> usize { 10 }
fn default_max_instructions() -> usize { 10 }
fn default_large_transfer_lamports() -> u64 { 100_000_000_000 }
fn default_assertion_program() -> String { "L2TExMFKdjpN9kozasaurPirfHy9P8sbXoAN1qA3S95".to_string() }
fn default_unavailable_policy() -> AssertionUnavailablePolicy { AssertionUnavailablePolicy::Reject }
fn default_malicious_policy() -> MaliciousPolicy { MaliciousPolicy::Isolate }
fn default_persistence_timeout_ms() -> u64 { 3_000 }
fn default_block_engine_url() -> String { "https://mainnet.block-engine.jito.wtf/api/v1/bundles".to_string() }
fn default_max_bundle_size() -> usize { 5 }
fn default_submit_timeout_ms() -> u64 { 10_000 }
fn default_persistence_backend() -> PersistenceBackend { PersistenceBackend::Memory }
fn default_persistence_path() -> String { "bundle_records.sled".to_string() }
fn default_log_filter() -> String { "bundle_guard=info,warn".to_string() }

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: default_rpc_url(),
            timeout_ms: default_rpc_timeout_ms(),
            account_timeout_ms: default_account_timeout_ms(),
            commitment: default_commitment(),
        }
    }
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            max_validity_age_slots: default_max_validity_age(),
            compute_mode: default_compute_mode(),
            compute_unit_ceiling: None,
            max_distinct_accounts: default_max_distinct_accounts(),
            denied_programs: Vec::new(),
            max_system_transfers: default_max_system_transfers(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            rate_limit_max_transactions: default_rate_limit_max_transactions(),
            max_instructions: default_max_instructions(),
            large_transfer_lamports: default_large_transfer_lamports(),
        }
    }
}

impl Default for AssertionConfig {
    fn default() -> Self {
        Self {
            program_id: default_assertion_program(),
            unavailable_policy: default_unavailable_policy(),
            relaxed: AssertionStrategy::relaxed(),
            strict: AssertionStrategy::strict(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            malicious_policy: default_malicious_policy(),
            simulation_timeout_ms: default_rpc_timeout_ms(),
            persistence_timeout_ms: default_persistence_timeout_ms(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            block_engine_url: default_block_engine_url(),
            max_bundle_size: default_max_bundle_size(),
            submit_timeout_ms: default_submit_timeout_ms(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: default_persistence_backend(),
            path: default_persistence_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

impl GuardConfig {
    /// Load configuration from a TOML file and validate it
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: GuardConfig = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with `.env` support and environment overrides
    ///
    /// A missing file falls back to defaults.
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = if path.as_ref().exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!(
                path = %path.as_ref().display(),
                "Config file not found, using defaults"
            );
            Self::default()
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `BUNDLE_GUARD_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> Result<(), GuardError> {
        if let Ok(url) = std::env::var("BUNDLE_GUARD_RPC_URL") {
            self.rpc.url = url;
        }
        if let Ok(url) = std::env::var("BUNDLE_GUARD_BLOCK_ENGINE_URL") {
            self.gateway.block_engine_url = url;
        }
        if let Ok(mode) = std::env::var("BUNDLE_GUARD_COMPUTE_MODE") {
            self.rules.compute_mode = mode.parse()?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), GuardError> {
        for (name, url) in [
            ("rpc.url", &self.rpc.url),
            ("gateway.block_engine_url", &self.gateway.block_engine_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(GuardError::config(format!("{}: invalid URL format: {}", name, url)));
            }
        }

        self.rpc.commitment_config()?;

        if self.rpc.timeout_ms == 0 || self.rpc.account_timeout_ms == 0 {
            return Err(GuardError::config("rpc timeouts must be > 0"));
        }

        if self.gateway.max_bundle_size == 0 {
            return Err(GuardError::config("gateway.max_bundle_size must be > 0"));
        }

        if self.rules.rate_limit_max_transactions == 0 || self.rules.rate_limit_window_secs == 0 {
            return Err(GuardError::config("rate limit window and maximum must be > 0"));
        }

        if self.rules.compute_unit_ceiling() == 0 {
            return Err(GuardError::config("compute unit ceiling must be > 0"));
        }

        self.rules.denied_program_ids()?;
        self.assertions.program_pubkey()?;
        self.assertions.relaxed.validate()?;
        self.assertions.strict.validate()?;

        Ok(())
    }
}
