//! Bundle Guard - pre-submission protection for Solana transaction bundles
//!
//! Validates each transaction in a bundle against an ordered battery of
//! security rules, attaches on-chain assertion companions, simulates the
//! result and only then submits through a block-engine gateway.

pub mod assertions;
pub mod chain;
pub mod codec;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod metrics;
pub mod observability;
pub mod orchestrator;
pub mod resolver;
pub mod rules;
pub mod structured_logging;
pub mod types;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use config::GuardConfig;
pub use errors::{DecodeError, GuardError};
pub use orchestrator::{BundleOrchestrator, BundleStatus, BundleValidation, SimulationResult};
pub use types::{BundleTransaction, Severity, ValidityToken};

// Re-export commonly used types
pub use solana_sdk::{pubkey::Pubkey, transaction::VersionedTransaction};
