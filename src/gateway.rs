//! Bundle submission gateway
//!
//! Shape checks run locally before any network call:
//! - the bundle is non-empty and within the size limit
//! - every transaction shares one recent blockhash
//! - every transaction has a fee payer
//!
//! Transactions are then bincode-serialized, base64-encoded and handed to a
//! [`BundleTransport`]. [`JitoBundleTransport`] speaks the block engine's
//! JSON-RPC `sendBundle` method.

use crate::errors::GuardError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use solana_sdk::transaction::VersionedTransaction;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Wire document handed to the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRequest {
    /// base64(bincode(transaction)), in bundle order
    pub transactions: Vec<String>,
}

/// Transport acknowledgement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleReceipt {
    /// Block-engine bundle id, when the transport returns one
    pub bundle_id: Option<String>,
}

/// Delivers an encoded bundle
#[async_trait]
pub trait BundleTransport: Send + Sync {
    async fn submit_bundle(&self, request: &BundleRequest) -> Result<BundleReceipt, GuardError>;
}

/// First signature of each transaction, base58
pub fn signatures(transactions: &[VersionedTransaction]) -> Vec<String> {
    transactions
        .iter()
        .map(|tx| {
            tx.signatures
                .first()
                .map(|sig| bs58::encode(sig.as_ref()).into_string())
                .unwrap_or_default()
        })
        .collect()
}

pub fn encode_transaction(tx: &VersionedTransaction) -> Result<String, GuardError> {
    let bytes = bincode::serialize(tx)
        .map_err(|e| GuardError::constraint(format!("failed to serialize transaction: {}", e)))?;
    Ok(BASE64_STANDARD.encode(bytes))
}

pub fn decode_transaction(encoded: &str) -> Result<VersionedTransaction, GuardError> {
    let bytes = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|e| GuardError::constraint(format!("base64 decode error: {}", e)))?;
    bincode::deserialize(&bytes)
        .map_err(|e| GuardError::constraint(format!("bincode decode error: {}", e)))
}

/// Local checks plus delivery through a transport
pub struct SubmissionGateway {
    transport: Arc<dyn BundleTransport>,
    max_bundle_size: usize,
    timeout: Duration,
}

impl SubmissionGateway {
    pub fn new(transport: Arc<dyn BundleTransport>, max_bundle_size: usize, timeout: Duration) -> Self {
        Self {
            transport,
            max_bundle_size,
            timeout,
        }
    }

    pub fn max_bundle_size(&self) -> usize {
        self.max_bundle_size
    }

    /// Size and shape checks; no I/O
    pub fn check_constraints(&self, transactions: &[VersionedTransaction]) -> Result<(), GuardError> {
        check_bundle_size(transactions.len(), self.max_bundle_size)?;

        let blockhash = *transactions[0].message.recent_blockhash();
        for (index, tx) in transactions.iter().enumerate() {
            if *tx.message.recent_blockhash() != blockhash {
                return Err(GuardError::constraint(format!(
                    "tx {} uses blockhash {}, bundle uses {}",
                    index,
                    tx.message.recent_blockhash(),
                    blockhash
                )));
            }
            if tx.message.header().num_required_signatures == 0
                || tx.message.static_account_keys().is_empty()
            {
                return Err(GuardError::constraint(format!("tx {} has no fee payer", index)));
            }
        }
        Ok(())
    }

    pub fn encode_request(&self, transactions: &[VersionedTransaction]) -> Result<BundleRequest, GuardError> {
        Ok(BundleRequest {
            transactions: transactions
                .iter()
                .map(encode_transaction)
                .collect::<Result<_, _>>()?,
        })
    }

    /// Check, encode and submit; returns signatures in submission order
    pub async fn submit(&self, transactions: &[VersionedTransaction]) -> Result<Vec<String>, GuardError> {
        self.check_constraints(transactions)?;
        let request = self.encode_request(transactions)?;

        debug!(size = transactions.len(), "Submitting bundle");
        let receipt = tokio::time::timeout(self.timeout, self.transport.submit_bundle(&request))
            .await
            .map_err(|_| GuardError::timeout("bundle-transport", self.timeout.as_millis()))??;

        let sigs = signatures(transactions);
        info!(
            size = transactions.len(),
            engine_bundle_id = receipt.bundle_id.as_deref().unwrap_or("-"),
            first_signature = sigs.first().map(String::as_str).unwrap_or("-"),
            "Bundle accepted by transport"
        );
        Ok(sigs)
    }
}

/// Bundle size bounds shared by the gateway and the orchestrator
pub fn check_bundle_size(len: usize, max: usize) -> Result<(), GuardError> {
    if len == 0 {
        return Err(GuardError::constraint("bundle is empty"));
    }
    if len > max {
        return Err(GuardError::constraint(format!(
            "bundle has {} transactions (max {})",
            len, max
        )));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
}

fn is_transient_code(code: i64) -> bool {
    code == 429 || (500..600).contains(&code)
}

/// Block-engine JSON-RPC transport
pub struct JitoBundleTransport {
    http: Client,
    url: String,
}

impl JitoBundleTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, GuardError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GuardError::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl BundleTransport for JitoBundleTransport {
    async fn submit_bundle(&self, request: &BundleRequest) -> Result<BundleReceipt, GuardError> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "sendBundle",
            "params": [request.transactions, { "encoding": "base64" }],
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| GuardError::transport(e.is_timeout() || e.is_connect(), e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, "Block engine rejected bundle");
            return Err(GuardError::transport(
                is_transient_code(status.as_u16() as i64),
                format!("HTTP {}: {}", status, body),
            ));
        }

        let body: JsonRpcResponse = resp
            .json()
            .await
            .map_err(|e| GuardError::transport(false, format!("JSON parse error: {}", e)))?;

        if let Some(err) = body.error {
            return Err(GuardError::transport(
                is_transient_code(err.code),
                format!("sendBundle error {}: {}", err.code, err.message),
            ));
        }

        Ok(BundleReceipt {
            bundle_id: body
                .result
                .and_then(|v| v.as_str().map(str::to_string)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{signed_bundle, MockTransport};
    use solana_sdk::hash::Hash;

    fn gateway(transport: Arc<MockTransport>) -> SubmissionGateway {
        SubmissionGateway::new(transport, 5, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_oversized_bundle_never_reaches_transport() {
        let transport = Arc::new(MockTransport::new_success());
        let gateway = gateway(transport.clone());

        let err = gateway
            .submit(&signed_bundle(6, Hash::new_unique()))
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::BundleConstraintViolation(_)));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_bundle_rejected() {
        let transport = Arc::new(MockTransport::new_success());
        let err = gateway(transport.clone()).submit(&[]).await.unwrap_err();
        assert!(matches!(err, GuardError::BundleConstraintViolation(_)));
        assert_eq!(transport.call_count(), 0);
    }

    #[test]
    fn test_mixed_blockhashes_rejected() {
        let transport = Arc::new(MockTransport::new_success());
        let mut bundle = signed_bundle(2, Hash::new_unique());
        bundle.extend(signed_bundle(1, Hash::new_unique()));

        let err = gateway(transport).check_constraints(&bundle).unwrap_err();
        assert!(err.to_string().contains("tx 2"));
    }

    #[tokio::test]
    async fn test_submit_returns_signatures_in_order() {
        let transport = Arc::new(MockTransport::new_success());
        let bundle = signed_bundle(3, Hash::new_unique());

        let sigs = gateway(transport.clone()).submit(&bundle).await.unwrap();
        assert_eq!(sigs.len(), 3);
        for (sig, tx) in sigs.iter().zip(&bundle) {
            assert_eq!(sig, &tx.signatures[0].to_string());
        }

        let request = transport.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.transactions.len(), 3);
        assert_eq!(decode_transaction(&request.transactions[1]).unwrap(), bundle[1]);
    }

    #[tokio::test]
    async fn test_transport_failure_propagates() {
        let transport = Arc::new(MockTransport::new_failure());
        let err = gateway(transport.clone())
            .submit(&signed_bundle(1, Hash::new_unique()))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "external");
        assert_eq!(transport.call_count(), 1);
    }

    #[test]
    fn test_transient_codes() {
        assert!(is_transient_code(429));
        assert!(is_transient_code(503));
        assert!(!is_transient_code(-32602));
        assert!(!is_transient_code(400));
    }
}
