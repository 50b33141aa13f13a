//! Integration tests for the submission gateway and the block-engine transport
//!
//! This test validates:
//! - Bundle size and blockhash constraints before any network call
//! - JSON-RPC `sendBundle` request shape
//! - Error mapping for RPC errors and HTTP failures
//! - Transaction encoding through base64 bincode

use bundle_guard::gateway::{
    decode_transaction, encode_transaction, BundleTransport, JitoBundleTransport, SubmissionGateway,
};
use bundle_guard::test_utils::{signed_bundle, MockTransport};
use bundle_guard::GuardError;
use mockito::Matcher;
use solana_sdk::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

fn jito_gateway(url: String) -> SubmissionGateway {
    let transport = Arc::new(JitoBundleTransport::new(url, Duration::from_secs(5)).unwrap());
    SubmissionGateway::new(transport, 5, Duration::from_secs(5))
}

#[tokio::test]
async fn test_six_transactions_never_reach_transport() {
    // Create a MockTransport configured for success
    let transport = Arc::new(MockTransport::new_success());
    let gateway = SubmissionGateway::new(transport.clone(), 5, Duration::from_secs(5));

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
    let gateway = SubmissionGateway::new(transport.clone(), 5, Duration::from_secs(5));

    let err = gateway.submit(&[]).await.unwrap_err();
    assert!(matches!(err, GuardError::BundleConstraintViolation(_)));
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn test_send_bundle_success() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "sendBundle",
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"jsonrpc":"2.0","result":"b1e2c3","id":1}"#)
        .expect(1)
        .create_async()
        .await;

    let bundle = signed_bundle(3, Hash::new_unique());
    let gateway = jito_gateway(server.url());
    let signatures = gateway.submit(&bundle).await.unwrap();

    mock.assert_async().await;
    let expected: Vec<String> = bundle.iter().map(|tx| tx.signatures[0].to_string()).collect();
    assert_eq!(signatures, expected);
}

#[tokio::test]
async fn test_transport_returns_engine_bundle_id() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"jsonrpc":"2.0","result":"engine-id-42","id":1}"#)
        .create_async()
        .await;

    let transport = JitoBundleTransport::new(server.url(), Duration::from_secs(5)).unwrap();
    let gateway = SubmissionGateway::new(
        Arc::new(MockTransport::new_success()),
        5,
        Duration::from_secs(5),
    );
    let request = gateway
        .encode_request(&signed_bundle(2, Hash::new_unique()))
        .unwrap();

    let receipt = transport.submit_bundle(&request).await.unwrap();
    assert_eq!(receipt.bundle_id.as_deref(), Some("engine-id-42"));
}

#[tokio::test]
async fn test_rate_limited_rpc_error_is_transient() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"jsonrpc":"2.0","error":{"code":429,"message":"rate limited"},"id":1}"#)
        .create_async()
        .await;

    let err = jito_gateway(server.url())
        .submit(&signed_bundle(1, Hash::new_unique()))
        .await
        .unwrap_err();

    assert!(matches!(err, GuardError::ExternalService { transient: true, .. }));
    assert!(err.is_retryable());
    assert!(err.to_string().contains("rate limited"));
}

#[tokio::test]
async fn test_invalid_params_rpc_error_is_permanent() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"jsonrpc":"2.0","error":{"code":-32602,"message":"bundle contains an already processed transaction"},"id":1}"#)
        .create_async()
        .await;

    let err = jito_gateway(server.url())
        .submit(&signed_bundle(1, Hash::new_unique()))
        .await
        .unwrap_err();

    assert!(matches!(err, GuardError::ExternalService { transient: false, .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_http_server_error_is_transient() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/")
        .with_status(503)
        .with_body("upstream unavailable")
        .create_async()
        .await;

    let err = jito_gateway(server.url())
        .submit(&signed_bundle(2, Hash::new_unique()))
        .await
        .unwrap_err();

    assert!(matches!(err, GuardError::ExternalService { transient: true, .. }));
    assert!(err.to_string().contains("503"));
}

#[test]
fn test_encoded_transaction_decodes_to_same_signatures() {
    let bundle = signed_bundle(1, Hash::new_unique());
    let encoded = encode_transaction(&bundle[0]).unwrap();
    let decoded = decode_transaction(&encoded).unwrap();
    assert_eq!(decoded.signatures, bundle[0].signatures);
    assert_eq!(decoded.message.recent_blockhash(), bundle[0].message.recent_blockhash());

    assert!(decode_transaction("not base64!").is_err());
}
