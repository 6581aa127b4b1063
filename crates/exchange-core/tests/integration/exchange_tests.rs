//! End-to-end `begin` / `complete` flows over the in-memory store.

use chrono::{DateTime, Duration, TimeZone, Utc};
use common::clock::FixedClock;
use common::secret::SecretString;
use exchange_core::correlation::InMemoryCorrelationStore;
use exchange_core::exchange::ExchangeOrchestrator;
use exchange_core::light_token::{self, DigestAlgorithm};
use exchange_core::request::AuthenticationRequest;
use exchange_core::response::{
    DecryptionCredential, PipelineConfig, ResponseSecurityPipeline, SignatureAlgorithm,
};
use exchange_core::trust::{CertificateTrustVerifier, CertificateVerifierParams};
use exchange_core::ExchangeError;
use exchange_test_utils::{
    test_decryption_credential, unique_id, ExchangeResultAssertions, ResponseAssertions,
    TestPki, TestResponseBuilder, TEST_AUDIENCE, TEST_CONNECTOR_ISSUER, TEST_OTHER_IP,
    TEST_RELAY_STATE, TEST_REQUEST_ID_1, TEST_REQUEST_ID_2, TEST_TOKEN_ISSUER, TEST_USER_IP,
};
use std::sync::Arc;

// ============================================================================
// Helper Functions
// ============================================================================

struct Harness {
    pki: TestPki,
    recipient: DecryptionCredential,
    clock: Arc<FixedClock>,
    store: Arc<InMemoryCorrelationStore>,
    orchestrator: ExchangeOrchestrator,
    secret: SecretString,
}

impl Harness {
    fn new() -> Result<Self, anyhow::Error> {
        Self::with(|orchestrator| orchestrator)
    }

    fn with(
        customize: impl FnOnce(ExchangeOrchestrator) -> ExchangeOrchestrator,
    ) -> Result<Self, anyhow::Error> {
        let pki = TestPki::generate()?;
        let recipient = test_decryption_credential("Test Connector")?;
        let clock = Arc::new(FixedClock::new(t0()));
        let store = Arc::new(InMemoryCorrelationStore::with_clock(clock.clone()));

        let config = PipelineConfig {
            expected_audience: Some(TEST_AUDIENCE.to_string()),
            verifier_params: CertificateVerifierParams {
                check_revocation: false,
                soft_fail_revocation: true,
            },
            ..PipelineConfig::default()
        };
        let pipeline = ResponseSecurityPipeline::new(
            config,
            CertificateTrustVerifier::new(clock.clone()),
            clock.clone(),
        )
        .with_decryption_credential(recipient.clone());

        let orchestrator = customize(ExchangeOrchestrator::new(
            store.clone(),
            pipeline,
            pki.root_anchors(),
            TEST_TOKEN_ISSUER,
            clock.clone(),
        ));

        Ok(Self {
            pki,
            recipient,
            clock,
            store,
            orchestrator,
            secret: SecretString::from("S"),
        })
    }

    fn response_to(&self, request_id: &str) -> Result<String, anyhow::Error> {
        Ok(TestResponseBuilder::new(t0())
            .answering(request_id)
            .signed_by(self.pki.leaf_signer(), SignatureAlgorithm::EcdsaSha256)
            .encrypted_for(self.recipient.certificate())
            .build()?)
    }

    fn begin(&self, request_id: &str, remote_ip: &str) -> Result<Vec<u8>, anyhow::Error> {
        let request = AuthenticationRequest::new(request_id, TEST_CONNECTOR_ISSUER)?;
        let token = self.orchestrator.begin(
            request,
            Some(TEST_RELAY_STATE.to_string()),
            remote_ip,
            &self.secret,
        )?;
        Ok(token.bytes().to_vec())
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

// ============================================================================
// Happy path
// ============================================================================

#[test]
fn test_begin_then_complete() -> Result<(), anyhow::Error> {
    let harness = Harness::new()?;
    let token = harness.begin(TEST_REQUEST_ID_1, TEST_USER_IP)?;
    assert_eq!(harness.store.len(), 1);

    let response = harness.response_to(TEST_REQUEST_ID_1)?;
    let exchange = harness
        .orchestrator
        .complete(&token, response.as_bytes(), &harness.secret)
        .assert_accepted();

    exchange.assert_answers(TEST_REQUEST_ID_1);
    assert_eq!(exchange.stored_request().relay_state(), Some(TEST_RELAY_STATE));
    assert_eq!(exchange.stored_request().remote_ip_address(), TEST_USER_IP);
    assert_eq!(
        exchange.stored_request().request().issuer(),
        TEST_CONNECTOR_ISSUER
    );
    assert!(exchange.response().was_encrypted());
    exchange.assert_has_assertion();
    assert!(harness.store.is_empty());
    Ok(())
}

#[test]
fn test_token_carries_request_id_and_issuer() -> Result<(), anyhow::Error> {
    let harness = Harness::new()?;
    let token = harness.begin(TEST_REQUEST_ID_1, TEST_USER_IP)?;

    let decoded = light_token::decode(&token, &harness.secret, DigestAlgorithm::Sha256.name())?;
    assert_eq!(decoded.token().id(), TEST_REQUEST_ID_1);
    assert_eq!(decoded.token().issuer(), TEST_TOKEN_ISSUER);
    assert_eq!(decoded.token().created_on(), t0());
    Ok(())
}

#[test]
fn test_failure_response_completes_without_assertion() -> Result<(), anyhow::Error> {
    let harness = Harness::new()?;
    let token = harness.begin(TEST_REQUEST_ID_1, TEST_USER_IP)?;
    let response = TestResponseBuilder::new(t0())
        .answering(TEST_REQUEST_ID_1)
        .failed("Citizen cancelled")
        .signed_by(harness.pki.leaf_signer(), SignatureAlgorithm::EcdsaSha256)
        .build()?;

    let exchange = harness
        .orchestrator
        .complete(&token, response.as_bytes(), &harness.secret)
        .assert_accepted();
    assert!(!exchange.response().status().is_success());
    assert!(exchange.response().assertion().is_none());
    Ok(())
}

// ============================================================================
// Single use and correlation
// ============================================================================

#[test]
fn test_second_complete_finds_no_request() -> Result<(), anyhow::Error> {
    let harness = Harness::new()?;
    let token = harness.begin(TEST_REQUEST_ID_1, TEST_USER_IP)?;
    let response = harness.response_to(TEST_REQUEST_ID_1)?;

    harness
        .orchestrator
        .complete(&token, response.as_bytes(), &harness.secret)
        .assert_accepted();
    harness
        .orchestrator
        .complete(&token, response.as_bytes(), &harness.secret)
        .assert_rejected_with(ExchangeError::NoMatchingRequest);
    Ok(())
}

#[test]
fn test_response_to_other_request_is_mismatch() -> Result<(), anyhow::Error> {
    let harness = Harness::new()?;
    let token = harness.begin(TEST_REQUEST_ID_2, TEST_USER_IP)?;
    let response = harness.response_to(TEST_REQUEST_ID_1)?;

    harness
        .orchestrator
        .complete(&token, response.as_bytes(), &harness.secret)
        .assert_rejected_with(ExchangeError::CorrelationMismatch);
    assert!(harness.store.is_empty());
    Ok(())
}

#[test]
fn test_expired_request_is_gone() -> Result<(), anyhow::Error> {
    let harness = Harness::new()?;
    let token = harness.begin(TEST_REQUEST_ID_1, TEST_USER_IP)?;
    let response = harness.response_to(TEST_REQUEST_ID_1)?;

    harness.clock.advance(Duration::seconds(121));
    harness
        .orchestrator
        .complete(&token, response.as_bytes(), &harness.secret)
        .assert_rejected_with(ExchangeError::NoMatchingRequest);
    Ok(())
}

#[test]
fn test_only_one_concurrent_complete_wins() -> Result<(), anyhow::Error> {
    let harness = Harness::new()?;
    let token = harness.begin(TEST_REQUEST_ID_1, TEST_USER_IP)?;
    let response = harness.response_to(TEST_REQUEST_ID_1)?;

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    harness
                        .orchestrator
                        .complete(&token, response.as_bytes(), &harness.secret)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|result| result.as_ref().err())
        .all(|e| *e == ExchangeError::NoMatchingRequest));
    Ok(())
}

#[test]
fn test_many_pending_requests_complete_independently() -> Result<(), anyhow::Error> {
    let harness = Harness::new()?;
    let ids: Vec<String> = (0..5).map(|_| unique_id("req")).collect();
    let tokens = ids
        .iter()
        .map(|id| harness.begin(id, TEST_USER_IP))
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(harness.store.len(), ids.len());

    for (id, token) in ids.iter().zip(&tokens).rev() {
        let response = harness.response_to(id)?;
        harness
            .orchestrator
            .complete(token, response.as_bytes(), &harness.secret)
            .assert_accepted()
            .assert_answers(id);
    }
    assert!(harness.store.is_empty());
    Ok(())
}

// ============================================================================
// Token and context failures
// ============================================================================

#[test]
fn test_forged_token_leaves_request_pending() -> Result<(), anyhow::Error> {
    let harness = Harness::new()?;
    let token = harness.begin(TEST_REQUEST_ID_1, TEST_USER_IP)?;
    let response = harness.response_to(TEST_REQUEST_ID_1)?;

    harness
        .orchestrator
        .complete(&token, response.as_bytes(), &SecretString::from("not-S"))
        .assert_rejected_with(ExchangeError::TokenDigestMismatch);
    assert_eq!(harness.store.len(), 1);

    harness
        .orchestrator
        .complete(&token, response.as_bytes(), &harness.secret)
        .assert_accepted();
    Ok(())
}

#[test]
fn test_bearer_address_comes_from_stored_request() -> Result<(), anyhow::Error> {
    let harness = Harness::new()?;
    let token = harness.begin(TEST_REQUEST_ID_1, TEST_OTHER_IP)?;
    let response = harness.response_to(TEST_REQUEST_ID_1)?;

    harness
        .orchestrator
        .complete(&token, response.as_bytes(), &harness.secret)
        .assert_rejected_with(ExchangeError::SubjectConfirmationMismatch);
    Ok(())
}

#[test]
fn test_verification_timeout_aborts() -> Result<(), anyhow::Error> {
    let harness =
        Harness::with(|orchestrator| orchestrator.with_verification_timeout(Duration::zero()))?;
    let token = harness.begin(TEST_REQUEST_ID_1, TEST_USER_IP)?;
    let response = harness.response_to(TEST_REQUEST_ID_1)?;

    harness
        .orchestrator
        .complete(&token, response.as_bytes(), &harness.secret)
        .assert_rejected_with(ExchangeError::VerificationAborted);
    Ok(())
}

#[test]
fn test_sha512_tokens_when_configured() -> Result<(), anyhow::Error> {
    let harness =
        Harness::with(|orchestrator| orchestrator.with_token_algorithm(DigestAlgorithm::Sha512))?;
    let token = harness.begin(TEST_REQUEST_ID_1, TEST_USER_IP)?;

    assert!(light_token::decode(&token, &harness.secret, DigestAlgorithm::Sha512.name()).is_ok());
    assert_eq!(
        light_token::decode(&token, &harness.secret, DigestAlgorithm::Sha256.name()).map(|_| ()),
        Err(ExchangeError::TokenDigestMismatch)
    );
    Ok(())
}
