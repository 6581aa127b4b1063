//! Response security pipeline against responses built and signed the way an
//! identity provider would.

use chrono::{DateTime, Duration, TimeZone, Utc};
use common::clock::FixedClock;
use exchange_core::response::{
    DataEncryptionAlgorithm, DecryptionCredential, PipelineConfig, ResponseSecurityPipeline,
    SignatureAlgorithm, ValidationContext,
};
use exchange_core::trust::{
    CertificateTrustVerifier, CertificateVerifierParams, CrlRevocationSource, TrustAnchorSet,
};
use exchange_core::ExchangeError;
use exchange_test_utils::{
    rsa_signing_credential, test_decryption_credential, CrlFreshness, ExchangeResultAssertions,
    ResponseAssertions, TestAssertion, TestPki, TestResponseBuilder, FAMILY_NAME, LEAF_SERIAL,
    PERSON_IDENTIFIER, TEST_ASSERTION_ID, TEST_AUDIENCE, TEST_DESTINATION, TEST_IDP_ISSUER,
    TEST_LEVEL_OF_ASSURANCE, TEST_OTHER_IP, TEST_REQUEST_ID_1, TEST_RESPONSE_ID,
    TEST_SUBJECT_NAME_ID, TEST_USER_IP,
};
use std::sync::Arc;

// ============================================================================
// Helper Functions
// ============================================================================

struct Fixture {
    pki: TestPki,
    recipient: DecryptionCredential,
    clock: Arc<FixedClock>,
    anchors: TrustAnchorSet,
}

impl Fixture {
    fn new() -> Result<Self, anyhow::Error> {
        let pki = TestPki::generate()?;
        let anchors = pki.root_anchors();
        Ok(Self {
            pki,
            recipient: test_decryption_credential("Test Connector")?,
            clock: Arc::new(FixedClock::new(t0())),
            anchors,
        })
    }

    fn pipeline(&self, config: PipelineConfig) -> ResponseSecurityPipeline {
        ResponseSecurityPipeline::new(
            config,
            CertificateTrustVerifier::new(self.clock.clone()),
            self.clock.clone(),
        )
        .with_decryption_credential(self.recipient.clone())
    }

    /// Signed by the PKI leaf, assertion encrypted for the connector.
    fn response(&self) -> TestResponseBuilder {
        TestResponseBuilder::new(t0())
            .signed_by(self.pki.leaf_signer(), SignatureAlgorithm::EcdsaSha256)
            .encrypted_for(self.recipient.certificate())
    }

    fn context(&self) -> ValidationContext<'_> {
        ValidationContext::new(&self.anchors).with_bearer_ip(TEST_USER_IP)
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn config() -> PipelineConfig {
    PipelineConfig {
        expected_audience: Some(TEST_AUDIENCE.to_string()),
        verifier_params: CertificateVerifierParams {
            check_revocation: false,
            soft_fail_revocation: true,
        },
        ..PipelineConfig::default()
    }
}

fn plaintext_config() -> PipelineConfig {
    PipelineConfig {
        encryption_required: false,
        ..config()
    }
}

// ============================================================================
// Accepted responses
// ============================================================================

#[test]
fn test_signed_encrypted_response_is_accepted() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let xml = fixture.response().build()?;

    let response = fixture
        .pipeline(config())
        .process(xml.as_bytes(), &fixture.context())
        .assert_accepted();

    response.assert_answers(TEST_REQUEST_ID_1);
    assert!(response.was_encrypted());
    assert_eq!(response.id(), TEST_RESPONSE_ID);
    assert_eq!(response.issuer(), Some(TEST_IDP_ISSUER));
    assert_eq!(response.destination(), Some(TEST_DESTINATION));

    let assertion = response.assert_has_assertion();
    assert_eq!(assertion.id(), TEST_ASSERTION_ID);
    assert_eq!(assertion.issuer(), TEST_IDP_ISSUER);
    assert_eq!(assertion.subject_name_id(), Some(TEST_SUBJECT_NAME_ID));
    assert_eq!(assertion.level_of_assurance(), Some(TEST_LEVEL_OF_ASSURANCE));
    assert_eq!(assertion.audiences(), [TEST_AUDIENCE.to_string()]);
    assert_eq!(assertion.not_before(), t0() - Duration::minutes(1));
    assert_eq!(assertion.not_on_or_after(), t0() + Duration::minutes(5));
    assert_eq!(
        assertion.attribute(PERSON_IDENTIFIER).map(|a| a.values()),
        Some([TEST_SUBJECT_NAME_ID.to_string()].as_slice())
    );
    assert_eq!(
        assertion.attribute(FAMILY_NAME).map(|a| a.values()),
        Some(["Garcia".to_string()].as_slice())
    );
    Ok(())
}

#[test]
fn test_signed_assertion_inside_encryption_is_verified() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let signer = fixture.pki.leaf_signer();
    let xml = fixture
        .response()
        .map_assertions(|assertion| assertion.signed_by(signer.clone(), SignatureAlgorithm::EcdsaSha384))
        .build()?;

    let config = PipelineConfig {
        require_signed_assertion: true,
        ..config()
    };
    fixture
        .pipeline(config)
        .process(xml.as_bytes(), &fixture.context())
        .assert_accepted()
        .assert_has_assertion();
    Ok(())
}

#[test]
fn test_unsigned_assertion_rejected_when_assertion_signature_required() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let xml = fixture.response().build()?;

    let config = PipelineConfig {
        require_signed_assertion: true,
        ..config()
    };
    fixture
        .pipeline(config)
        .process(xml.as_bytes(), &fixture.context())
        .assert_rejected_with(ExchangeError::InvalidSignature);
    Ok(())
}

#[test]
fn test_cbc_encrypted_assertion_is_accepted() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let xml = TestResponseBuilder::new(t0())
        .signed_by(fixture.pki.leaf_signer(), SignatureAlgorithm::EcdsaSha512)
        .encrypted_with(fixture.recipient.certificate(), DataEncryptionAlgorithm::Aes256Cbc)
        .build()?;

    let response = fixture
        .pipeline(config())
        .process(xml.as_bytes(), &fixture.context())
        .assert_accepted();
    assert!(response.was_encrypted());
    Ok(())
}

#[test]
fn test_rsa_pss_signature_is_accepted() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let signer = rsa_signing_credential("Test RSA Proxy")?;
    let anchors = signer.self_anchored();
    let xml = TestResponseBuilder::new(t0())
        .signed_by(signer, SignatureAlgorithm::RsaPssSha256)
        .encrypted_for(fixture.recipient.certificate())
        .build()?;

    let context = ValidationContext::new(&anchors).with_bearer_ip(TEST_USER_IP);
    fixture
        .pipeline(config())
        .process(xml.as_bytes(), &context)
        .assert_accepted();
    Ok(())
}

#[test]
fn test_plaintext_assertion_accepted_when_encryption_optional() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let xml = TestResponseBuilder::new(t0())
        .signed_by(fixture.pki.leaf_signer(), SignatureAlgorithm::EcdsaSha256)
        .build()?;

    let response = fixture
        .pipeline(plaintext_config())
        .process(xml.as_bytes(), &fixture.context())
        .assert_accepted();
    assert!(!response.was_encrypted());
    Ok(())
}

#[test]
fn test_signed_failure_response_has_no_assertion() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let xml = fixture.response().failed("Citizen cancelled").build()?;

    let response = fixture
        .pipeline(config())
        .process(xml.as_bytes(), &fixture.context())
        .assert_accepted();
    assert!(!response.status().is_success());
    assert_eq!(response.status().message(), Some("Citizen cancelled"));
    assert!(response.assertion().is_none());
    Ok(())
}

// ============================================================================
// Encryption and decryption
// ============================================================================

#[test]
fn test_plaintext_assertion_rejected_when_encryption_required() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let xml = TestResponseBuilder::new(t0())
        .signed_by(fixture.pki.leaf_signer(), SignatureAlgorithm::EcdsaSha256)
        .build()?;

    fixture
        .pipeline(config())
        .process(xml.as_bytes(), &fixture.context())
        .assert_rejected_with(ExchangeError::EncryptionRequired);
    Ok(())
}

#[test]
fn test_assertion_for_other_recipient_fails_decryption() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let stranger = test_decryption_credential("Someone Else")?;
    let xml = TestResponseBuilder::new(t0())
        .signed_by(fixture.pki.leaf_signer(), SignatureAlgorithm::EcdsaSha256)
        .encrypted_for(stranger.certificate())
        .build()?;

    fixture
        .pipeline(config())
        .process(xml.as_bytes(), &fixture.context())
        .assert_rejected_with(ExchangeError::DecryptionFailed);
    Ok(())
}

// ============================================================================
// Signatures
// ============================================================================

#[test]
fn test_unsigned_response_rejected() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let xml = TestResponseBuilder::new(t0())
        .encrypted_for(fixture.recipient.certificate())
        .build()?;

    fixture
        .pipeline(config())
        .process(xml.as_bytes(), &fixture.context())
        .assert_rejected_with(ExchangeError::InvalidSignature);
    Ok(())
}

#[test]
fn test_tampered_response_rejected() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let xml = fixture
        .response()
        .build()?
        .replace(TEST_DESTINATION, "https://elsewhere.example/response");

    fixture
        .pipeline(config())
        .process(xml.as_bytes(), &fixture.context())
        .assert_rejected_with(ExchangeError::InvalidSignature);
    Ok(())
}

#[test]
fn test_tampered_plaintext_assertion_rejected() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let xml = TestResponseBuilder::new(t0())
        .signed_by(fixture.pki.leaf_signer(), SignatureAlgorithm::EcdsaSha256)
        .build()?
        .replace("Garcia", "Mallory");

    fixture
        .pipeline(plaintext_config())
        .process(xml.as_bytes(), &fixture.context())
        .assert_rejected_with(ExchangeError::InvalidSignature);
    Ok(())
}

#[test]
fn test_duplicate_id_rejected() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let xml = TestResponseBuilder::new(t0())
        .with_assertion(TestAssertion::new(t0()).with_id(TEST_RESPONSE_ID))
        .signed_by(fixture.pki.leaf_signer(), SignatureAlgorithm::EcdsaSha256)
        .build()?;

    fixture
        .pipeline(plaintext_config())
        .process(xml.as_bytes(), &fixture.context())
        .assert_rejected_with(ExchangeError::InvalidSignature);
    Ok(())
}

#[test]
fn test_algorithm_outside_allow_list_rejected() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let xml = fixture.response().build()?;

    let config = PipelineConfig {
        signature_allow_list: vec![SignatureAlgorithm::RsaSha256],
        ..config()
    };
    fixture
        .pipeline(config)
        .process(xml.as_bytes(), &fixture.context())
        .assert_rejected_with(ExchangeError::DisallowedSignatureAlgorithm);
    Ok(())
}

#[test]
fn test_rsa_sha1_rejected_by_default() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let signer = rsa_signing_credential("Legacy Proxy")?;
    let anchors = signer.self_anchored();
    let xml = TestResponseBuilder::new(t0())
        .signed_by(signer, SignatureAlgorithm::RsaSha1)
        .encrypted_for(fixture.recipient.certificate())
        .build()?;

    let context = ValidationContext::new(&anchors).with_bearer_ip(TEST_USER_IP);
    fixture
        .pipeline(config())
        .process(xml.as_bytes(), &context)
        .assert_rejected_with(ExchangeError::DisallowedSignatureAlgorithm);
    Ok(())
}

#[test]
fn test_untrusted_signer_rejected() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let xml = fixture.response().build()?;
    let empty = TrustAnchorSet::empty();

    fixture
        .pipeline(config())
        .process(
            xml.as_bytes(),
            &ValidationContext::new(&empty).with_bearer_ip(TEST_USER_IP),
        )
        .assert_rejected_with(ExchangeError::UntrustedCertificate);
    Ok(())
}

#[test]
fn test_revoked_signer_rejected() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let xml = fixture.response().build()?;
    let crls = CrlRevocationSource::new(vec![
        fixture.pki.intermediate_crl(&[LEAF_SERIAL], CrlFreshness::Current)?,
        fixture.pki.root_crl(&[], CrlFreshness::Current)?,
    ]);

    let config = PipelineConfig {
        verifier_params: CertificateVerifierParams::default(),
        ..config()
    };
    let pipeline = ResponseSecurityPipeline::new(
        config,
        CertificateTrustVerifier::new(fixture.clock.clone()).with_revocation_source(Arc::new(crls)),
        fixture.clock.clone(),
    )
    .with_decryption_credential(fixture.recipient.clone());

    pipeline
        .process(xml.as_bytes(), &fixture.context())
        .assert_rejected_with(ExchangeError::CertificateRevoked);
    Ok(())
}

// ============================================================================
// Status and assertion count
// ============================================================================

#[test]
fn test_success_without_assertion_is_malformed() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let xml = fixture.response().without_assertions().build()?;

    fixture
        .pipeline(config())
        .process(xml.as_bytes(), &fixture.context())
        .assert_rejected_with(ExchangeError::MalformedResponse);
    Ok(())
}

#[test]
fn test_two_assertions_are_malformed() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let xml = fixture
        .response()
        .with_assertions(vec![
            TestAssertion::new(t0()).with_id("_assert-a"),
            TestAssertion::new(t0()).with_id("_assert-b"),
        ])
        .build()?;

    fixture
        .pipeline(config())
        .process(xml.as_bytes(), &fixture.context())
        .assert_rejected_with(ExchangeError::MalformedResponse);
    Ok(())
}

// ============================================================================
// Conditions
// ============================================================================

#[test]
fn test_validity_window_with_skew() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let xml = fixture
        .response()
        .with_assertion(TestAssertion::new(t0()).with_window(t0(), t0() + Duration::minutes(10)))
        .build()?;
    let pipeline = fixture.pipeline(config());
    let process = || pipeline.process(xml.as_bytes(), &fixture.context());

    fixture.clock.set(t0() - Duration::seconds(61));
    process().assert_rejected_with(ExchangeError::TokenNotYetValid);

    fixture.clock.set(t0() - Duration::seconds(59));
    process().assert_accepted();

    fixture.clock.set(t0() + Duration::minutes(10) + Duration::seconds(59));
    process().assert_accepted();

    fixture.clock.set(t0() + Duration::minutes(10) + Duration::seconds(61));
    process().assert_rejected_with(ExchangeError::TokenExpired);
    Ok(())
}

#[test]
fn test_bearer_address_must_match_caller() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let xml = fixture.response().build()?;
    let pipeline = fixture.pipeline(config());

    pipeline
        .process(
            xml.as_bytes(),
            &ValidationContext::new(&fixture.anchors).with_bearer_ip(TEST_OTHER_IP),
        )
        .assert_rejected_with(ExchangeError::SubjectConfirmationMismatch);

    pipeline
        .process(xml.as_bytes(), &ValidationContext::new(&fixture.anchors))
        .assert_rejected_with(ExchangeError::SubjectConfirmationMismatch);
    Ok(())
}

#[test]
fn test_bearer_confirmation_without_address_rejected() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let xml = fixture
        .response()
        .map_assertions(TestAssertion::without_bearer_address)
        .build()?;

    fixture
        .pipeline(config())
        .process(xml.as_bytes(), &fixture.context())
        .assert_rejected_with(ExchangeError::SubjectConfirmationMismatch);
    Ok(())
}

#[test]
fn test_bearer_check_can_be_disabled() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let xml = fixture
        .response()
        .map_assertions(|assertion| assertion.with_bearer_address(TEST_OTHER_IP))
        .build()?;

    let config = PipelineConfig {
        check_bearer_ip: false,
        ..config()
    };
    fixture
        .pipeline(config)
        .process(xml.as_bytes(), &fixture.context())
        .assert_accepted();
    Ok(())
}

#[test]
fn test_audience_mismatch_rejected() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let pipeline = fixture.pipeline(config());

    let foreign = fixture
        .response()
        .map_assertions(|assertion| assertion.with_audience("https://other-connector.example"))
        .build()?;
    pipeline
        .process(foreign.as_bytes(), &fixture.context())
        .assert_rejected_with(ExchangeError::AudienceRestrictionMismatch);

    let missing = fixture
        .response()
        .map_assertions(TestAssertion::without_audience)
        .build()?;
    pipeline
        .process(missing.as_bytes(), &fixture.context())
        .assert_rejected_with(ExchangeError::AudienceRestrictionMismatch);
    Ok(())
}

#[test]
fn test_exactly_one_attribute_statement_required() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let pipeline = fixture.pipeline(config());

    for count in [0, 2] {
        let xml = fixture
            .response()
            .map_assertions(|assertion| assertion.with_attribute_statements(count))
            .build()?;
        pipeline
            .process(xml.as_bytes(), &fixture.context())
            .assert_rejected_with(ExchangeError::MissingAttributeStatement);
    }
    Ok(())
}

// ============================================================================
// Parsing
// ============================================================================

#[test]
fn test_doctype_rejected() -> Result<(), anyhow::Error> {
    let fixture = Fixture::new()?;
    let xml = format!(
        "<!DOCTYPE r [<!ENTITY x \"y\">]>{}",
        fixture.response().build()?
    );

    fixture
        .pipeline(config())
        .process(xml.as_bytes(), &fixture.context())
        .assert_rejected_with(ExchangeError::MalformedResponse);
    Ok(())
}
