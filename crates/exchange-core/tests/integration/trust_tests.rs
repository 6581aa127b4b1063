//! Certificate path building and revocation against a generated PKI.

use chrono::{Duration, TimeZone, Utc};
use common::clock::{Clock, FixedClock};
use exchange_core::trust::{
    CertificateTrustVerifier, CertificateVerifierParams, Credential, CrlRevocationSource,
    OcspRevocationSource, OcspTransport, RevocationSource, RevocationStatus, TrustAnchorSet,
};
use exchange_core::ExchangeError;
use exchange_test_utils::{CrlFreshness, TestPki, INTERMEDIATE_SERIAL, LEAF_SERIAL};
use openssl::x509::X509Ref;
use std::sync::{Arc, Mutex};

// ============================================================================
// Helper Functions
// ============================================================================

const NO_REVOCATION: CertificateVerifierParams = CertificateVerifierParams {
    check_revocation: false,
    soft_fail_revocation: false,
};

const HARD_FAIL: CertificateVerifierParams = CertificateVerifierParams {
    check_revocation: true,
    soft_fail_revocation: false,
};

const SOFT_FAIL: CertificateVerifierParams = CertificateVerifierParams {
    check_revocation: true,
    soft_fail_revocation: true,
};

fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
    ))
}

fn verifier(clock: Arc<FixedClock>) -> CertificateTrustVerifier {
    CertificateTrustVerifier::new(clock)
}

/// Fresh CRLs from both CAs revoking the given serials.
fn crls(
    pki: &TestPki,
    revoked_by_intermediate: &[u8],
    revoked_by_root: &[u8],
) -> Result<Arc<CrlRevocationSource>, anyhow::Error> {
    Ok(Arc::new(CrlRevocationSource::new(vec![
        pki.intermediate_crl(revoked_by_intermediate, CrlFreshness::Current)?,
        pki.root_crl(revoked_by_root, CrlFreshness::Current)?,
    ])))
}

#[derive(Debug)]
struct FixedAnswer(RevocationStatus);

impl RevocationSource for FixedAnswer {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn status(
        &self,
        _certificate: &X509Ref,
        _issuer: &X509Ref,
        _now: chrono::DateTime<Utc>,
        _deadline: Option<chrono::DateTime<Utc>>,
    ) -> RevocationStatus {
        self.0
    }
}

const RESPONDER_URL: &str = "http://ocsp.example/intermediate";

/// DER `OCSPResponse` with status `tryLater` and no body.
const TRY_LATER: [u8; 5] = [0x30, 0x03, 0x0a, 0x01, 0x03];

/// Replays one canned answer and records every fetch. When `delay` is set
/// the clock is advanced by that much before answering.
#[derive(Debug)]
struct ScriptedTransport {
    answer: Option<Vec<u8>>,
    delay: Option<(Arc<FixedClock>, Duration)>,
    fetches: Mutex<Vec<(String, Option<std::time::Duration>)>>,
}

impl ScriptedTransport {
    fn answering(answer: Option<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            answer,
            delay: None,
            fetches: Mutex::new(Vec::new()),
        })
    }

    fn hanging(clock: Arc<FixedClock>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            answer: None,
            delay: Some((clock, delay)),
            fetches: Mutex::new(Vec::new()),
        })
    }

    fn fetches(&self) -> Vec<(String, Option<std::time::Duration>)> {
        self.fetches.lock().unwrap().clone()
    }
}

impl OcspTransport for ScriptedTransport {
    fn fetch(
        &self,
        responder_url: &str,
        _request_der: &[u8],
        timeout: Option<std::time::Duration>,
    ) -> Option<Vec<u8>> {
        self.fetches
            .lock()
            .unwrap()
            .push((responder_url.to_string(), timeout));
        if let Some((clock, delay)) = &self.delay {
            clock.advance(*delay);
        }
        self.answer.clone()
    }
}

fn ocsp_verifier(clock: Arc<FixedClock>, transport: Arc<ScriptedTransport>) -> CertificateTrustVerifier {
    verifier(clock).with_revocation_source(Arc::new(OcspRevocationSource::new(transport)))
}

// ============================================================================
// Path building
// ============================================================================

#[test]
fn test_leaf_with_chain_trusted_under_root() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate()?;

    verifier(clock()).verify(&pki.leaf_credential(), &pki.root_anchors(), NO_REVOCATION)?;
    Ok(())
}

#[test]
fn test_intermediate_anchor_needs_no_chain() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate()?;
    let bare_leaf = Credential::new(pki.leaf_certificate(), Vec::new());

    verifier(clock()).verify(&bare_leaf, &pki.intermediate_anchors(), NO_REVOCATION)?;
    Ok(())
}

#[test]
fn test_missing_intermediate_is_untrusted() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate()?;
    let bare_leaf = Credential::new(pki.leaf_certificate(), Vec::new());

    assert_eq!(
        verifier(clock()).verify(&bare_leaf, &pki.root_anchors(), NO_REVOCATION),
        Err(ExchangeError::UntrustedCertificate)
    );
    Ok(())
}

#[test]
fn test_empty_anchor_set_trusts_nothing() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate()?;

    assert_eq!(
        verifier(clock()).verify(
            &pki.leaf_credential(),
            &TrustAnchorSet::empty(),
            NO_REVOCATION
        ),
        Err(ExchangeError::UntrustedCertificate)
    );
    Ok(())
}

#[test]
fn test_foreign_root_is_untrusted() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate()?;
    let other = TestPki::generate()?;

    assert_eq!(
        verifier(clock()).verify(&pki.leaf_credential(), &other.root_anchors(), NO_REVOCATION),
        Err(ExchangeError::UntrustedCertificate)
    );
    Ok(())
}

#[test]
fn test_anchor_set_is_per_call() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate()?;
    let verifier = verifier(clock());

    assert!(verifier
        .verify(&pki.leaf_credential(), &pki.root_anchors(), NO_REVOCATION)
        .is_ok());
    assert_eq!(
        verifier.verify(&pki.leaf_credential(), &TrustAnchorSet::empty(), NO_REVOCATION),
        Err(ExchangeError::UntrustedCertificate)
    );
    Ok(())
}

// ============================================================================
// Revocation
// ============================================================================

#[test]
fn test_good_crls_pass_hard_fail() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate()?;
    let verifier = verifier(clock()).with_revocation_source(crls(&pki, &[], &[])?);

    verifier.verify(&pki.leaf_credential(), &pki.root_anchors(), HARD_FAIL)?;
    Ok(())
}

#[test]
fn test_revoked_leaf_fails() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate()?;
    let verifier = verifier(clock()).with_revocation_source(crls(&pki, &[LEAF_SERIAL], &[])?);

    assert_eq!(
        verifier.verify(&pki.leaf_credential(), &pki.root_anchors(), SOFT_FAIL),
        Err(ExchangeError::CertificateRevoked)
    );
    Ok(())
}

#[test]
fn test_revoked_intermediate_fails() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate()?;
    let verifier =
        verifier(clock()).with_revocation_source(crls(&pki, &[], &[INTERMEDIATE_SERIAL])?);

    assert_eq!(
        verifier.verify(&pki.leaf_credential(), &pki.root_anchors(), HARD_FAIL),
        Err(ExchangeError::CertificateRevoked)
    );
    Ok(())
}

#[test]
fn test_anchor_itself_is_not_revocation_checked() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate()?;
    let verifier =
        verifier(clock()).with_revocation_source(crls(&pki, &[], &[INTERMEDIATE_SERIAL])?);

    verifier.verify(&pki.leaf_credential(), &pki.intermediate_anchors(), HARD_FAIL)?;
    Ok(())
}

#[test]
fn test_revocation_ignored_when_disabled() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate()?;
    let verifier = verifier(clock()).with_revocation_source(crls(&pki, &[LEAF_SERIAL], &[])?);

    verifier.verify(&pki.leaf_credential(), &pki.root_anchors(), NO_REVOCATION)?;
    Ok(())
}

#[test]
fn test_missing_crl_soft_fail_vs_hard_fail() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate()?;
    let root_only = Arc::new(CrlRevocationSource::new(vec![
        pki.root_crl(&[], CrlFreshness::Current)?
    ]));
    let verifier = verifier(clock()).with_revocation_source(root_only);

    verifier.verify(&pki.leaf_credential(), &pki.root_anchors(), SOFT_FAIL)?;
    assert_eq!(
        verifier.verify(&pki.leaf_credential(), &pki.root_anchors(), HARD_FAIL),
        Err(ExchangeError::MissingRevocationData)
    );
    Ok(())
}

#[test]
fn test_stale_crl_is_unusable() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate()?;
    let stale = Arc::new(CrlRevocationSource::new(vec![
        pki.intermediate_crl(&[LEAF_SERIAL], CrlFreshness::Expired)?,
        pki.root_crl(&[], CrlFreshness::Current)?,
    ]));
    let verifier = verifier(clock()).with_revocation_source(stale);

    assert_eq!(
        verifier.verify(&pki.leaf_credential(), &pki.root_anchors(), HARD_FAIL),
        Err(ExchangeError::MissingRevocationData)
    );
    Ok(())
}

#[test]
fn test_crl_with_bad_signature_is_unusable() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate()?;
    let forged = Arc::new(CrlRevocationSource::new(vec![
        pki.forged_intermediate_crl(&[LEAF_SERIAL])?,
        pki.root_crl(&[], CrlFreshness::Current)?,
    ]));
    let verifier = verifier(clock()).with_revocation_source(forged);

    assert_eq!(
        verifier.verify(&pki.leaf_credential(), &pki.root_anchors(), HARD_FAIL),
        Err(ExchangeError::MissingRevocationData)
    );
    Ok(())
}

#[test]
fn test_first_definitive_source_wins() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate()?;
    let good_first = verifier(clock())
        .with_revocation_source(Arc::new(FixedAnswer(RevocationStatus::Unavailable)))
        .with_revocation_source(Arc::new(FixedAnswer(RevocationStatus::Good)))
        .with_revocation_source(crls(&pki, &[LEAF_SERIAL], &[])?);

    good_first.verify(&pki.leaf_credential(), &pki.root_anchors(), HARD_FAIL)?;

    let revoking_first = verifier(clock())
        .with_revocation_source(Arc::new(FixedAnswer(RevocationStatus::Revoked)))
        .with_revocation_source(Arc::new(FixedAnswer(RevocationStatus::Good)));
    assert_eq!(
        revoking_first.verify(&pki.leaf_credential(), &pki.root_anchors(), HARD_FAIL),
        Err(ExchangeError::CertificateRevoked)
    );
    Ok(())
}

// ============================================================================
// OCSP
// ============================================================================

#[test]
fn test_ocsp_without_responder_is_missing_data() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate()?;
    let transport = ScriptedTransport::answering(None);
    let verifier = ocsp_verifier(clock(), transport.clone());

    assert_eq!(
        verifier.verify(&pki.leaf_credential(), &pki.intermediate_anchors(), HARD_FAIL),
        Err(ExchangeError::MissingRevocationData)
    );
    verifier.verify(&pki.leaf_credential(), &pki.intermediate_anchors(), SOFT_FAIL)?;
    assert!(transport.fetches().is_empty());
    Ok(())
}

#[test]
fn test_ocsp_unreachable_responder_is_missing_data() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate_with_ocsp_responder(RESPONDER_URL)?;
    let transport = ScriptedTransport::answering(None);
    let verifier = ocsp_verifier(clock(), transport.clone());

    assert_eq!(
        verifier.verify(&pki.leaf_credential(), &pki.intermediate_anchors(), HARD_FAIL),
        Err(ExchangeError::MissingRevocationData)
    );
    verifier.verify(&pki.leaf_credential(), &pki.intermediate_anchors(), SOFT_FAIL)?;
    assert_eq!(
        transport.fetches(),
        vec![
            (RESPONDER_URL.to_string(), None),
            (RESPONDER_URL.to_string(), None)
        ]
    );
    Ok(())
}

#[test]
fn test_ocsp_garbage_response_is_missing_data() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate_with_ocsp_responder(RESPONDER_URL)?;
    let verifier = ocsp_verifier(
        clock(),
        ScriptedTransport::answering(Some(b"<html>502 Bad Gateway</html>".to_vec())),
    );

    assert_eq!(
        verifier.verify(&pki.leaf_credential(), &pki.intermediate_anchors(), HARD_FAIL),
        Err(ExchangeError::MissingRevocationData)
    );
    verifier.verify(&pki.leaf_credential(), &pki.intermediate_anchors(), SOFT_FAIL)?;
    Ok(())
}

#[test]
fn test_ocsp_error_status_is_missing_data() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate_with_ocsp_responder(RESPONDER_URL)?;
    let verifier = ocsp_verifier(clock(), ScriptedTransport::answering(Some(TRY_LATER.to_vec())));

    assert_eq!(
        verifier.verify(&pki.leaf_credential(), &pki.intermediate_anchors(), HARD_FAIL),
        Err(ExchangeError::MissingRevocationData)
    );
    verifier.verify(&pki.leaf_credential(), &pki.intermediate_anchors(), SOFT_FAIL)?;
    Ok(())
}

#[test]
fn test_ocsp_source_answers_unavailable_directly() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate_with_ocsp_responder(RESPONDER_URL)?;
    let leaf = pki.leaf_certificate();
    let issuer = pki.intermediate_certificate();
    let now = clock().now();

    for answer in [None, Some(b"junk".to_vec()), Some(TRY_LATER.to_vec())] {
        let source = OcspRevocationSource::new(ScriptedTransport::answering(answer));
        assert_eq!(
            source.status(&leaf, &issuer, now, None),
            RevocationStatus::Unavailable
        );
    }
    Ok(())
}

#[test]
fn test_ocsp_falls_back_to_crl() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate_with_ocsp_responder(RESPONDER_URL)?;
    let crl = Arc::new(CrlRevocationSource::new(vec![
        pki.intermediate_crl(&[LEAF_SERIAL], CrlFreshness::Current)?
    ]));
    let verifier = ocsp_verifier(clock(), ScriptedTransport::answering(Some(TRY_LATER.to_vec())))
        .with_revocation_source(crl);

    assert_eq!(
        verifier.verify(&pki.leaf_credential(), &pki.intermediate_anchors(), HARD_FAIL),
        Err(ExchangeError::CertificateRevoked)
    );
    Ok(())
}

// ============================================================================
// Deadline
// ============================================================================

#[test]
fn test_ocsp_transport_gets_remaining_time() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate_with_ocsp_responder(RESPONDER_URL)?;
    let clock = clock();
    let deadline = clock.now() + Duration::seconds(5);
    let transport = ScriptedTransport::answering(None);

    ocsp_verifier(clock, transport.clone()).verify_with_deadline(
        &pki.leaf_credential(),
        &pki.intermediate_anchors(),
        SOFT_FAIL,
        Some(deadline),
    )?;
    assert_eq!(
        transport.fetches(),
        vec![(
            RESPONDER_URL.to_string(),
            Some(std::time::Duration::from_secs(5))
        )]
    );
    Ok(())
}

#[test]
fn test_slow_ocsp_responder_aborts_verification() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate_with_ocsp_responder(RESPONDER_URL)?;
    let clock = clock();
    let deadline = clock.now() + Duration::seconds(5);
    let transport = ScriptedTransport::hanging(clock.clone(), Duration::seconds(30));

    for params in [SOFT_FAIL, HARD_FAIL] {
        clock.set(deadline - Duration::seconds(5));
        assert_eq!(
            ocsp_verifier(clock.clone(), transport.clone()).verify_with_deadline(
                &pki.leaf_credential(),
                &pki.intermediate_anchors(),
                params,
                Some(deadline),
            ),
            Err(ExchangeError::VerificationAborted)
        );
    }
    Ok(())
}

#[test]
fn test_deadline_reached_aborts() -> Result<(), anyhow::Error> {
    let pki = TestPki::generate()?;
    let clock = clock();
    let now = clock.now();
    let verifier = verifier(clock);

    assert_eq!(
        verifier.verify_with_deadline(
            &pki.leaf_credential(),
            &pki.root_anchors(),
            NO_REVOCATION,
            Some(now)
        ),
        Err(ExchangeError::VerificationAborted)
    );

    verifier.verify_with_deadline(
        &pki.leaf_credential(),
        &pki.root_anchors(),
        NO_REVOCATION,
        Some(now + Duration::seconds(5)),
    )?;
    Ok(())
}
