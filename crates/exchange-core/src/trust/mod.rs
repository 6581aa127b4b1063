//! X.509 trust verification.
//!
//! [`CertificateTrustVerifier::verify`] answers one question: does the
//! credential's leaf chain up to a certificate in the caller's
//! [`TrustAnchorSet`], and (optionally) is every certificate below that
//! anchor unrevoked?
//!
//! # Algorithm
//!
//! 1. Build a path from the leaf through the credential's adjunct chain and
//!    the trust anchors. Trusted issuers are preferred, loops are rejected
//!    and depth is capped at [`MAX_PATH_DEPTH`].
//! 2. Walk the path from the leaf; the first certificate found in the
//!    anchor set ends the walk. None found is `UntrustedCertificate`, which
//!    also covers a path that could not be built at all.
//! 3. If revocation checking is on, each certificate below the anchor is
//!    checked against its issuer. Revoked fails hard; missing data fails
//!    unless soft-fail is set, in which case it is logged.
//!
//! Trust anchors are supplied per call; nothing here is process-global.

mod ocsp;
mod revocation;

pub use self::ocsp::{OcspRevocationSource, OcspTransport};
pub use self::revocation::{CrlRevocationSource, RevocationSource, RevocationStatus};

use crate::errors::ExchangeError;
use crate::observability::metrics;
use chrono::{DateTime, Utc};
use common::clock::{Clock, SystemClock};
use openssl::x509::{X509Ref, X509VerifyResult, X509};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Longest path the builder will follow from the leaf.
pub const MAX_PATH_DEPTH: usize = 10;

// =============================================================================
// Inputs
// =============================================================================

/// A leaf certificate plus the untrusted intermediates supplied with it.
#[derive(Clone)]
pub struct Credential {
    certificate: X509,
    chain: Vec<X509>,
}

impl Credential {
    pub fn new(certificate: X509, chain: Vec<X509>) -> Self {
        Self { certificate, chain }
    }

    /// # Errors
    ///
    /// Returns the OpenSSL error if any certificate fails to parse.
    pub fn from_der<B: AsRef<[u8]>>(
        certificate: &[u8],
        chain: &[B],
    ) -> Result<Self, openssl::error::ErrorStack> {
        let certificate = X509::from_der(certificate)?;
        let chain = chain
            .iter()
            .map(|der| X509::from_der(der.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(certificate, chain))
    }

    pub fn certificate(&self) -> &X509Ref {
        &self.certificate
    }

    pub fn chain(&self) -> &[X509] {
        &self.chain
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("subject", &subject_label(&self.certificate))
            .field("chain", &self.chain.len())
            .finish()
    }
}

/// Certificates accepted as roots of trust for one verification.
#[derive(Clone, Default)]
pub struct TrustAnchorSet {
    anchors: Vec<X509>,
    encoded: HashSet<Vec<u8>>,
}

impl TrustAnchorSet {
    /// # Errors
    ///
    /// Returns the OpenSSL error if a certificate cannot be DER-encoded.
    pub fn new(anchors: Vec<X509>) -> Result<Self, openssl::error::ErrorStack> {
        let encoded = anchors
            .iter()
            .map(|cert| cert.to_der())
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(Self { anchors, encoded })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a PEM bundle such as the certificates extracted from peer
    /// metadata.
    ///
    /// # Errors
    ///
    /// Returns the OpenSSL error if the bundle does not parse.
    pub fn from_pem(pem: &[u8]) -> Result<Self, openssl::error::ErrorStack> {
        Self::new(X509::stack_from_pem(pem)?)
    }

    pub fn contains(&self, certificate: &X509Ref) -> bool {
        certificate
            .to_der()
            .map(|der| self.encoded.contains(&der))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &X509> {
        self.anchors.iter()
    }
}

impl fmt::Debug for TrustAnchorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustAnchorSet")
            .field("anchors", &self.anchors.len())
            .finish()
    }
}

/// Revocation policy for one verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertificateVerifierParams {
    pub check_revocation: bool,
    pub soft_fail_revocation: bool,
}

impl Default for CertificateVerifierParams {
    fn default() -> Self {
        Self {
            check_revocation: true,
            soft_fail_revocation: true,
        }
    }
}

// =============================================================================
// Verifier
// =============================================================================

/// Stateless trust verifier; safe to share across threads.
#[derive(Debug, Clone)]
pub struct CertificateTrustVerifier {
    revocation_sources: Vec<Arc<dyn RevocationSource>>,
    clock: Arc<dyn Clock>,
}

impl Default for CertificateTrustVerifier {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl CertificateTrustVerifier {
    /// A verifier with no revocation sources.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            revocation_sources: Vec::new(),
            clock,
        }
    }

    /// Append a revocation source. Sources are consulted in insertion order.
    #[must_use]
    pub fn with_revocation_source(mut self, source: Arc<dyn RevocationSource>) -> Self {
        self.revocation_sources.push(source);
        self
    }

    /// Verify `credential` against `anchors`.
    ///
    /// # Errors
    ///
    /// `UntrustedCertificate`, `CertificateRevoked` or `MissingRevocationData`.
    pub fn verify(
        &self,
        credential: &Credential,
        anchors: &TrustAnchorSet,
        params: CertificateVerifierParams,
    ) -> Result<(), ExchangeError> {
        self.verify_with_deadline(credential, anchors, params, None)
    }

    /// As [`verify`](Self::verify), aborting with `VerificationAborted` once
    /// the injected clock reaches `deadline`.
    ///
    /// # Errors
    ///
    /// As [`verify`](Self::verify), plus `VerificationAborted`.
    #[instrument(skip_all)]
    pub fn verify_with_deadline(
        &self,
        credential: &Credential,
        anchors: &TrustAnchorSet,
        params: CertificateVerifierParams,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<(), ExchangeError> {
        let result = self.verify_inner(credential, anchors, params, deadline);

        match &result {
            Ok(()) => {
                debug!(
                    target: "exchange.trust",
                    subject = %subject_label(credential.certificate()),
                    "Certificate trusted"
                );
                metrics::record_trust_verification("success", None);
            }
            Err(e) => {
                debug!(
                    target: "exchange.trust",
                    subject = %subject_label(credential.certificate()),
                    error_kind = e.kind(),
                    "Certificate verification failed"
                );
                metrics::record_trust_verification("error", Some(e.kind()));
            }
        }

        result
    }

    fn verify_inner(
        &self,
        credential: &Credential,
        anchors: &TrustAnchorSet,
        params: CertificateVerifierParams,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<(), ExchangeError> {
        self.check_deadline(deadline)?;

        if anchors.is_empty() {
            return Err(ExchangeError::UntrustedCertificate);
        }

        let path = build_path(credential, anchors);
        let Some(anchor_index) = path.iter().position(|cert| anchors.contains(cert)) else {
            debug!(
                target: "exchange.trust",
                path_length = path.len(),
                "No trust anchor on certificate path"
            );
            return Err(ExchangeError::UntrustedCertificate);
        };

        if !params.check_revocation {
            return Ok(());
        }

        let below_anchor = path.get(..=anchor_index).unwrap_or_default();
        for pair in below_anchor.windows(2) {
            let [certificate, issuer] = pair else {
                continue;
            };
            self.check_revocation(certificate, issuer, params, deadline)?;
        }

        Ok(())
    }

    fn check_revocation(
        &self,
        certificate: &X509Ref,
        issuer: &X509Ref,
        params: CertificateVerifierParams,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<(), ExchangeError> {
        let mut status = RevocationStatus::Unavailable;

        for source in &self.revocation_sources {
            self.check_deadline(deadline)?;
            status = source.status(certificate, issuer, self.clock.now(), deadline);
            // An answer that arrives after the deadline is discarded.
            self.check_deadline(deadline)?;
            debug!(
                target: "exchange.trust",
                source = source.name(),
                status = ?status,
                "Revocation source answered"
            );
            if status != RevocationStatus::Unavailable {
                break;
            }
        }

        match status {
            RevocationStatus::Good => Ok(()),
            RevocationStatus::Revoked => Err(ExchangeError::CertificateRevoked),
            RevocationStatus::Unavailable if params.soft_fail_revocation => {
                warn!(
                    target: "exchange.trust",
                    subject = %subject_label(certificate),
                    "Revocation data unavailable, continuing under soft-fail"
                );
                metrics::record_revocation_soft_failure();
                Ok(())
            }
            RevocationStatus::Unavailable => Err(ExchangeError::MissingRevocationData),
        }
    }

    fn check_deadline(&self, deadline: Option<DateTime<Utc>>) -> Result<(), ExchangeError> {
        match deadline {
            Some(deadline) if self.clock.now() >= deadline => {
                warn!(target: "exchange.trust", "Certificate verification deadline reached");
                Err(ExchangeError::VerificationAborted)
            }
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Path building
// =============================================================================

fn build_path(credential: &Credential, anchors: &TrustAnchorSet) -> Vec<X509> {
    let mut path = vec![credential.certificate.clone()];
    let mut seen: HashSet<Vec<u8>> = credential.certificate.to_der().into_iter().collect();

    while path.len() < MAX_PATH_DEPTH {
        let Some(current) = path.last() else {
            break;
        };
        if anchors.contains(current) {
            break;
        }

        let issuer = anchors
            .iter()
            .chain(credential.chain.iter())
            .find(|candidate| {
                let unseen = candidate
                    .to_der()
                    .map(|der| !seen.contains(&der))
                    .unwrap_or(false);
                unseen && issued_by(current, candidate)
            })
            .cloned();

        let Some(issuer) = issuer else {
            break;
        };
        if let Ok(der) = issuer.to_der() {
            seen.insert(der);
        }
        path.push(issuer);
    }

    path
}

fn issued_by(subject: &X509Ref, issuer: &X509Ref) -> bool {
    if issuer.issued(subject) != X509VerifyResult::OK {
        return false;
    }
    issuer
        .public_key()
        .and_then(|key| subject.verify(&key))
        .unwrap_or(false)
}

fn subject_label(certificate: &X509Ref) -> String {
    certificate
        .subject_name()
        .entries()
        .filter_map(|entry| entry.data().to_string().ok())
        .collect::<Vec<_>>()
        .join(",")
}
