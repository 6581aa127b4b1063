//! Revocation status sources.
//!
//! The verifier asks each configured [`RevocationSource`] in order and takes
//! the first definitive answer, so placing an OCSP source ahead of a CRL
//! source gives OCSP-with-CRL-fallback.

use chrono::{DateTime, Utc};
use openssl::asn1::Asn1Time;
use openssl::x509::{CrlStatus, X509Crl, X509Ref};
use std::cmp::Ordering;
use std::fmt;
use tracing::debug;

/// Answer from a revocation source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationStatus {
    Good,
    Revoked,
    /// The source has no usable data for this certificate.
    Unavailable,
}

/// Something that can say whether `certificate` (issued by `issuer`) is revoked.
///
/// Sources must not fail hard: unreachable responders, stale or unverifiable
/// data all map to [`RevocationStatus::Unavailable`] so the verifier can
/// apply its soft-fail policy.
pub trait RevocationSource: Send + Sync + fmt::Debug {
    /// Short label for logs.
    fn name(&self) -> &'static str;

    /// Sources that do I/O must stop waiting once `deadline` passes and
    /// answer [`RevocationStatus::Unavailable`].
    fn status(
        &self,
        certificate: &X509Ref,
        issuer: &X509Ref,
        now: DateTime<Utc>,
        deadline: Option<DateTime<Utc>>,
    ) -> RevocationStatus;
}

/// Revocation answers from pre-fetched CRLs.
///
/// A CRL is used for a certificate only if its issuer name matches the
/// certificate's issuer, its signature verifies under the issuer's key, and
/// its `nextUpdate` (when present) has not passed.
pub struct CrlRevocationSource {
    crls: Vec<X509Crl>,
}

impl fmt::Debug for CrlRevocationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrlRevocationSource")
            .field("crls", &self.crls.len())
            .finish()
    }
}

impl CrlRevocationSource {
    pub fn new(crls: Vec<X509Crl>) -> Self {
        Self { crls }
    }

    /// Parse DER-encoded CRLs.
    ///
    /// # Errors
    ///
    /// Returns the OpenSSL error if any CRL fails to parse.
    pub fn from_der<B: AsRef<[u8]>>(crls: &[B]) -> Result<Self, openssl::error::ErrorStack> {
        let crls = crls
            .iter()
            .map(|der| X509Crl::from_der(der.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(crls))
    }

    fn usable(crl: &X509Crl, issuer: &X509Ref, now: DateTime<Utc>) -> bool {
        match crl.issuer_name().try_cmp(issuer.subject_name()) {
            Ok(Ordering::Equal) => {}
            _ => return false,
        }

        let signature_ok = issuer
            .public_key()
            .and_then(|key| crl.verify(&key))
            .unwrap_or(false);
        if !signature_ok {
            debug!(target: "exchange.trust", "Ignoring CRL with invalid signature");
            return false;
        }

        if let Some(next_update) = crl.next_update() {
            let stale = Asn1Time::from_unix(now.timestamp())
                .and_then(|now| next_update.compare(&now))
                .map(|ordering| ordering == Ordering::Less)
                .unwrap_or(true);
            if stale {
                debug!(target: "exchange.trust", "Ignoring stale CRL");
                return false;
            }
        }

        true
    }
}

impl RevocationSource for CrlRevocationSource {
    fn name(&self) -> &'static str {
        "crl"
    }

    fn status(
        &self,
        certificate: &X509Ref,
        issuer: &X509Ref,
        now: DateTime<Utc>,
        _deadline: Option<DateTime<Utc>>,
    ) -> RevocationStatus {
        let owned = certificate.to_owned();

        let Some(crl) = self.crls.iter().find(|crl| Self::usable(crl, issuer, now)) else {
            return RevocationStatus::Unavailable;
        };

        match crl.get_by_cert(&owned) {
            CrlStatus::Revoked(_) => RevocationStatus::Revoked,
            CrlStatus::NotRevoked | CrlStatus::RemoveFromCrl(_) => RevocationStatus::Good,
        }
    }
}
