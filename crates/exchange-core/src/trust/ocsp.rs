//! OCSP revocation source.
//!
//! Builds the request and validates the response with OpenSSL; moving the
//! bytes is delegated to an [`OcspTransport`] supplied by the host, which
//! owns HTTP and proxies. The caller's deadline reaches the transport as a
//! timeout so a hung responder cannot outlive the verification.

use super::revocation::{RevocationSource, RevocationStatus};
use chrono::{DateTime, NaiveDateTime, Utc};
use openssl::asn1::Asn1GeneralizedTimeRef;
use openssl::hash::MessageDigest;
use openssl::ocsp::{
    OcspCertId, OcspCertStatus, OcspFlag, OcspRequest, OcspResponse, OcspResponseStatus,
};
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::X509Ref;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Moves an encoded OCSP request to a responder and returns its answer.
pub trait OcspTransport: Send + Sync + fmt::Debug {
    /// `None` means the responder could not be reached in time.
    ///
    /// `timeout` is what is left of the caller's deadline (`None` when there
    /// is no deadline); the transport must give up once it has elapsed.
    fn fetch(
        &self,
        responder_url: &str,
        request_der: &[u8],
        timeout: Option<Duration>,
    ) -> Option<Vec<u8>>;
}

impl<T: OcspTransport + ?Sized> OcspTransport for Arc<T> {
    fn fetch(
        &self,
        responder_url: &str,
        request_der: &[u8],
        timeout: Option<Duration>,
    ) -> Option<Vec<u8>> {
        (**self).fetch(responder_url, request_der, timeout)
    }
}

/// Revocation answers from the responder named in the certificate's AIA.
#[derive(Debug)]
pub struct OcspRevocationSource<T> {
    transport: T,
}

impl<T: OcspTransport> OcspRevocationSource<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    fn query(
        &self,
        certificate: &X509Ref,
        issuer: &X509Ref,
        now: DateTime<Utc>,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<RevocationStatus, openssl::error::ErrorStack> {
        // OpenSSL reports a certificate without AIA as an error.
        let url = certificate
            .ocsp_responders()
            .ok()
            .and_then(|responders| responders.iter().next().map(|url| url.to_string()));
        let Some(url) = url else {
            debug!(target: "exchange.trust", "Certificate names no OCSP responder");
            return Ok(RevocationStatus::Unavailable);
        };

        let timeout = match deadline {
            Some(deadline) => match deadline.signed_duration_since(now).to_std() {
                Ok(remaining) if !remaining.is_zero() => Some(remaining),
                _ => {
                    debug!(target: "exchange.trust", "No time left for an OCSP query");
                    return Ok(RevocationStatus::Unavailable);
                }
            },
            None => None,
        };

        let mut request = OcspRequest::new()?;
        request.add_id(OcspCertId::from_cert(MessageDigest::sha1(), certificate, issuer)?)?;
        let request_der = request.to_der()?;

        let Some(response_der) = self.transport.fetch(&url, &request_der, timeout) else {
            debug!(target: "exchange.trust", "OCSP responder unreachable");
            return Ok(RevocationStatus::Unavailable);
        };

        let response = OcspResponse::from_der(&response_der)?;
        if response.status() != OcspResponseStatus::SUCCESSFUL {
            debug!(target: "exchange.trust", "OCSP responder returned an error status");
            return Ok(RevocationStatus::Unavailable);
        }
        let basic = response.basic()?;

        // Responses are signed by the issuer or by a responder it delegated
        // to; either way the issuer is the only anchor accepted here. Time
        // checks are done against the injected clock below.
        let mut store = X509StoreBuilder::new()?;
        store.add_cert(issuer.to_owned())?;
        store.set_flags(X509VerifyFlags::NO_CHECK_TIME)?;
        let store = store.build();
        let mut certs = Stack::new()?;
        certs.push(issuer.to_owned())?;
        basic.verify(&certs, &store, OcspFlag::empty())?;

        let id = OcspCertId::from_cert(MessageDigest::sha1(), certificate, issuer)?;
        let Some(status) = basic.find_status(&id) else {
            return Ok(RevocationStatus::Unavailable);
        };

        let fresh = match status.next_update() {
            Some(next_update) => generalized_time(next_update).is_some_and(|t| t >= now),
            None => generalized_time(status.this_update).is_some_and(|t| t <= now),
        };
        if !fresh {
            debug!(target: "exchange.trust", "Ignoring stale OCSP response");
            return Ok(RevocationStatus::Unavailable);
        }

        Ok(if status.status == OcspCertStatus::GOOD {
            RevocationStatus::Good
        } else if status.status == OcspCertStatus::REVOKED {
            RevocationStatus::Revoked
        } else {
            RevocationStatus::Unavailable
        })
    }
}

/// `Asn1GeneralizedTimeRef` only exposes its printed form, e.g.
/// `Mar  4 12:00:00 2031 GMT` (with optional fractional seconds).
fn generalized_time(time: &Asn1GeneralizedTimeRef) -> Option<DateTime<Utc>> {
    let rendered = time.to_string();
    let collapsed = rendered.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&collapsed, "%b %d %H:%M:%S%.f %Y GMT")
        .ok()
        .map(|t| t.and_utc())
}

impl<T: OcspTransport> RevocationSource for OcspRevocationSource<T> {
    fn name(&self) -> &'static str {
        "ocsp"
    }

    fn status(
        &self,
        certificate: &X509Ref,
        issuer: &X509Ref,
        now: DateTime<Utc>,
        deadline: Option<DateTime<Utc>>,
    ) -> RevocationStatus {
        self.query(certificate, issuer, now, deadline)
            .unwrap_or_else(|e| {
                debug!(target: "exchange.trust", error = %e, "OCSP response unusable");
                RevocationStatus::Unavailable
            })
    }
}
