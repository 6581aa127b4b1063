//! Key material for response tests
//!
//! Signing credentials usually come out of the test PKI in [`crate::pki`],
//! which issues ECDSA P-256 keys. Key transport needs RSA, so decryption
//! credentials (and RSA signing credentials for the PKCS#1 / PSS paths) are
//! generated here with OpenSSL and a self-signed certificate.

use exchange_core::response::DecryptionCredential;
use exchange_core::trust::{Credential, TrustAnchorSet};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use std::fmt;
use thiserror::Error;

/// RSA modulus size for generated keys.
pub const RSA_KEY_BITS: u32 = 2048;

/// Test fixture error type
#[derive(Error, Debug)]
pub enum FixtureError {
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    #[error("Certificate generation failed: {0}")]
    Pki(String),

    #[error("Response construction failed: {0}")]
    Xml(String),
}

impl From<openssl::error::ErrorStack> for FixtureError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        FixtureError::Crypto(err.to_string())
    }
}

impl From<rcgen::Error> for FixtureError {
    fn from(err: rcgen::Error) -> Self {
        FixtureError::Pki(err.to_string())
    }
}

/// Private key and certificates used to sign test responses.
///
/// `certificate` goes first in `KeyInfo`, followed by `chain`.
#[derive(Clone)]
pub struct SigningCredential {
    key: PKey<Private>,
    certificate: X509,
    chain: Vec<X509>,
}

impl SigningCredential {
    pub fn new(key: PKey<Private>, certificate: X509, chain: Vec<X509>) -> Self {
        Self {
            key,
            certificate,
            chain,
        }
    }

    pub fn key(&self) -> &PKey<Private> {
        &self.key
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    pub fn chain(&self) -> &[X509] {
        &self.chain
    }

    /// Same key, no chain certificates in `KeyInfo`.
    #[must_use]
    pub fn without_chain(mut self) -> Self {
        self.chain.clear();
        self
    }

    /// What the verifier will see for this signer.
    pub fn credential(&self) -> Credential {
        Credential::new(self.certificate.clone(), self.chain.clone())
    }

    /// A trust anchor set containing only this signer's own certificate.
    pub fn self_anchored(&self) -> TrustAnchorSet {
        TrustAnchorSet::new(vec![self.certificate.clone()])
            .expect("Failed to build anchor set from signer certificate")
    }
}

impl fmt::Debug for SigningCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredential")
            .field("key", &"[REDACTED]")
            .field("certificate", &self.certificate.subject_name())
            .field("chain", &self.chain.len())
            .finish()
    }
}

/// Fresh RSA key with a self-signed certificate.
///
/// # Errors
/// Returns [`FixtureError::Crypto`] if OpenSSL fails.
pub fn rsa_key_with_certificate(
    common_name: &str,
) -> Result<(PKey<Private>, X509), FixtureError> {
    let key = PKey::from_rsa(Rsa::generate(RSA_KEY_BITS)?)?;
    let certificate = self_signed(&key, common_name)?;
    Ok((key, certificate))
}

/// Credential the pipeline can use to unwrap content-encryption keys.
///
/// # Errors
/// Returns [`FixtureError::Crypto`] if OpenSSL fails.
pub fn test_decryption_credential(common_name: &str) -> Result<DecryptionCredential, FixtureError> {
    let (key, certificate) = rsa_key_with_certificate(common_name)?;
    Ok(DecryptionCredential::new(key, certificate))
}

/// Self-signed RSA signer, for exercising the PKCS#1 and PSS algorithms.
///
/// # Errors
/// Returns [`FixtureError::Crypto`] if OpenSSL fails.
pub fn rsa_signing_credential(common_name: &str) -> Result<SigningCredential, FixtureError> {
    let (key, certificate) = rsa_key_with_certificate(common_name)?;
    Ok(SigningCredential::new(key, certificate, Vec::new()))
}

fn self_signed(key: &PKey<Private>, common_name: &str) -> Result<X509, FixtureError> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", common_name)?;
    let name = name.build();

    let serial = BigNum::from_u32(1)?.to_asn1_integer()?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(365)?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(key)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.sign(key, MessageDigest::sha256())?;

    Ok(builder.build())
}
