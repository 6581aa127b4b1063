//! Enveloped XML-DSig verification.
//!
//! Only the profile SAML uses is accepted: one `Reference` pointing at the
//! signature's parent element, the enveloped-signature transform, exclusive
//! canonicalization and a key delivered as `X509Certificate` in `KeyInfo`.

use super::base64_content;
use crate::errors::ExchangeError;
use crate::trust::Credential;
use crate::xml::c14n::{self, EXC_C14N, EXC_C14N_WITH_COMMENTS};
use crate::xml::{ns, Document, Element};
use openssl::bn::BigNum;
use openssl::ecdsa::EcdsaSig;
use openssl::hash::{hash, MessageDigest};
use openssl::pkey::{PKeyRef, Public};
use openssl::rsa::Padding;
use openssl::sign::{RsaPssSaltlen, Verifier};
use openssl::x509::X509;
use std::fmt;
use tracing::debug;

pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

pub const DIGEST_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#sha1";
pub const DIGEST_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub const DIGEST_SHA384: &str = "http://www.w3.org/2001/04/xmldsig-more#sha384";
pub const DIGEST_SHA512: &str = "http://www.w3.org/2001/04/xmlenc#sha512";

/// Digest for a `DigestMethod/@Algorithm` URI.
pub fn digest_method(uri: &str) -> Option<MessageDigest> {
    match uri {
        DIGEST_SHA1 => Some(MessageDigest::sha1()),
        DIGEST_SHA256 => Some(MessageDigest::sha256()),
        DIGEST_SHA384 => Some(MessageDigest::sha384()),
        DIGEST_SHA512 => Some(MessageDigest::sha512()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Pkcs1,
    Pss,
    Ecdsa,
}

/// Signature algorithms recognised in `SignatureMethod/@Algorithm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    RsaSha1,
    RsaSha256,
    RsaSha384,
    RsaSha512,
    RsaPssSha256,
    RsaPssSha384,
    RsaPssSha512,
    EcdsaSha256,
    EcdsaSha384,
    EcdsaSha512,
}

impl SignatureAlgorithm {
    pub const ALL: [SignatureAlgorithm; 10] = [
        SignatureAlgorithm::RsaSha1,
        SignatureAlgorithm::RsaSha256,
        SignatureAlgorithm::RsaSha384,
        SignatureAlgorithm::RsaSha512,
        SignatureAlgorithm::RsaPssSha256,
        SignatureAlgorithm::RsaPssSha384,
        SignatureAlgorithm::RsaPssSha512,
        SignatureAlgorithm::EcdsaSha256,
        SignatureAlgorithm::EcdsaSha384,
        SignatureAlgorithm::EcdsaSha512,
    ];

    pub fn uri(self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaSha1 => "http://www.w3.org/2000/09/xmldsig#rsa-sha1",
            SignatureAlgorithm::RsaSha256 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
            SignatureAlgorithm::RsaSha384 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384",
            SignatureAlgorithm::RsaSha512 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512",
            SignatureAlgorithm::RsaPssSha256 => "http://www.w3.org/2007/05/xmldsig-more#sha256-rsa-MGF1",
            SignatureAlgorithm::RsaPssSha384 => "http://www.w3.org/2007/05/xmldsig-more#sha384-rsa-MGF1",
            SignatureAlgorithm::RsaPssSha512 => "http://www.w3.org/2007/05/xmldsig-more#sha512-rsa-MGF1",
            SignatureAlgorithm::EcdsaSha256 => "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256",
            SignatureAlgorithm::EcdsaSha384 => "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha384",
            SignatureAlgorithm::EcdsaSha512 => "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha512",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.uri() == uri.trim())
    }

    /// Everything except RSA with SHA-1.
    pub fn default_allow_list() -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|alg| *alg != SignatureAlgorithm::RsaSha1)
            .collect()
    }

    pub fn message_digest(self) -> MessageDigest {
        match self {
            SignatureAlgorithm::RsaSha1 => MessageDigest::sha1(),
            SignatureAlgorithm::RsaSha256
            | SignatureAlgorithm::RsaPssSha256
            | SignatureAlgorithm::EcdsaSha256 => MessageDigest::sha256(),
            SignatureAlgorithm::RsaSha384
            | SignatureAlgorithm::RsaPssSha384
            | SignatureAlgorithm::EcdsaSha384 => MessageDigest::sha384(),
            SignatureAlgorithm::RsaSha512
            | SignatureAlgorithm::RsaPssSha512
            | SignatureAlgorithm::EcdsaSha512 => MessageDigest::sha512(),
        }
    }

    fn scheme(self) -> Scheme {
        match self {
            SignatureAlgorithm::RsaSha1
            | SignatureAlgorithm::RsaSha256
            | SignatureAlgorithm::RsaSha384
            | SignatureAlgorithm::RsaSha512 => Scheme::Pkcs1,
            SignatureAlgorithm::RsaPssSha256
            | SignatureAlgorithm::RsaPssSha384
            | SignatureAlgorithm::RsaPssSha512 => Scheme::Pss,
            SignatureAlgorithm::EcdsaSha256
            | SignatureAlgorithm::EcdsaSha384
            | SignatureAlgorithm::EcdsaSha512 => Scheme::Ecdsa,
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri())
    }
}

/// The `ds:Signature` directly under `element`, if any.
pub(crate) fn signature_of(element: &Element) -> Option<&Element> {
    element.first_child(ns::DSIG, "Signature")
}

/// Fail unless the signature's method is on `allow_list`. Unknown methods
/// are treated as not allowed.
pub(crate) fn check_allowed(
    signature: &Element,
    allow_list: &[SignatureAlgorithm],
) -> Result<SignatureAlgorithm, ExchangeError> {
    let uri = signature
        .first_child(ns::DSIG, "SignedInfo")
        .and_then(|info| info.first_child(ns::DSIG, "SignatureMethod"))
        .and_then(|method| method.attribute("Algorithm"))
        .ok_or(ExchangeError::InvalidSignature)?;

    match SignatureAlgorithm::from_uri(uri) {
        Some(algorithm) if allow_list.contains(&algorithm) => Ok(algorithm),
        _ => {
            debug!(target: "exchange.response", algorithm = %uri, "Signature algorithm not allowed");
            Err(ExchangeError::DisallowedSignatureAlgorithm)
        }
    }
}

/// Verify `signature`, an enveloped signature over `signed`, and return the
/// signer's certificate material for trust verification.
///
/// Both elements must come from `document`; the referenced id has to be
/// unique in it.
pub(crate) fn verify_enveloped(
    document: &Document,
    signed: &Element,
    signature: &Element,
    algorithm: SignatureAlgorithm,
) -> Result<Credential, ExchangeError> {
    let invalid = |reason: &'static str| {
        debug!(target: "exchange.response", reason, "Signature rejected");
        ExchangeError::InvalidSignature
    };

    let signed_info = signature
        .first_child(ns::DSIG, "SignedInfo")
        .ok_or_else(|| invalid("missing SignedInfo"))?;
    let signed_info_prefixes = signed_info
        .first_child(ns::DSIG, "CanonicalizationMethod")
        .and_then(exclusive_c14n_prefixes)
        .ok_or_else(|| invalid("unsupported canonicalization"))?;

    let mut references = signed_info.children_named(ns::DSIG, "Reference");
    let reference = references.next().ok_or_else(|| invalid("missing Reference"))?;
    if references.next().is_some() {
        return Err(invalid("multiple references"));
    }

    let target_id = reference
        .attribute("URI")
        .and_then(|uri| uri.strip_prefix('#'))
        .ok_or_else(|| invalid("reference is not a same-document id"))?;
    if signed.id() != Some(target_id) || document.count_id(target_id) != 1 {
        return Err(invalid("reference does not resolve to the signed element"));
    }

    let mut enveloped = false;
    let mut prefixes = Vec::new();
    if let Some(transforms) = reference.first_child(ns::DSIG, "Transforms") {
        for transform in transforms.children_named(ns::DSIG, "Transform") {
            match transform.attribute("Algorithm") {
                Some(ENVELOPED_SIGNATURE) => enveloped = true,
                Some(_) => {
                    prefixes = exclusive_c14n_prefixes(transform)
                        .ok_or_else(|| invalid("unsupported transform"))?;
                }
                None => return Err(invalid("transform without algorithm")),
            }
        }
    }
    if !enveloped {
        return Err(invalid("missing enveloped-signature transform"));
    }

    let digest = reference
        .first_child(ns::DSIG, "DigestMethod")
        .and_then(|method| method.attribute("Algorithm"))
        .and_then(digest_method)
        .ok_or_else(|| invalid("unsupported digest method"))?;
    let expected_digest = reference
        .first_child(ns::DSIG, "DigestValue")
        .and_then(base64_content)
        .ok_or_else(|| invalid("missing digest value"))?;

    let canonical = c14n::canonicalize(signed, &prefixes, Some(signature));
    let actual_digest = hash(digest, canonical.as_bytes())?;
    if actual_digest.len() != expected_digest.len()
        || !openssl::memcmp::eq(&actual_digest, &expected_digest)
    {
        return Err(invalid("digest mismatch"));
    }

    let signature_value = signature
        .first_child(ns::DSIG, "SignatureValue")
        .and_then(base64_content)
        .ok_or_else(|| invalid("missing signature value"))?;
    let credential = key_info_credential(signature).ok_or_else(|| invalid("missing signer certificate"))?;
    let public_key = credential.certificate().public_key()?;

    let canonical_signed_info = c14n::canonicalize(signed_info, &signed_info_prefixes, None);
    let verified = verify_signature_value(
        algorithm,
        &public_key,
        canonical_signed_info.as_bytes(),
        &signature_value,
    )
    .unwrap_or(false);
    if !verified {
        return Err(invalid("signature value mismatch"));
    }

    Ok(credential)
}

/// Inclusive prefixes of an exclusive-c14n method or transform; `None` for
/// any other algorithm.
fn exclusive_c14n_prefixes(method: &Element) -> Option<Vec<String>> {
    match method.attribute("Algorithm") {
        Some(EXC_C14N | EXC_C14N_WITH_COMMENTS) => Some(
            method
                .first_child(ns::EXC_C14N, "InclusiveNamespaces")
                .and_then(|inclusive| inclusive.attribute("PrefixList"))
                .map(c14n::parse_prefix_list)
                .unwrap_or_default(),
        ),
        _ => None,
    }
}

/// Leaf first, then any further certificates as chain.
fn key_info_credential(signature: &Element) -> Option<Credential> {
    let key_info = signature.first_child(ns::DSIG, "KeyInfo")?;
    let mut certificates = key_info
        .descendants_named(ns::DSIG, "X509Certificate")
        .into_iter()
        .map(|element| base64_content(element).and_then(|der| X509::from_der(&der).ok()))
        .collect::<Option<Vec<X509>>>()?
        .into_iter();

    let leaf = certificates.next()?;
    Some(Credential::new(leaf, certificates.collect()))
}

fn verify_signature_value(
    algorithm: SignatureAlgorithm,
    key: &PKeyRef<Public>,
    data: &[u8],
    signature: &[u8],
) -> Result<bool, ExchangeError> {
    let digest = algorithm.message_digest();
    let mut verifier = Verifier::new(digest, key)?;

    let der;
    let signature = match algorithm.scheme() {
        Scheme::Pkcs1 => {
            verifier.set_rsa_padding(Padding::PKCS1)?;
            signature
        }
        Scheme::Pss => {
            verifier.set_rsa_padding(Padding::PKCS1_PSS)?;
            verifier.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
            verifier.set_rsa_mgf1_md(digest)?;
            signature
        }
        Scheme::Ecdsa => {
            der = ecdsa_raw_to_der(signature)?;
            der.as_slice()
        }
    };

    verifier.update(data)?;
    Ok(verifier.verify(signature)?)
}

/// XML-DSig carries ECDSA signatures as `r || s`; OpenSSL wants DER.
fn ecdsa_raw_to_der(raw: &[u8]) -> Result<Vec<u8>, ExchangeError> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return Err(ExchangeError::InvalidSignature);
    }
    let (r, s) = raw.split_at(raw.len() / 2);
    let signature = EcdsaSig::from_private_components(BigNum::from_slice(r)?, BigNum::from_slice(s)?)?;
    Ok(signature.to_der()?)
}
