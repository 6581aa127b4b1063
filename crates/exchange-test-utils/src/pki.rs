//! Throwaway certificate hierarchy for trust tests
//!
//! Generates `root -> intermediate -> leaf` with ECDSA P-256 keys and signs
//! CRLs from either CA. Everything is created fresh per [`TestPki::generate`]
//! so tests never share key material.

use crate::crypto_fixtures::{FixtureError, SigningCredential};
use exchange_core::trust::{Credential, TrustAnchorSet};
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Crl, X509};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateRevocationListParams,
    CustomExtension, DnType, IsCa, KeyIdMethod, KeyPair, KeyUsagePurpose, RevocationReason,
    RevokedCertParams, SerialNumber,
};

// Serial numbers (small, so DER encoding is unambiguous)
pub const ROOT_SERIAL: u8 = 1;
pub const INTERMEDIATE_SERIAL: u8 = 2;
pub const LEAF_SERIAL: u8 = 3;

/// Whether a generated CRL is still inside its `nextUpdate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrlFreshness {
    /// Valid from 2020 until 2099.
    Current,
    /// `nextUpdate` passed in 2021.
    Expired,
}

struct Issued {
    certificate: Certificate,
    key: KeyPair,
}

impl Issued {
    fn x509(&self) -> X509 {
        X509::from_der(self.certificate.der()).expect("rcgen produced an unparseable certificate")
    }

    fn private_key(&self) -> PKey<Private> {
        PKey::private_key_from_pem(self.key.serialize_pem().as_bytes())
            .expect("rcgen produced an unparseable private key")
    }
}

/// Root CA, intermediate CA and one end-entity signing certificate.
pub struct TestPki {
    root: Issued,
    intermediate: Issued,
    leaf: Issued,
}

impl std::fmt::Debug for TestPki {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestPki").finish_non_exhaustive()
    }
}

impl TestPki {
    /// Generate a fresh hierarchy.
    ///
    /// # Errors
    /// Returns [`FixtureError::Pki`] if rcgen fails.
    pub fn generate() -> Result<Self, FixtureError> {
        Self::build(None)
    }

    /// Generate a hierarchy whose leaf names `responder_url` as its OCSP
    /// responder (Authority Information Access).
    ///
    /// # Errors
    /// Returns [`FixtureError::Pki`] if rcgen fails.
    pub fn generate_with_ocsp_responder(responder_url: &str) -> Result<Self, FixtureError> {
        Self::build(Some(responder_url))
    }

    fn build(ocsp_responder: Option<&str>) -> Result<Self, FixtureError> {
        let root_key = KeyPair::generate()?;
        let root_certificate = ca_params("Test Root CA", ROOT_SERIAL).self_signed(&root_key)?;
        let root = Issued {
            certificate: root_certificate,
            key: root_key,
        };

        let intermediate_key = KeyPair::generate()?;
        let intermediate_certificate = ca_params("Test Intermediate CA", INTERMEDIATE_SERIAL)
            .signed_by(&intermediate_key, &root.certificate, &root.key)?;
        let intermediate = Issued {
            certificate: intermediate_certificate,
            key: intermediate_key,
        };

        let leaf_key = KeyPair::generate()?;
        let mut signer_params = leaf_params("Test Response Signer", LEAF_SERIAL);
        if let Some(url) = ocsp_responder {
            signer_params
                .custom_extensions
                .push(authority_info_access(url));
        }
        let leaf_certificate = signer_params.signed_by(
            &leaf_key,
            &intermediate.certificate,
            &intermediate.key,
        )?;
        let leaf = Issued {
            certificate: leaf_certificate,
            key: leaf_key,
        };

        Ok(Self {
            root,
            intermediate,
            leaf,
        })
    }

    pub fn root_certificate(&self) -> X509 {
        self.root.x509()
    }

    pub fn intermediate_certificate(&self) -> X509 {
        self.intermediate.x509()
    }

    pub fn leaf_certificate(&self) -> X509 {
        self.leaf.x509()
    }

    /// Anchors containing only the root.
    pub fn root_anchors(&self) -> TrustAnchorSet {
        TrustAnchorSet::new(vec![self.root_certificate()]).expect("Failed to build root anchors")
    }

    /// Anchors containing only the intermediate.
    pub fn intermediate_anchors(&self) -> TrustAnchorSet {
        TrustAnchorSet::new(vec![self.intermediate_certificate()])
            .expect("Failed to build intermediate anchors")
    }

    /// Leaf plus the intermediate as supplied chain.
    pub fn leaf_credential(&self) -> Credential {
        Credential::new(self.leaf_certificate(), vec![self.intermediate_certificate()])
    }

    /// Leaf key, with the intermediate carried in `KeyInfo`.
    pub fn leaf_signer(&self) -> SigningCredential {
        SigningCredential::new(
            self.leaf.private_key(),
            self.leaf_certificate(),
            vec![self.intermediate_certificate()],
        )
    }

    /// CRL issued by the root, listing `revoked` serials.
    ///
    /// # Errors
    /// Returns [`FixtureError::Pki`] if signing fails.
    pub fn root_crl(&self, revoked: &[u8], freshness: CrlFreshness) -> Result<X509Crl, FixtureError> {
        signed_crl(&self.root, revoked, freshness)
    }

    /// CRL issued by the intermediate, listing `revoked` serials.
    ///
    /// # Errors
    /// Returns [`FixtureError::Pki`] if signing fails.
    pub fn intermediate_crl(
        &self,
        revoked: &[u8],
        freshness: CrlFreshness,
    ) -> Result<X509Crl, FixtureError> {
        signed_crl(&self.intermediate, revoked, freshness)
    }

    /// A CRL naming the intermediate as issuer but signed by the root's key.
    ///
    /// # Errors
    /// Returns [`FixtureError::Pki`] if signing fails.
    pub fn forged_intermediate_crl(&self, revoked: &[u8]) -> Result<X509Crl, FixtureError> {
        let impostor = ca_params("Test Intermediate CA", INTERMEDIATE_SERIAL)
            .self_signed(&self.root.key)?;
        let crl = crl_params(revoked, CrlFreshness::Current).signed_by(&impostor, &self.root.key)?;
        Ok(X509Crl::from_der(crl.der())?)
    }
}

fn ca_params(common_name: &str, serial: u8) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, common_name);
    params
        .distinguished_name
        .push(DnType::OrganizationName, "Exchange Test");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.serial_number = Some(SerialNumber::from_slice(&[serial]));
    params
}

fn leaf_params(common_name: &str, serial: u8) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, common_name);
    params
        .distinguished_name
        .push(DnType::OrganizationName, "Exchange Test");
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.serial_number = Some(SerialNumber::from_slice(&[serial]));
    params
}

/// AIA extension with a single `id-ad-ocsp` access description.
fn authority_info_access(url: &str) -> CustomExtension {
    const ID_AD_OCSP: [u8; 10] = [0x06, 0x08, 0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01];
    const ID_PE_AUTHORITY_INFO_ACCESS: [u64; 9] = [1, 3, 6, 1, 5, 5, 7, 1, 1];

    let location = der(0x86, url.as_bytes());
    let description = der(0x30, &[&ID_AD_OCSP[..], &location].concat());
    CustomExtension::from_oid_content(&ID_PE_AUTHORITY_INFO_ACCESS, der(0x30, &description))
}

fn der(tag: u8, content: &[u8]) -> Vec<u8> {
    let len = content.len();
    let mut out = vec![tag];
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xff {
        out.extend([0x81, len as u8]);
    } else {
        out.extend([0x82, (len >> 8) as u8, len as u8]);
    }
    out.extend_from_slice(content);
    out
}

fn crl_params(revoked: &[u8], freshness: CrlFreshness) -> CertificateRevocationListParams {
    let next_update = match freshness {
        CrlFreshness::Current => rcgen::date_time_ymd(2099, 12, 31),
        CrlFreshness::Expired => rcgen::date_time_ymd(2021, 1, 1),
    };

    CertificateRevocationListParams {
        this_update: rcgen::date_time_ymd(2020, 1, 1),
        next_update,
        crl_number: SerialNumber::from_slice(&[1]),
        issuing_distribution_point: None,
        revoked_certs: revoked
            .iter()
            .map(|serial| RevokedCertParams {
                serial_number: SerialNumber::from_slice(&[*serial]),
                revocation_time: rcgen::date_time_ymd(2020, 6, 1),
                reason_code: Some(RevocationReason::KeyCompromise),
                invalidity_date: None,
            })
            .collect(),
        key_identifier_method: KeyIdMethod::Sha256,
    }
}

fn signed_crl(
    issuer: &Issued,
    revoked: &[u8],
    freshness: CrlFreshness,
) -> Result<X509Crl, FixtureError> {
    let crl = crl_params(revoked, freshness).signed_by(&issuer.certificate, &issuer.key)?;
    Ok(X509Crl::from_der(crl.der())?)
}
