//! Builders for SAML responses as an identity provider would send them
//!
//! Responses and assertions are rendered as compact XML, signed with an
//! enveloped exclusive-c14n XML-DSig signature, and assertions can be
//! encrypted (AES content key wrapped with RSA-OAEP) for a recipient
//! certificate. Defaults produce a response the pipeline accepts once the
//! signer is trusted and the caller's address is [`TEST_USER_IP`].
//!
//! # Example
//! ```rust,ignore
//! let pki = TestPki::generate()?;
//! let recipient = test_decryption_credential("Connector")?;
//! let xml = TestResponseBuilder::new(now)
//!     .signed_by(pki.leaf_signer(), SignatureAlgorithm::EcdsaSha256)
//!     .encrypted_for(recipient.certificate())
//!     .build()?;
//! ```

use crate::crypto_fixtures::{FixtureError, SigningCredential};
use crate::test_ids::{
    TEST_ASSERTION_ID, TEST_AUDIENCE, TEST_DESTINATION, TEST_IDP_ISSUER,
    TEST_LEVEL_OF_ASSURANCE, TEST_REQUEST_ID_1, TEST_RESPONSE_ID, TEST_SUBJECT_NAME_ID,
    TEST_USER_IP,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use exchange_core::response::conditions::BEARER_METHOD;
use exchange_core::response::signature::{DIGEST_SHA1, DIGEST_SHA256, ENVELOPED_SIGNATURE};
use exchange_core::response::{
    DataEncryptionAlgorithm, KeyTransportAlgorithm, SignatureAlgorithm, STATUS_SUCCESS,
};
use exchange_core::xml::c14n::{self, EXC_C14N};
use exchange_core::xml::{ns, Document};
use openssl::ecdsa::EcdsaSig;
use openssl::encrypt::Encrypter;
use openssl::hash::{hash, MessageDigest};
use openssl::rand::rand_bytes;
use openssl::rsa::Padding;
use openssl::sign::{RsaPssSaltlen, Signer};
use openssl::symm;
use openssl::x509::X509;

pub const STATUS_REQUESTER: &str = "urn:oasis:names:tc:SAML:2.0:status:Requester";
pub const STATUS_AUTHN_FAILED: &str = "urn:oasis:names:tc:SAML:2.0:status:AuthnFailed";

pub const NAME_ID_FORMAT_UNSPECIFIED: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified";
pub const ATTRIBUTE_NAME_FORMAT_URI: &str = "urn:oasis:names:tc:SAML:2.0:attrname-format:uri";

pub const PERSON_IDENTIFIER: &str = "http://eidas.europa.eu/attributes/naturalperson/PersonIdentifier";
pub const FAMILY_NAME: &str = "http://eidas.europa.eu/attributes/naturalperson/CurrentFamilyName";

const GCM_IV_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;
const CBC_IV_LEN: usize = 16;

// =============================================================================
// Assertion
// =============================================================================

/// One `saml:Assertion` inside a test response.
#[derive(Debug, Clone)]
pub struct TestAssertion {
    id: String,
    issuer: String,
    subject_name_id: String,
    not_before: DateTime<Utc>,
    not_on_or_after: DateTime<Utc>,
    audience: Option<String>,
    confirmation_method: String,
    bearer_address: Option<String>,
    in_response_to: String,
    level_of_assurance: String,
    attributes: Vec<(String, Vec<String>)>,
    attribute_statements: usize,
    signer: Option<(SigningCredential, SignatureAlgorithm)>,
}

impl TestAssertion {
    /// Valid from one minute before `now` until five minutes after.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            id: TEST_ASSERTION_ID.to_string(),
            issuer: TEST_IDP_ISSUER.to_string(),
            subject_name_id: TEST_SUBJECT_NAME_ID.to_string(),
            not_before: now - Duration::minutes(1),
            not_on_or_after: now + Duration::minutes(5),
            audience: Some(TEST_AUDIENCE.to_string()),
            confirmation_method: BEARER_METHOD.to_string(),
            bearer_address: Some(TEST_USER_IP.to_string()),
            in_response_to: TEST_REQUEST_ID_1.to_string(),
            level_of_assurance: TEST_LEVEL_OF_ASSURANCE.to_string(),
            attributes: vec![
                (PERSON_IDENTIFIER.to_string(), vec![TEST_SUBJECT_NAME_ID.to_string()]),
                (FAMILY_NAME.to_string(), vec!["Garcia".to_string()]),
            ],
            attribute_statements: 1,
            signer: None,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn with_window(mut self, not_before: DateTime<Utc>, not_on_or_after: DateTime<Utc>) -> Self {
        self.not_before = not_before;
        self.not_on_or_after = not_on_or_after;
        self
    }

    pub fn with_audience(mut self, audience: &str) -> Self {
        self.audience = Some(audience.to_string());
        self
    }

    pub fn without_audience(mut self) -> Self {
        self.audience = None;
        self
    }

    pub fn with_bearer_address(mut self, address: &str) -> Self {
        self.bearer_address = Some(address.to_string());
        self
    }

    pub fn without_bearer_address(mut self) -> Self {
        self.bearer_address = None;
        self
    }

    pub fn with_in_response_to(mut self, request_id: &str) -> Self {
        self.in_response_to = request_id.to_string();
        self
    }

    pub fn with_attribute(mut self, name: &str, values: &[&str]) -> Self {
        self.attributes.push((
            name.to_string(),
            values.iter().map(|value| (*value).to_string()).collect(),
        ));
        self
    }

    /// Repeat the attribute statement `count` times (0 omits it).
    pub fn with_attribute_statements(mut self, count: usize) -> Self {
        self.attribute_statements = count;
        self
    }

    pub fn signed_by(mut self, signer: SigningCredential, algorithm: SignatureAlgorithm) -> Self {
        self.signer = Some((signer, algorithm));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The assertion as standalone XML, signed if a signer is set.
    ///
    /// # Errors
    /// Returns a [`FixtureError`] if signing fails.
    pub fn to_xml(&self) -> Result<String, FixtureError> {
        let head = format!(
            r#"<saml:Assertion xmlns:saml="{saml}" ID="{id}" Version="2.0" IssueInstant="{issued}"><saml:Issuer>{issuer}</saml:Issuer>"#,
            saml = ns::SAML,
            id = escape(&self.id),
            issued = instant(self.not_before),
            issuer = escape(&self.issuer),
        );
        let tail = format!(
            "{subject}{conditions}{authn}{statements}</saml:Assertion>",
            subject = self.subject_xml(),
            conditions = self.conditions_xml(),
            authn = self.authn_statement_xml(),
            statements = self.attribute_statement_xml().repeat(self.attribute_statements),
        );

        match &self.signer {
            Some((signer, algorithm)) => sign_enveloped(&head, &tail, signer, *algorithm),
            None => Ok(format!("{head}{tail}")),
        }
    }

    fn subject_xml(&self) -> String {
        let address = self
            .bearer_address
            .as_deref()
            .map(|address| format!(r#" Address="{}""#, escape(address)))
            .unwrap_or_default();

        format!(
            r#"<saml:Subject><saml:NameID Format="{format}">{name_id}</saml:NameID><saml:SubjectConfirmation Method="{method}"><saml:SubjectConfirmationData{address} InResponseTo="{in_response_to}" NotOnOrAfter="{not_on_or_after}"/></saml:SubjectConfirmation></saml:Subject>"#,
            format = NAME_ID_FORMAT_UNSPECIFIED,
            name_id = escape(&self.subject_name_id),
            method = escape(&self.confirmation_method),
            in_response_to = escape(&self.in_response_to),
            not_on_or_after = instant(self.not_on_or_after),
        )
    }

    fn conditions_xml(&self) -> String {
        let restriction = self
            .audience
            .as_deref()
            .map(|audience| {
                format!(
                    "<saml:AudienceRestriction><saml:Audience>{}</saml:Audience></saml:AudienceRestriction>",
                    escape(audience)
                )
            })
            .unwrap_or_default();

        format!(
            r#"<saml:Conditions NotBefore="{}" NotOnOrAfter="{}">{restriction}</saml:Conditions>"#,
            instant(self.not_before),
            instant(self.not_on_or_after),
        )
    }

    fn authn_statement_xml(&self) -> String {
        format!(
            r#"<saml:AuthnStatement AuthnInstant="{}"><saml:AuthnContext><saml:AuthnContextClassRef>{}</saml:AuthnContextClassRef></saml:AuthnContext></saml:AuthnStatement>"#,
            instant(self.not_before),
            escape(&self.level_of_assurance),
        )
    }

    fn attribute_statement_xml(&self) -> String {
        let attributes: String = self
            .attributes
            .iter()
            .map(|(name, values)| {
                let values: String = values
                    .iter()
                    .map(|value| format!("<saml:AttributeValue>{}</saml:AttributeValue>", escape(value)))
                    .collect();
                format!(
                    r#"<saml:Attribute Name="{}" NameFormat="{}">{values}</saml:Attribute>"#,
                    escape(name),
                    ATTRIBUTE_NAME_FORMAT_URI,
                )
            })
            .collect();

        format!("<saml:AttributeStatement>{attributes}</saml:AttributeStatement>")
    }
}

// =============================================================================
// Response
// =============================================================================

/// Builder for a complete `samlp:Response`.
#[derive(Debug, Clone)]
pub struct TestResponseBuilder {
    id: String,
    issue_instant: DateTime<Utc>,
    in_response_to: Option<String>,
    issuer: String,
    destination: Option<String>,
    status_code: String,
    status_sub_code: Option<String>,
    status_message: Option<String>,
    assertions: Vec<TestAssertion>,
    signer: Option<(SigningCredential, SignatureAlgorithm)>,
    recipient: Option<(X509, DataEncryptionAlgorithm)>,
}

impl TestResponseBuilder {
    /// A successful, unsigned, unencrypted response answering
    /// [`TEST_REQUEST_ID_1`] with one default assertion.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            id: TEST_RESPONSE_ID.to_string(),
            issue_instant: now,
            in_response_to: Some(TEST_REQUEST_ID_1.to_string()),
            issuer: TEST_IDP_ISSUER.to_string(),
            destination: Some(TEST_DESTINATION.to_string()),
            status_code: STATUS_SUCCESS.to_string(),
            status_sub_code: None,
            status_message: None,
            assertions: vec![TestAssertion::new(now)],
            signer: None,
            recipient: None,
        }
    }

    /// Answer `request_id`, in the response and in the default assertion's
    /// subject confirmation.
    pub fn answering(mut self, request_id: &str) -> Self {
        self.in_response_to = Some(request_id.to_string());
        self.assertions = self
            .assertions
            .into_iter()
            .map(|assertion| assertion.with_in_response_to(request_id))
            .collect();
        self
    }

    pub fn without_in_response_to(mut self) -> Self {
        self.in_response_to = None;
        self
    }

    /// `Requester` / `AuthnFailed` with no assertion.
    pub fn failed(mut self, message: &str) -> Self {
        self.status_code = STATUS_REQUESTER.to_string();
        self.status_sub_code = Some(STATUS_AUTHN_FAILED.to_string());
        self.status_message = Some(message.to_string());
        self.assertions.clear();
        self
    }

    pub fn with_status(mut self, code: &str) -> Self {
        self.status_code = code.to_string();
        self
    }

    pub fn with_assertion(mut self, assertion: TestAssertion) -> Self {
        self.assertions = vec![assertion];
        self
    }

    pub fn with_assertions(mut self, assertions: Vec<TestAssertion>) -> Self {
        self.assertions = assertions;
        self
    }

    pub fn without_assertions(mut self) -> Self {
        self.assertions.clear();
        self
    }

    /// Apply `f` to every assertion.
    pub fn map_assertions(mut self, f: impl Fn(TestAssertion) -> TestAssertion) -> Self {
        self.assertions = self.assertions.into_iter().map(f).collect();
        self
    }

    /// Sign the response itself.
    pub fn signed_by(mut self, signer: SigningCredential, algorithm: SignatureAlgorithm) -> Self {
        self.signer = Some((signer, algorithm));
        self
    }

    /// Encrypt every assertion for `recipient` with AES-128-GCM.
    pub fn encrypted_for(self, recipient: &X509) -> Self {
        self.encrypted_with(recipient, DataEncryptionAlgorithm::Aes128Gcm)
    }

    pub fn encrypted_with(mut self, recipient: &X509, algorithm: DataEncryptionAlgorithm) -> Self {
        self.recipient = Some((recipient.clone(), algorithm));
        self
    }

    /// Render, sign and encrypt.
    ///
    /// Assertions are signed first, then encrypted, then the response
    /// (carrying the encrypted form) is signed.
    ///
    /// # Errors
    /// Returns a [`FixtureError`] if any cryptographic step fails.
    pub fn build(&self) -> Result<String, FixtureError> {
        let assertions = self
            .assertions
            .iter()
            .map(|assertion| {
                let xml = assertion.to_xml()?;
                match &self.recipient {
                    Some((recipient, algorithm)) => encrypt_assertion(&xml, recipient, *algorithm),
                    None => Ok(xml),
                }
            })
            .collect::<Result<String, FixtureError>>()?;

        let in_response_to = self
            .in_response_to
            .as_deref()
            .map(|id| format!(r#" InResponseTo="{}""#, escape(id)))
            .unwrap_or_default();
        let destination = self
            .destination
            .as_deref()
            .map(|destination| format!(r#" Destination="{}""#, escape(destination)))
            .unwrap_or_default();

        let head = format!(
            r#"<samlp:Response xmlns:samlp="{samlp}" xmlns:saml="{saml}" ID="{id}" Version="2.0" IssueInstant="{issued}"{destination}{in_response_to}><saml:Issuer>{issuer}</saml:Issuer>"#,
            samlp = ns::SAMLP,
            saml = ns::SAML,
            id = escape(&self.id),
            issued = instant(self.issue_instant),
            issuer = escape(&self.issuer),
        );
        let tail = format!("{}{assertions}</samlp:Response>", self.status_xml());

        match &self.signer {
            Some((signer, algorithm)) => sign_enveloped(&head, &tail, signer, *algorithm),
            None => Ok(format!("{head}{tail}")),
        }
    }

    fn status_xml(&self) -> String {
        let sub_code = self
            .status_sub_code
            .as_deref()
            .map(|code| format!(r#"<samlp:StatusCode Value="{}"/>"#, escape(code)))
            .unwrap_or_default();
        let message = self
            .status_message
            .as_deref()
            .map(|message| format!("<samlp:StatusMessage>{}</samlp:StatusMessage>", escape(message)))
            .unwrap_or_default();

        format!(
            r#"<samlp:Status><samlp:StatusCode Value="{}">{sub_code}</samlp:StatusCode>{message}</samlp:Status>"#,
            escape(&self.status_code),
        )
    }
}

// =============================================================================
// XML-DSig
// =============================================================================

/// Insert an enveloped signature between `head` and `tail`.
///
/// The digest covers `head + tail`, which is exactly what the verifier
/// canonicalizes once it skips the inserted `ds:Signature`.
fn sign_enveloped(
    head: &str,
    tail: &str,
    signer: &SigningCredential,
    algorithm: SignatureAlgorithm,
) -> Result<String, FixtureError> {
    let unsigned = parse(&format!("{head}{tail}"))?;
    let id = unsigned
        .root()
        .id()
        .ok_or_else(|| FixtureError::Xml("signed element has no ID".to_string()))?
        .to_string();

    let canonical = c14n::canonicalize(unsigned.root(), &[], None);
    let digest = STANDARD.encode(hash(MessageDigest::sha256(), canonical.as_bytes())?);

    let signed_info = format!(
        r##"<ds:SignedInfo xmlns:ds="{dsig}"><ds:CanonicalizationMethod Algorithm="{c14n}"/><ds:SignatureMethod Algorithm="{method}"/><ds:Reference URI="#{id}"><ds:Transforms><ds:Transform Algorithm="{enveloped}"/><ds:Transform Algorithm="{c14n}"/></ds:Transforms><ds:DigestMethod Algorithm="{digest_method}"/><ds:DigestValue>{digest}</ds:DigestValue></ds:Reference></ds:SignedInfo>"##,
        dsig = ns::DSIG,
        c14n = EXC_C14N,
        method = algorithm.uri(),
        id = escape(&id),
        enveloped = ENVELOPED_SIGNATURE,
        digest_method = DIGEST_SHA256,
    );
    let canonical_signed_info = c14n::canonicalize(parse(&signed_info)?.root(), &[], None);
    let signature_value = STANDARD.encode(sign(signer, algorithm, canonical_signed_info.as_bytes())?);

    let certificates = std::iter::once(signer.certificate())
        .chain(signer.chain())
        .map(|certificate| {
            certificate
                .to_der()
                .map(|der| format!("<ds:X509Certificate>{}</ds:X509Certificate>", STANDARD.encode(der)))
        })
        .collect::<Result<String, _>>()?;

    Ok(format!(
        r#"{head}<ds:Signature xmlns:ds="{dsig}">{signed_info}<ds:SignatureValue>{signature_value}</ds:SignatureValue><ds:KeyInfo><ds:X509Data>{certificates}</ds:X509Data></ds:KeyInfo></ds:Signature>{tail}"#,
        dsig = ns::DSIG,
    ))
}

/// Raw signature bytes as XML-DSig expects them (`r || s` for ECDSA).
fn sign(
    signer: &SigningCredential,
    algorithm: SignatureAlgorithm,
    data: &[u8],
) -> Result<Vec<u8>, FixtureError> {
    let digest = algorithm.message_digest();
    let mut openssl_signer = Signer::new(digest, signer.key())?;

    let ecdsa = match algorithm {
        SignatureAlgorithm::RsaSha1
        | SignatureAlgorithm::RsaSha256
        | SignatureAlgorithm::RsaSha384
        | SignatureAlgorithm::RsaSha512 => {
            openssl_signer.set_rsa_padding(Padding::PKCS1)?;
            false
        }
        SignatureAlgorithm::RsaPssSha256
        | SignatureAlgorithm::RsaPssSha384
        | SignatureAlgorithm::RsaPssSha512 => {
            openssl_signer.set_rsa_padding(Padding::PKCS1_PSS)?;
            openssl_signer.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
            openssl_signer.set_rsa_mgf1_md(digest)?;
            false
        }
        SignatureAlgorithm::EcdsaSha256
        | SignatureAlgorithm::EcdsaSha384
        | SignatureAlgorithm::EcdsaSha512 => true,
    };

    openssl_signer.update(data)?;
    let signature = openssl_signer.sign_to_vec()?;
    if !ecdsa {
        return Ok(signature);
    }

    let width = i32::try_from(signer.key().bits().div_ceil(8))
        .map_err(|e| FixtureError::Crypto(e.to_string()))?;
    let parsed = EcdsaSig::from_der(&signature)?;
    Ok([
        parsed.r().to_vec_padded(width)?,
        parsed.s().to_vec_padded(width)?,
    ]
    .concat())
}

// =============================================================================
// XML-Enc
// =============================================================================

/// Wrap `assertion_xml` in a `saml:EncryptedAssertion` for `recipient`.
fn encrypt_assertion(
    assertion_xml: &str,
    recipient: &X509,
    algorithm: DataEncryptionAlgorithm,
) -> Result<String, FixtureError> {
    let mut key = vec![0u8; algorithm.key_len()];
    rand_bytes(&mut key)?;

    let cipher_value = if algorithm.is_gcm() {
        let mut iv = [0u8; GCM_IV_LEN];
        rand_bytes(&mut iv)?;
        let mut tag = [0u8; GCM_TAG_LEN];
        let cipher_text = symm::encrypt_aead(
            algorithm.cipher(),
            &key,
            Some(&iv),
            &[],
            assertion_xml.as_bytes(),
            &mut tag,
        )?;
        [iv.as_slice(), cipher_text.as_slice(), tag.as_slice()].concat()
    } else {
        let mut iv = [0u8; CBC_IV_LEN];
        rand_bytes(&mut iv)?;
        // PKCS#7 padding satisfies the XML-Enc padding rule.
        let cipher_text = symm::encrypt(algorithm.cipher(), &key, Some(&iv), assertion_xml.as_bytes())?;
        [iv.as_slice(), cipher_text.as_slice()].concat()
    };

    let public_key = recipient.public_key()?;
    let mut encrypter = Encrypter::new(&public_key)?;
    encrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
    encrypter.set_rsa_oaep_md(MessageDigest::sha1())?;
    encrypter.set_rsa_mgf1_md(MessageDigest::sha1())?;
    let mut wrapped = vec![0u8; encrypter.encrypt_len(&key)?];
    let written = encrypter.encrypt(&key, &mut wrapped)?;
    wrapped.truncate(written);

    Ok(format!(
        r#"<saml:EncryptedAssertion xmlns:saml="{saml}"><xenc:EncryptedData xmlns:xenc="{xenc}" Type="{xenc}Element"><xenc:EncryptionMethod Algorithm="{data_method}"/><ds:KeyInfo xmlns:ds="{dsig}"><xenc:EncryptedKey><xenc:EncryptionMethod Algorithm="{key_method}"><ds:DigestMethod Algorithm="{oaep_digest}"/></xenc:EncryptionMethod><ds:KeyInfo><ds:X509Data><ds:X509Certificate>{certificate}</ds:X509Certificate></ds:X509Data></ds:KeyInfo><xenc:CipherData><xenc:CipherValue>{wrapped}</xenc:CipherValue></xenc:CipherData></xenc:EncryptedKey></ds:KeyInfo><xenc:CipherData><xenc:CipherValue>{cipher_value}</xenc:CipherValue></xenc:CipherData></xenc:EncryptedData></saml:EncryptedAssertion>"#,
        saml = ns::SAML,
        xenc = ns::XMLENC,
        dsig = ns::DSIG,
        data_method = algorithm.uri(),
        key_method = KeyTransportAlgorithm::RsaOaepMgf1p.uri(),
        oaep_digest = DIGEST_SHA1,
        certificate = STANDARD.encode(recipient.to_der()?),
        wrapped = STANDARD.encode(wrapped),
        cipher_value = STANDARD.encode(cipher_value),
    ))
}

// =============================================================================
// Helpers
// =============================================================================

fn parse(xml: &str) -> Result<Document, FixtureError> {
    Document::parse(xml).map_err(|e| FixtureError::Xml(e.to_string()))
}

fn instant(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
