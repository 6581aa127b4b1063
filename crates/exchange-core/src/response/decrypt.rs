//! XML-Enc decryption of `EncryptedAssertion` elements.
//!
//! Each encrypted assertion is decrypted independently and spliced back in
//! place of its `EncryptedAssertion`; the result is serialized and parsed
//! again as one document so signature references resolve against the
//! decrypted tree.

use super::base64_content;
use super::signature::{digest_method, DIGEST_SHA1};
use crate::errors::ExchangeError;
use crate::xml::{ns, Document, Element, Node};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Padding;
use openssl::symm::{self, Cipher, Crypter, Mode};
use openssl::x509::X509;
use std::fmt;
use tracing::debug;

const GCM_IV_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;
const CBC_IV_LEN: usize = 16;

const MGF1_SHA1: &str = "http://www.w3.org/2009/xmlenc11#mgf1sha1";
const MGF1_SHA224: &str = "http://www.w3.org/2009/xmlenc11#mgf1sha224";
const MGF1_SHA256: &str = "http://www.w3.org/2009/xmlenc11#mgf1sha256";
const MGF1_SHA384: &str = "http://www.w3.org/2009/xmlenc11#mgf1sha384";
const MGF1_SHA512: &str = "http://www.w3.org/2009/xmlenc11#mgf1sha512";

/// Block ciphers for `EncryptedData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataEncryptionAlgorithm {
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
}

impl DataEncryptionAlgorithm {
    pub const ALL: [DataEncryptionAlgorithm; 6] = [
        DataEncryptionAlgorithm::Aes128Cbc,
        DataEncryptionAlgorithm::Aes192Cbc,
        DataEncryptionAlgorithm::Aes256Cbc,
        DataEncryptionAlgorithm::Aes128Gcm,
        DataEncryptionAlgorithm::Aes192Gcm,
        DataEncryptionAlgorithm::Aes256Gcm,
    ];

    pub fn uri(self) -> &'static str {
        match self {
            DataEncryptionAlgorithm::Aes128Cbc => "http://www.w3.org/2001/04/xmlenc#aes128-cbc",
            DataEncryptionAlgorithm::Aes192Cbc => "http://www.w3.org/2001/04/xmlenc#aes192-cbc",
            DataEncryptionAlgorithm::Aes256Cbc => "http://www.w3.org/2001/04/xmlenc#aes256-cbc",
            DataEncryptionAlgorithm::Aes128Gcm => "http://www.w3.org/2009/xmlenc11#aes128-gcm",
            DataEncryptionAlgorithm::Aes192Gcm => "http://www.w3.org/2009/xmlenc11#aes192-gcm",
            DataEncryptionAlgorithm::Aes256Gcm => "http://www.w3.org/2009/xmlenc11#aes256-gcm",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.uri() == uri.trim())
    }

    pub fn cipher(self) -> Cipher {
        match self {
            DataEncryptionAlgorithm::Aes128Cbc => Cipher::aes_128_cbc(),
            DataEncryptionAlgorithm::Aes192Cbc => Cipher::aes_192_cbc(),
            DataEncryptionAlgorithm::Aes256Cbc => Cipher::aes_256_cbc(),
            DataEncryptionAlgorithm::Aes128Gcm => Cipher::aes_128_gcm(),
            DataEncryptionAlgorithm::Aes192Gcm => Cipher::aes_192_gcm(),
            DataEncryptionAlgorithm::Aes256Gcm => Cipher::aes_256_gcm(),
        }
    }

    pub fn is_gcm(self) -> bool {
        matches!(
            self,
            DataEncryptionAlgorithm::Aes128Gcm
                | DataEncryptionAlgorithm::Aes192Gcm
                | DataEncryptionAlgorithm::Aes256Gcm
        )
    }

    pub fn key_len(self) -> usize {
        self.cipher().key_len()
    }
}

/// RSA key transport for `EncryptedKey`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTransportAlgorithm {
    /// OAEP, MGF1 fixed to SHA-1.
    RsaOaepMgf1p,
    /// OAEP with `DigestMethod` and `xenc11:MGF` parameters.
    RsaOaep,
}

impl KeyTransportAlgorithm {
    pub fn uri(self) -> &'static str {
        match self {
            KeyTransportAlgorithm::RsaOaepMgf1p => "http://www.w3.org/2001/04/xmlenc#rsa-oaep-mgf1p",
            KeyTransportAlgorithm::RsaOaep => "http://www.w3.org/2009/xmlenc11#rsa-oaep",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        [KeyTransportAlgorithm::RsaOaepMgf1p, KeyTransportAlgorithm::RsaOaep]
            .into_iter()
            .find(|alg| alg.uri() == uri.trim())
    }
}

/// A private key able to unwrap content-encryption keys, with the
/// certificate that identifies it to senders.
#[derive(Clone)]
pub struct DecryptionCredential {
    private_key: PKey<Private>,
    certificate: X509,
}

impl DecryptionCredential {
    pub fn new(private_key: PKey<Private>, certificate: X509) -> Self {
        Self {
            private_key,
            certificate,
        }
    }

    /// # Errors
    ///
    /// [`ExchangeError::Crypto`] if either PEM block does not parse.
    pub fn from_pem(private_key_pem: &[u8], certificate_pem: &[u8]) -> Result<Self, ExchangeError> {
        Ok(Self::new(
            PKey::private_key_from_pem(private_key_pem)?,
            X509::from_pem(certificate_pem)?,
        ))
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    fn matches(&self, certificate: &X509) -> bool {
        match (self.certificate.public_key(), certificate.public_key()) {
            (Ok(ours), Ok(theirs)) => ours.public_eq(&theirs),
            _ => false,
        }
    }
}

impl fmt::Debug for DecryptionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptionCredential")
            .field("private_key", &"[REDACTED]")
            .field("certificate", &self.certificate.subject_name())
            .finish()
    }
}

/// Decrypt every `EncryptedAssertion` in `received`.
///
/// Returns `None` when nothing was encrypted, otherwise the reparsed
/// decrypted document.
pub(crate) fn decrypt_assertions(
    received: &Document,
    credentials: &[DecryptionCredential],
) -> Result<Option<Document>, ExchangeError> {
    if !contains_encrypted(received.root()) {
        return Ok(None);
    }

    let mut root = received.root().clone();
    replace_encrypted(&mut root, credentials)?;

    let document = Document::parse(&root.to_xml()).map_err(|e| {
        debug!(target: "exchange.response", error = %e, "Decrypted document did not reparse");
        ExchangeError::DecryptionFailed
    })?;
    Ok(Some(document))
}

fn contains_encrypted(element: &Element) -> bool {
    element
        .child_elements()
        .any(|child| child.is(ns::SAML, "EncryptedAssertion") || contains_encrypted(child))
}

fn replace_encrypted(
    element: &mut Element,
    credentials: &[DecryptionCredential],
) -> Result<(), ExchangeError> {
    for child in element.children_mut() {
        let Node::Element(child_element) = child else {
            continue;
        };
        if child_element.is(ns::SAML, "EncryptedAssertion") {
            let assertion = decrypt_assertion(child_element, credentials)?;
            *child = Node::Element(assertion);
        } else {
            replace_encrypted(child_element, credentials)?;
        }
    }
    Ok(())
}

fn decrypt_assertion(
    encrypted_assertion: &Element,
    credentials: &[DecryptionCredential],
) -> Result<Element, ExchangeError> {
    let failed = |reason: &'static str| {
        debug!(target: "exchange.response", reason, "Assertion decryption failed");
        ExchangeError::DecryptionFailed
    };

    let encrypted_data = encrypted_assertion
        .first_child(ns::XMLENC, "EncryptedData")
        .ok_or_else(|| failed("missing EncryptedData"))?;
    let data_algorithm = encrypted_data
        .first_child(ns::XMLENC, "EncryptionMethod")
        .and_then(|method| method.attribute("Algorithm"))
        .and_then(DataEncryptionAlgorithm::from_uri)
        .ok_or_else(|| failed("unsupported data encryption algorithm"))?;
    let cipher_text = cipher_value(encrypted_data).ok_or_else(|| failed("missing CipherValue"))?;

    let encrypted_keys: Vec<&Element> = encrypted_data
        .first_child(ns::DSIG, "KeyInfo")
        .into_iter()
        .flat_map(|key_info| key_info.children_named(ns::XMLENC, "EncryptedKey"))
        .chain(encrypted_assertion.children_named(ns::XMLENC, "EncryptedKey"))
        .collect();
    if encrypted_keys.is_empty() {
        return Err(failed("no EncryptedKey"));
    }

    let plaintext = encrypted_keys
        .iter()
        .find_map(|encrypted_key| {
            candidates(encrypted_key, credentials).find_map(|credential| {
                let key = unwrap_key(encrypted_key, credential).ok()?;
                if key.len() != data_algorithm.key_len() {
                    return None;
                }
                decrypt_data(data_algorithm, &key, &cipher_text).ok()
            })
        })
        .ok_or_else(|| failed("no credential could decrypt"))?;

    let text = String::from_utf8(plaintext).map_err(|_| failed("plaintext is not UTF-8"))?;
    let assertion = Element::parse_fragment(&text, encrypted_assertion.in_scope_namespaces())
        .map_err(|_| failed("plaintext is not well-formed"))?;
    if !assertion.is(ns::SAML, "Assertion") {
        return Err(failed("plaintext is not an assertion"));
    }
    Ok(assertion)
}

/// Credentials worth trying for `encrypted_key`: the one whose certificate
/// matches the key's `X509Certificate` hint, otherwise all of them.
fn candidates<'a>(
    encrypted_key: &Element,
    credentials: &'a [DecryptionCredential],
) -> Box<dyn Iterator<Item = &'a DecryptionCredential> + 'a> {
    let hint = encrypted_key
        .first_child(ns::DSIG, "KeyInfo")
        .and_then(|key_info| key_info.descendants_named(ns::DSIG, "X509Certificate").into_iter().next())
        .and_then(base64_content)
        .and_then(|der| X509::from_der(&der).ok());

    match hint {
        Some(certificate) => Box::new(
            credentials
                .iter()
                .filter(move |credential| credential.matches(&certificate)),
        ),
        None => Box::new(credentials.iter()),
    }
}

fn unwrap_key(
    encrypted_key: &Element,
    credential: &DecryptionCredential,
) -> Result<Vec<u8>, ExchangeError> {
    let method = encrypted_key
        .first_child(ns::XMLENC, "EncryptionMethod")
        .ok_or(ExchangeError::DecryptionFailed)?;
    let transport = method
        .attribute("Algorithm")
        .and_then(KeyTransportAlgorithm::from_uri)
        .ok_or(ExchangeError::DecryptionFailed)?;

    let oaep_digest = match method.first_child(ns::DSIG, "DigestMethod") {
        Some(digest) => digest
            .attribute("Algorithm")
            .and_then(digest_method)
            .ok_or(ExchangeError::DecryptionFailed)?,
        None => digest_method(DIGEST_SHA1).ok_or(ExchangeError::DecryptionFailed)?,
    };
    let mgf1_digest = match transport {
        KeyTransportAlgorithm::RsaOaepMgf1p => MessageDigest::sha1(),
        KeyTransportAlgorithm::RsaOaep => match method.first_child(ns::XMLENC11, "MGF") {
            Some(mgf) => mgf
                .attribute("Algorithm")
                .and_then(mgf1_digest)
                .ok_or(ExchangeError::DecryptionFailed)?,
            None => MessageDigest::sha1(),
        },
    };

    let wrapped = cipher_value(encrypted_key).ok_or(ExchangeError::DecryptionFailed)?;

    let mut decrypter = openssl::encrypt::Decrypter::new(&credential.private_key)?;
    decrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
    decrypter.set_rsa_oaep_md(oaep_digest)?;
    decrypter.set_rsa_mgf1_md(mgf1_digest)?;

    let mut key = vec![0u8; decrypter.decrypt_len(&wrapped)?];
    let written = decrypter.decrypt(&wrapped, &mut key)?;
    key.truncate(written);
    Ok(key)
}

fn mgf1_digest(uri: &str) -> Option<MessageDigest> {
    match uri {
        MGF1_SHA1 => Some(MessageDigest::sha1()),
        MGF1_SHA224 => Some(MessageDigest::sha224()),
        MGF1_SHA256 => Some(MessageDigest::sha256()),
        MGF1_SHA384 => Some(MessageDigest::sha384()),
        MGF1_SHA512 => Some(MessageDigest::sha512()),
        _ => None,
    }
}

fn cipher_value(element: &Element) -> Option<Vec<u8>> {
    element
        .first_child(ns::XMLENC, "CipherData")?
        .first_child(ns::XMLENC, "CipherValue")
        .and_then(base64_content)
}

fn decrypt_data(
    algorithm: DataEncryptionAlgorithm,
    key: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, ExchangeError> {
    if algorithm.is_gcm() {
        if data.len() < GCM_IV_LEN + GCM_TAG_LEN {
            return Err(ExchangeError::DecryptionFailed);
        }
        let (iv, rest) = data.split_at(GCM_IV_LEN);
        let (cipher_text, tag) = rest.split_at(rest.len() - GCM_TAG_LEN);
        return Ok(symm::decrypt_aead(algorithm.cipher(), key, Some(iv), &[], cipher_text, tag)?);
    }

    if data.len() < CBC_IV_LEN * 2 || data.len() % CBC_IV_LEN != 0 {
        return Err(ExchangeError::DecryptionFailed);
    }
    let (iv, cipher_text) = data.split_at(CBC_IV_LEN);
    let cipher = algorithm.cipher();
    let mut crypter = Crypter::new(cipher, Mode::Decrypt, key, Some(iv))?;
    crypter.pad(false);

    let mut plaintext = vec![0u8; cipher_text.len() + cipher.block_size()];
    let mut written = crypter.update(cipher_text, &mut plaintext)?;
    written += crypter.finalize(plaintext.get_mut(written..).unwrap_or_default())?;
    plaintext.truncate(written);

    // XML-Enc padding: the last byte is the pad length, other pad bytes are arbitrary.
    let pad = plaintext.last().map_or(0, |last| usize::from(*last));
    if pad == 0 || pad > CBC_IV_LEN || pad > plaintext.len() {
        return Err(ExchangeError::DecryptionFailed);
    }
    plaintext.truncate(plaintext.len() - pad);
    Ok(plaintext)
}
