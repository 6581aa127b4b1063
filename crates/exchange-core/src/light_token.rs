//! Light token codec.
//!
//! A light token is the compact reference passed through the user agent
//! between the node and a specific adapter. On the wire it is
//!
//! ```text
//! ISSUER|ID|CREATED_ON|DIGEST
//! ```
//!
//! where `DIGEST` is the standard base64 of `hash(ID|ISSUER|CREATED_ON|SECRET)`.
//! The digest input lists the id before the issuer; this ordering is part of
//! the interoperable format and must not be "fixed".
//!
//! # Security
//!
//! - Input is size-checked BEFORE any parsing or base64 work
//! - Digests are compared in constant time
//! - Error messages never echo token content

use crate::errors::ExchangeError;
use crate::observability::{hash_for_correlation, metrics};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use common::clock::Clock;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512, Sha512_256};
use std::fmt;
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

// =============================================================================
// Constants
// =============================================================================

/// Maximum encoded token size in bytes.
///
/// Applies to both the raw form and the base64 form, and is checked before
/// the input is split, decoded or hashed.
pub const MAX_TOKEN_SIZE: usize = 1024;

/// Field separator.
pub const SEPARATOR: char = '|';

/// `CREATED_ON` pattern, millisecond precision (`1956-10-23 10:52:01 698`).
pub const CREATED_ON_FORMAT: &str = "%Y-%m-%d %H:%M:%S %3f";

/// Digest algorithm used when none is configured.
pub const DEFAULT_DIGEST_ALGORITHM: &str = "SHA-256";

// =============================================================================
// Digest Algorithms
// =============================================================================

/// Hash functions available for the token digest, named as in the JCA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha224,
    Sha256,
    Sha384,
    Sha512,
    Sha512_256,
}

impl DigestAlgorithm {
    /// Canonical algorithm name.
    pub fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha224 => "SHA-224",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha384 => "SHA-384",
            DigestAlgorithm::Sha512 => "SHA-512",
            DigestAlgorithm::Sha512_256 => "SHA-512/256",
        }
    }

    fn hash(self, input: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Sha224 => Sha224::digest(input).to_vec(),
            DigestAlgorithm::Sha256 => Sha256::digest(input).to_vec(),
            DigestAlgorithm::Sha384 => Sha384::digest(input).to_vec(),
            DigestAlgorithm::Sha512 => Sha512::digest(input).to_vec(),
            DigestAlgorithm::Sha512_256 => Sha512_256::digest(input).to_vec(),
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = ExchangeError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim().to_ascii_uppercase().as_str() {
            "SHA-224" | "SHA224" => Ok(DigestAlgorithm::Sha224),
            "SHA-256" | "SHA256" => Ok(DigestAlgorithm::Sha256),
            "SHA-384" | "SHA384" => Ok(DigestAlgorithm::Sha384),
            "SHA-512" | "SHA512" => Ok(DigestAlgorithm::Sha512),
            "SHA-512/256" | "SHA512/256" => Ok(DigestAlgorithm::Sha512_256),
            _ => Err(ExchangeError::UnsupportedDigestAlgorithm(name.to_string())),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Token Types
// =============================================================================

/// Logical light token.
///
/// Built once through [`LightToken::new`]; fields are validated there and
/// never re-checked.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LightToken {
    id: String,
    issuer: String,
    created_on: DateTime<Utc>,
}

impl LightToken {
    /// Build a token.
    ///
    /// `id` is trimmed. Both `id` and `issuer` must be non-blank and free of
    /// the separator. `created_on` is truncated to milliseconds, the
    /// precision the wire format carries.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::TokenParseError`] if a field is blank or contains `|`.
    pub fn new(
        id: impl Into<String>,
        issuer: impl Into<String>,
        created_on: DateTime<Utc>,
    ) -> Result<Self, ExchangeError> {
        let id = id.into().trim().to_string();
        let issuer = issuer.into();

        if id.is_empty() || issuer.trim().is_empty() {
            debug!(target: "exchange.token", "Light token rejected: blank id or issuer");
            return Err(ExchangeError::TokenParseError);
        }
        if id.contains(SEPARATOR) || issuer.contains(SEPARATOR) {
            debug!(target: "exchange.token", "Light token rejected: separator inside a field");
            return Err(ExchangeError::TokenParseError);
        }

        Ok(Self {
            id,
            issuer,
            created_on: created_on.trunc_subsecs(3),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn created_on(&self) -> DateTime<Utc> {
        self.created_on
    }

    /// `CREATED_ON` as rendered on the wire.
    pub fn formatted_created_on(&self) -> String {
        self.created_on.format(CREATED_ON_FORMAT).to_string()
    }
}

/// Encoded token bytes together with the token they decode to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryLightToken {
    token: LightToken,
    bytes: Vec<u8>,
}

impl BinaryLightToken {
    pub fn token(&self) -> &LightToken {
        &self.token
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_parts(self) -> (LightToken, Vec<u8>) {
        (self.token, self.bytes)
    }
}

// =============================================================================
// Codec
// =============================================================================

fn compute_digest(
    algorithm: DigestAlgorithm,
    issuer: &str,
    id: &str,
    created_on: &str,
    secret: &SecretString,
) -> String {
    let mut input = String::with_capacity(
        id.len() + issuer.len() + created_on.len() + secret.expose_secret().len() + 3,
    );
    input.push_str(id);
    input.push(SEPARATOR);
    input.push_str(issuer);
    input.push(SEPARATOR);
    input.push_str(created_on);
    input.push(SEPARATOR);
    input.push_str(secret.expose_secret());

    STANDARD.encode(algorithm.hash(input.as_bytes()))
}

fn digests_match(expected: &str, supplied: &str) -> bool {
    expected.len() == supplied.len()
        && openssl::memcmp::eq(expected.as_bytes(), supplied.as_bytes())
}

/// Encode `token` into its wire form.
///
/// # Errors
///
/// [`ExchangeError::UnsupportedDigestAlgorithm`] for an unknown algorithm name.
pub fn encode(
    token: &LightToken,
    secret: &SecretString,
    algorithm: &str,
) -> Result<BinaryLightToken, ExchangeError> {
    let algorithm = match DigestAlgorithm::from_str(algorithm) {
        Ok(algorithm) => algorithm,
        Err(e) => {
            metrics::record_token_operation("encode", "error");
            return Err(e);
        }
    };

    let created_on = token.formatted_created_on();
    let digest = compute_digest(algorithm, &token.issuer, &token.id, &created_on, secret);

    let wire = [
        token.issuer.as_str(),
        token.id.as_str(),
        created_on.as_str(),
        digest.as_str(),
    ]
    .join(&SEPARATOR.to_string());

    debug!(
        target: "exchange.token",
        token_id = %hash_for_correlation(&token.id),
        algorithm = %algorithm,
        "Light token encoded"
    );
    metrics::record_token_operation("encode", "success");

    Ok(BinaryLightToken {
        token: token.clone(),
        bytes: wire.into_bytes(),
    })
}

/// Decode and authenticate a wire-form token.
///
/// # Errors
///
/// - [`ExchangeError::TokenTooLarge`] if `bytes` exceeds [`MAX_TOKEN_SIZE`]
/// - [`ExchangeError::UnsupportedDigestAlgorithm`] for an unknown algorithm
/// - [`ExchangeError::TokenParseError`] for a wrong part count, blank id or
///   bad timestamp
/// - [`ExchangeError::TokenDigestMismatch`] if the digest does not verify
pub fn decode(
    bytes: &[u8],
    secret: &SecretString,
    algorithm: &str,
) -> Result<BinaryLightToken, ExchangeError> {
    let result = decode_inner(bytes, secret, algorithm);
    match &result {
        Ok(_) => metrics::record_token_operation("decode", "success"),
        Err(_) => metrics::record_token_operation("decode", "error"),
    }
    result
}

fn decode_inner(
    bytes: &[u8],
    secret: &SecretString,
    algorithm: &str,
) -> Result<BinaryLightToken, ExchangeError> {
    if bytes.len() > MAX_TOKEN_SIZE {
        debug!(
            target: "exchange.token",
            size = bytes.len(),
            max_size = MAX_TOKEN_SIZE,
            "Light token rejected: size exceeds maximum"
        );
        return Err(ExchangeError::TokenTooLarge);
    }

    let algorithm = DigestAlgorithm::from_str(algorithm)?;

    let text = std::str::from_utf8(bytes).map_err(|_| {
        debug!(target: "exchange.token", "Light token rejected: not UTF-8");
        ExchangeError::TokenParseError
    })?;

    let parts: Vec<&str> = text.split(SEPARATOR).collect();
    let [issuer, id, created_on, digest] = parts.as_slice() else {
        debug!(
            target: "exchange.token",
            parts = parts.len(),
            "Light token rejected: wrong number of parts"
        );
        return Err(ExchangeError::TokenParseError);
    };

    if id.trim().is_empty() {
        debug!(target: "exchange.token", "Light token rejected: blank id");
        return Err(ExchangeError::TokenParseError);
    }

    let timestamp = NaiveDateTime::parse_from_str(created_on, CREATED_ON_FORMAT).map_err(|e| {
        debug!(target: "exchange.token", error = %e, "Light token rejected: bad timestamp");
        ExchangeError::TokenParseError
    })?;

    let expected = compute_digest(algorithm, issuer, id, created_on, secret);
    if !digests_match(&expected, digest) {
        debug!(target: "exchange.token", "Light token rejected: digest mismatch");
        return Err(ExchangeError::TokenDigestMismatch);
    }

    let token = LightToken::new(*id, *issuer, timestamp.and_utc())?;

    debug!(
        target: "exchange.token",
        token_id = %hash_for_correlation(token.id()),
        "Light token decoded"
    );

    Ok(BinaryLightToken {
        token,
        bytes: bytes.to_vec(),
    })
}

/// Base64-decode then [`decode`].
///
/// The size limit applies to the base64 input, before decoding.
///
/// # Errors
///
/// As [`decode`]; invalid base64 is a [`ExchangeError::TokenParseError`].
pub fn decode_base64(
    base64_bytes: &[u8],
    secret: &SecretString,
    algorithm: &str,
) -> Result<BinaryLightToken, ExchangeError> {
    if base64_bytes.len() > MAX_TOKEN_SIZE {
        debug!(
            target: "exchange.token",
            size = base64_bytes.len(),
            max_size = MAX_TOKEN_SIZE,
            "Light token rejected: base64 size exceeds maximum"
        );
        metrics::record_token_operation("decode", "error");
        return Err(ExchangeError::TokenTooLarge);
    }

    let raw = STANDARD.decode(base64_bytes).map_err(|e| {
        debug!(target: "exchange.token", error = %e, "Light token rejected: invalid base64");
        metrics::record_token_operation("decode", "error");
        ExchangeError::TokenParseError
    })?;

    decode(&raw, secret, algorithm)
}

/// Base64 form for transport in an HTTP parameter.
pub fn encode_base64(token: &BinaryLightToken) -> String {
    STANDARD.encode(&token.bytes)
}

/// Issue a fresh token: random UUID id, `created_on` from `clock`.
///
/// # Errors
///
/// As [`LightToken::new`] and [`encode`].
pub fn create_binary_light_token(
    issuer: &str,
    secret: &SecretString,
    algorithm: &str,
    clock: &dyn Clock,
) -> Result<BinaryLightToken, ExchangeError> {
    let token = LightToken::new(Uuid::new_v4().to_string(), issuer, clock.now())?;
    encode(&token, secret, algorithm)
}

/// Verify a base64 token and return only its id.
///
/// # Errors
///
/// As [`decode_base64`].
pub fn binary_light_token_id(
    base64_token: &str,
    secret: &SecretString,
    algorithm: &str,
) -> Result<String, ExchangeError> {
    let binary = decode_base64(base64_token.as_bytes(), secret, algorithm)?;
    Ok(binary.token.id)
}
