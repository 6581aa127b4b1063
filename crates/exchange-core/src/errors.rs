use thiserror::Error;

/// Every way an exchange operation can fail.
///
/// Display messages are deliberately coarse. Callers map the variant (or
/// [`ExchangeError::kind`]) to a user-facing message; diagnostic detail is
/// logged at debug level where the failure is raised.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    // Light token
    #[error("Light token could not be parsed")]
    TokenParseError,

    #[error("Light token digest does not match")]
    TokenDigestMismatch,

    #[error("Light token exceeds the maximum size")]
    TokenTooLarge,

    #[error("Digest algorithm is not supported: {0}")]
    UnsupportedDigestAlgorithm(String),

    // Correlation
    #[error("Correlation key is invalid")]
    InvalidKey,

    #[error("Authentication request is invalid")]
    InvalidRequest,

    #[error("No matching request for this response")]
    NoMatchingRequest,

    #[error("Response does not correspond to the stored request")]
    CorrelationMismatch,

    #[error("Correlation backend error: {0}")]
    CorrelationBackend(String),

    // Response pipeline
    #[error("Response could not be decrypted")]
    DecryptionFailed,

    #[error("Response must be encrypted")]
    EncryptionRequired,

    #[error("Signature algorithm is not allowed")]
    DisallowedSignatureAlgorithm,

    #[error("Signature is invalid")]
    InvalidSignature,

    #[error("Response is malformed")]
    MalformedResponse,

    #[error("Assertion conditions are malformed")]
    MalformedConditions,

    #[error("Assertion is not yet valid")]
    TokenNotYetValid,

    #[error("Assertion has expired")]
    TokenExpired,

    #[error("Audience restriction does not match")]
    AudienceRestrictionMismatch,

    #[error("Subject confirmation does not match")]
    SubjectConfirmationMismatch,

    #[error("Assertion has no single attribute statement")]
    MissingAttributeStatement,

    // Certificate trust
    #[error("Certificate has been revoked")]
    CertificateRevoked,

    #[error("Revocation data is missing")]
    MissingRevocationData,

    #[error("Certificate is not trusted")]
    UntrustedCertificate,

    #[error("Certificate verification aborted")]
    VerificationAborted,

    #[error("Cryptographic error: {0}")]
    Crypto(String),
}

impl ExchangeError {
    /// Stable label for metrics and collaborator mapping.
    pub fn kind(&self) -> &'static str {
        match self {
            ExchangeError::TokenParseError => "token_parse_error",
            ExchangeError::TokenDigestMismatch => "token_digest_mismatch",
            ExchangeError::TokenTooLarge => "token_too_large",
            ExchangeError::UnsupportedDigestAlgorithm(_) => "unsupported_digest_algorithm",
            ExchangeError::InvalidKey => "invalid_key",
            ExchangeError::InvalidRequest => "invalid_request",
            ExchangeError::NoMatchingRequest => "no_matching_request",
            ExchangeError::CorrelationMismatch => "correlation_mismatch",
            ExchangeError::CorrelationBackend(_) => "correlation_backend",
            ExchangeError::DecryptionFailed => "decryption_failed",
            ExchangeError::EncryptionRequired => "encryption_required",
            ExchangeError::DisallowedSignatureAlgorithm => "disallowed_signature_algorithm",
            ExchangeError::InvalidSignature => "invalid_signature",
            ExchangeError::MalformedResponse => "malformed_response",
            ExchangeError::MalformedConditions => "malformed_conditions",
            ExchangeError::TokenNotYetValid => "token_not_yet_valid",
            ExchangeError::TokenExpired => "token_expired",
            ExchangeError::AudienceRestrictionMismatch => "audience_restriction_mismatch",
            ExchangeError::SubjectConfirmationMismatch => "subject_confirmation_mismatch",
            ExchangeError::MissingAttributeStatement => "missing_attribute_statement",
            ExchangeError::CertificateRevoked => "certificate_revoked",
            ExchangeError::MissingRevocationData => "missing_revocation_data",
            ExchangeError::UntrustedCertificate => "untrusted_certificate",
            ExchangeError::VerificationAborted => "verification_aborted",
            ExchangeError::Crypto(_) => "crypto",
        }
    }

    /// Whether the failure stems from the light token itself.
    pub fn is_token_error(&self) -> bool {
        matches!(
            self,
            ExchangeError::TokenParseError
                | ExchangeError::TokenDigestMismatch
                | ExchangeError::TokenTooLarge
                | ExchangeError::UnsupportedDigestAlgorithm(_)
        )
    }
}

impl From<openssl::error::ErrorStack> for ExchangeError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        ExchangeError::Crypto(err.to_string())
    }
}
