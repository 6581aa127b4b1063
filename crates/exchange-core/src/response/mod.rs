//! Response security pipeline.
//!
//! Turns raw response bytes into an [`AuthenticationResponse`] or a
//! terminal [`ExchangeError`]. Steps run in a fixed order:
//!
//! 1. parse (DOCTYPE rejected) and decrypt `EncryptedAssertion`s
//! 2. encryption policy
//! 3. signature algorithm allow-list, then XML-DSig and signer trust
//! 4. status versus assertion count
//! 5. `Conditions` validity window with clock skew
//! 6. audience restriction and bearer subject confirmation
//! 7. exactly one `AttributeStatement`
//!
//! The response signature is verified on the received document; assertion
//! signatures on the decrypted one.

pub mod conditions;
mod decrypt;
mod model;
pub mod signature;

pub use self::decrypt::{DataEncryptionAlgorithm, DecryptionCredential, KeyTransportAlgorithm};
pub use self::model::{
    AssertionAttribute, AuthenticationResponse, ResponseStatus, ValidatedAssertion, STATUS_SUCCESS,
};
pub use self::signature::SignatureAlgorithm;

use crate::errors::ExchangeError;
use crate::observability::metrics;
use crate::trust::{CertificateTrustVerifier, CertificateVerifierParams, TrustAnchorSet};
use crate::xml::{ns, Document, Element};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration, Utc};
use common::clock::Clock;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Policy knobs for the pipeline; fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub signature_allow_list: Vec<SignatureAlgorithm>,
    pub clock_skew_before: Duration,
    pub clock_skew_after: Duration,
    pub encryption_required: bool,
    pub check_bearer_ip: bool,
    pub expected_audience: Option<String>,
    pub require_signed_response: bool,
    pub require_signed_assertion: bool,
    pub verifier_params: CertificateVerifierParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            signature_allow_list: SignatureAlgorithm::default_allow_list(),
            clock_skew_before: Duration::seconds(60),
            clock_skew_after: Duration::seconds(60),
            encryption_required: true,
            check_bearer_ip: true,
            expected_audience: None,
            require_signed_response: true,
            require_signed_assertion: false,
            verifier_params: CertificateVerifierParams::default(),
        }
    }
}

/// Per-call inputs.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    pub trust_anchors: &'a TrustAnchorSet,
    pub bearer_ip: Option<&'a str>,
    pub deadline: Option<DateTime<Utc>>,
}

impl<'a> ValidationContext<'a> {
    pub fn new(trust_anchors: &'a TrustAnchorSet) -> Self {
        Self {
            trust_anchors,
            bearer_ip: None,
            deadline: None,
        }
    }

    #[must_use]
    pub fn with_bearer_ip(mut self, bearer_ip: &'a str) -> Self {
        self.bearer_ip = Some(bearer_ip);
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ResponseSecurityPipeline {
    config: PipelineConfig,
    decryption_credentials: Vec<DecryptionCredential>,
    verifier: CertificateTrustVerifier,
    clock: Arc<dyn Clock>,
}

impl ResponseSecurityPipeline {
    pub fn new(
        config: PipelineConfig,
        verifier: CertificateTrustVerifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            decryption_credentials: Vec::new(),
            verifier,
            clock,
        }
    }

    #[must_use]
    pub fn with_decryption_credential(mut self, credential: DecryptionCredential) -> Self {
        self.decryption_credentials.push(credential);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every check on `raw` and extract the assertion.
    ///
    /// # Errors
    ///
    /// The first failing step's [`ExchangeError`]; nothing partial is
    /// returned.
    #[instrument(skip_all, fields(bytes = raw.len()))]
    pub fn process(
        &self,
        raw: &[u8],
        context: &ValidationContext<'_>,
    ) -> Result<AuthenticationResponse, ExchangeError> {
        let result = self.process_inner(raw, context);

        match &result {
            Ok(response) => {
                debug!(
                    target: "exchange.response",
                    success = response.status().is_success(),
                    encrypted = response.was_encrypted(),
                    "Response accepted"
                );
                metrics::record_response_validation("success", None);
            }
            Err(e) => {
                debug!(target: "exchange.response", error_kind = e.kind(), "Response rejected");
                metrics::record_response_validation("error", Some(e.kind()));
            }
        }

        result
    }

    fn process_inner(
        &self,
        raw: &[u8],
        context: &ValidationContext<'_>,
    ) -> Result<AuthenticationResponse, ExchangeError> {
        let text = std::str::from_utf8(raw).map_err(|_| ExchangeError::MalformedResponse)?;
        let received = Document::parse(text).map_err(|e| {
            debug!(target: "exchange.response", error = %e, "Response is not acceptable XML");
            ExchangeError::from(e)
        })?;
        if !received.root().is(ns::SAMLP, "Response") {
            return Err(ExchangeError::MalformedResponse);
        }

        let decrypted = decrypt::decrypt_assertions(&received, &self.decryption_credentials)?;
        let encrypted = decrypted.is_some();
        let document = decrypted.as_ref().unwrap_or(&received);

        if self.config.encryption_required
            && received.root().first_child(ns::SAML, "Assertion").is_some()
        {
            debug!(target: "exchange.response", "Plaintext assertion where encryption is required");
            return Err(ExchangeError::EncryptionRequired);
        }

        let assertions: Vec<&Element> = document
            .root()
            .children_named(ns::SAML, "Assertion")
            .collect();
        self.verify_signatures(&received, document, &assertions, context)?;

        let status = ResponseStatus::from_response(document.root())?;
        let assertion = match (status.is_success(), assertions.as_slice()) {
            (true, [assertion]) => *assertion,
            (false, []) => {
                return AuthenticationResponse::new(document.root(), status, None, encrypted);
            }
            (success, found) => {
                debug!(
                    target: "exchange.response",
                    success,
                    assertions = found.len(),
                    "Assertion count does not fit the status"
                );
                return Err(ExchangeError::MalformedResponse);
            }
        };

        let (not_before, not_on_or_after) = conditions::verify_time_window(
            assertion,
            self.clock.now(),
            self.config.clock_skew_before,
            self.config.clock_skew_after,
        )?;

        if let Some(expected) = self.config.expected_audience.as_deref() {
            conditions::verify_audience(assertion, expected)?;
        }
        if self.config.check_bearer_ip {
            conditions::verify_bearer_ip(assertion, context.bearer_ip)?;
        }

        let statement = conditions::single_attribute_statement(assertion)?;
        let validated = ValidatedAssertion::extract(assertion, statement, not_before, not_on_or_after)?;

        AuthenticationResponse::new(document.root(), status, Some(validated), encrypted)
    }

    /// Allow-list first for every signature present, then cryptographic
    /// verification and signer trust.
    fn verify_signatures(
        &self,
        received: &Document,
        document: &Document,
        assertions: &[&Element],
        context: &ValidationContext<'_>,
    ) -> Result<(), ExchangeError> {
        let allow_list = &self.config.signature_allow_list;

        let response_signature = signature::signature_of(received.root())
            .map(|sig| signature::check_allowed(sig, allow_list).map(|alg| (sig, alg)))
            .transpose()?;
        let assertion_signatures = assertions
            .iter()
            .map(|assertion| {
                signature::signature_of(assertion)
                    .map(|sig| signature::check_allowed(sig, allow_list).map(|alg| (*assertion, sig, alg)))
                    .transpose()
            })
            .collect::<Result<Vec<_>, _>>()?;

        match response_signature {
            Some((sig, algorithm)) => {
                let credential = signature::verify_enveloped(received, received.root(), sig, algorithm)?;
                self.verifier.verify_with_deadline(
                    &credential,
                    context.trust_anchors,
                    self.config.verifier_params,
                    context.deadline,
                )?;
            }
            None if self.config.require_signed_response => {
                debug!(target: "exchange.response", "Response is not signed");
                return Err(ExchangeError::InvalidSignature);
            }
            None => {}
        }

        for (assertion, found) in assertions.iter().zip(&assertion_signatures) {
            match found {
                Some((signed, sig, algorithm)) => {
                    let credential = signature::verify_enveloped(document, signed, sig, *algorithm)?;
                    self.verifier.verify_with_deadline(
                        &credential,
                        context.trust_anchors,
                        self.config.verifier_params,
                        context.deadline,
                    )?;
                }
                None if self.config.require_signed_assertion => {
                    debug!(
                        target: "exchange.response",
                        assertion = assertion.id().unwrap_or_default(),
                        "Assertion is not signed"
                    );
                    return Err(ExchangeError::InvalidSignature);
                }
                None => {}
            }
        }

        Ok(())
    }
}

/// Base64 text content with embedded whitespace removed.
pub(crate) fn base64_content(element: &Element) -> Option<Vec<u8>> {
    let compact: String = element
        .text()
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    STANDARD.decode(compact).ok()
}
