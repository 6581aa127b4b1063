//! Exchange orchestration.
//!
//! `begin` parks the outgoing request under its own id and hands back a
//! light token carrying that id. `complete` authenticates the token,
//! consumes the parked request and runs the response pipeline. Every
//! correlation key is single-use, so there is no retry on the same token.

use crate::config::ExchangeConfig;
use crate::correlation::CorrelationStore;
use crate::errors::ExchangeError;
use crate::light_token::{self, BinaryLightToken, DigestAlgorithm, LightToken};
use crate::observability::{hash_for_correlation, metrics};
use crate::request::{AuthenticationRequest, StoredAuthenticationRequest};
use crate::response::{AuthenticationResponse, ResponseSecurityPipeline, ValidationContext};
use crate::trust::TrustAnchorSet;
use common::clock::Clock;
use common::secret::SecretString;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

/// Default lifetime of a pending exchange.
pub const DEFAULT_CORRELATION_TTL: Duration = Duration::from_secs(120);

/// A successfully completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationExchange {
    stored_request: StoredAuthenticationRequest,
    response: AuthenticationResponse,
}

impl AuthenticationExchange {
    pub fn stored_request(&self) -> &StoredAuthenticationRequest {
        &self.stored_request
    }

    pub fn response(&self) -> &AuthenticationResponse {
        &self.response
    }

    pub fn into_parts(self) -> (StoredAuthenticationRequest, AuthenticationResponse) {
        (self.stored_request, self.response)
    }
}

pub struct ExchangeOrchestrator {
    store: Arc<dyn CorrelationStore>,
    pipeline: ResponseSecurityPipeline,
    trust_anchors: TrustAnchorSet,
    token_issuer: String,
    token_algorithm: DigestAlgorithm,
    correlation_ttl: Duration,
    verification_timeout: Option<chrono::Duration>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ExchangeOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeOrchestrator")
            .field("pipeline", &self.pipeline)
            .field("trust_anchors", &self.trust_anchors)
            .field("token_issuer", &self.token_issuer)
            .field("token_algorithm", &self.token_algorithm)
            .field("correlation_ttl", &self.correlation_ttl)
            .field("verification_timeout", &self.verification_timeout)
            .finish_non_exhaustive()
    }
}

impl ExchangeOrchestrator {
    pub fn new(
        store: Arc<dyn CorrelationStore>,
        pipeline: ResponseSecurityPipeline,
        trust_anchors: TrustAnchorSet,
        token_issuer: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            pipeline,
            trust_anchors,
            token_issuer: token_issuer.into(),
            token_algorithm: DigestAlgorithm::Sha256,
            correlation_ttl: DEFAULT_CORRELATION_TTL,
            verification_timeout: None,
            clock,
        }
    }

    /// Token issuer, algorithm and TTL taken from `config`.
    pub fn from_config(
        config: &ExchangeConfig,
        store: Arc<dyn CorrelationStore>,
        pipeline: ResponseSecurityPipeline,
        trust_anchors: TrustAnchorSet,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(store, pipeline, trust_anchors, config.token_issuer.clone(), clock)
            .with_token_algorithm(config.token_algorithm)
            .with_correlation_ttl(config.correlation_ttl)
    }

    #[must_use]
    pub fn with_token_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.token_algorithm = algorithm;
        self
    }

    #[must_use]
    pub fn with_correlation_ttl(mut self, ttl: Duration) -> Self {
        self.correlation_ttl = ttl;
        self
    }

    /// Abort certificate verification once `timeout` has passed since
    /// `complete` started.
    #[must_use]
    pub fn with_verification_timeout(mut self, timeout: chrono::Duration) -> Self {
        self.verification_timeout = Some(timeout);
        self
    }

    /// Park `request` and issue the token that will bring it back.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::InvalidRequest`] for a blank `remote_ip`, token
    /// encoding failures (an id containing the token separator), and
    /// correlation store failures.
    #[instrument(skip_all)]
    pub fn begin(
        &self,
        request: AuthenticationRequest,
        relay_state: Option<String>,
        remote_ip: &str,
        secret: &SecretString,
    ) -> Result<BinaryLightToken, ExchangeError> {
        // Nothing is stored unless the token encodes.
        let token = LightToken::new(request.id(), self.token_issuer.as_str(), self.clock.now())?;
        let binary = light_token::encode(&token, secret, self.token_algorithm.name())?;
        let key = binary.token().id().to_string();

        let stored = StoredAuthenticationRequest::new(request, relay_state, remote_ip)?;
        self.store.put(&key, stored, self.correlation_ttl)?;

        info!(
            target: "exchange.orchestrator",
            request_id = %hash_for_correlation(&key),
            ttl_seconds = self.correlation_ttl.as_secs(),
            "Exchange begun"
        );

        Ok(binary)
    }

    /// Authenticate the token, consume its pending request and validate the
    /// response against it.
    ///
    /// Token failures return before the correlation store is touched.
    ///
    /// # Errors
    ///
    /// Token errors, [`ExchangeError::NoMatchingRequest`] for an unknown or
    /// already consumed id, any response pipeline error, and
    /// [`ExchangeError::CorrelationMismatch`] when `InResponseTo` names a
    /// different request.
    #[instrument(skip_all)]
    pub fn complete(
        &self,
        token_bytes: &[u8],
        raw_response: &[u8],
        secret: &SecretString,
    ) -> Result<AuthenticationExchange, ExchangeError> {
        let started = Instant::now();
        let result = self.complete_inner(token_bytes, raw_response, secret);

        match &result {
            Ok(exchange) => {
                info!(
                    target: "exchange.orchestrator",
                    request_id = %hash_for_correlation(exchange.stored_request.request().id()),
                    success = exchange.response.status().is_success(),
                    "Exchange completed"
                );
                metrics::record_completion("success", None, started.elapsed());
            }
            Err(e) => {
                info!(
                    target: "exchange.orchestrator",
                    error_kind = e.kind(),
                    "Exchange failed"
                );
                metrics::record_completion("error", Some(e.kind()), started.elapsed());
            }
        }

        result
    }

    fn complete_inner(
        &self,
        token_bytes: &[u8],
        raw_response: &[u8],
        secret: &SecretString,
    ) -> Result<AuthenticationExchange, ExchangeError> {
        let binary = light_token::decode(token_bytes, secret, self.token_algorithm.name())?;
        let key = binary.token().id();

        let stored = self.store.get_and_remove(key)?.ok_or_else(|| {
            debug!(
                target: "exchange.orchestrator",
                request_id = %hash_for_correlation(key),
                "No pending request for token"
            );
            ExchangeError::NoMatchingRequest
        })?;

        let mut context = ValidationContext::new(&self.trust_anchors)
            .with_bearer_ip(stored.remote_ip_address());
        if let Some(timeout) = self.verification_timeout {
            if let Some(deadline) = self.clock.now().checked_add_signed(timeout) {
                context = context.with_deadline(deadline);
            }
        }

        let response = self.pipeline.process(raw_response, &context)?;

        if let Some(in_response_to) = response.in_response_to() {
            if in_response_to != stored.request().id() {
                debug!(
                    target: "exchange.orchestrator",
                    request_id = %hash_for_correlation(stored.request().id()),
                    "Response answers a different request"
                );
                return Err(ExchangeError::CorrelationMismatch);
            }
        }

        Ok(AuthenticationExchange {
            stored_request: stored,
            response,
        })
    }
}
