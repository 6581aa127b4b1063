//! Exchange configuration.
//!
//! Loaded from environment variables. The token secret and the Redis URL
//! are redacted in Debug output.

use crate::correlation::{
    CorrelationStore, InMemoryCorrelationStore, RedisCorrelationStore, DEFAULT_KEY_PREFIX,
};
use crate::errors::ExchangeError;
use crate::light_token::{DigestAlgorithm, DEFAULT_DIGEST_ALGORITHM};
use crate::response::{PipelineConfig, SignatureAlgorithm};
use crate::trust::CertificateVerifierParams;
use common::clock::Clock;
use common::config::{parse_bool, ConfigError};
use common::secret::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Default correlation entry lifetime in seconds.
pub const DEFAULT_CORRELATION_TTL_SECONDS: u64 = 120;

/// Default clock skew allowance, both directions, in seconds.
pub const DEFAULT_CLOCK_SKEW_SECONDS: u64 = 60;

/// Largest clock skew accepted, in seconds.
pub const MAX_CLOCK_SKEW_SECONDS: u64 = 600;

/// Separator for `SIGNATURE_ALGORITHM_ALLOW_LIST`.
pub const ALLOW_LIST_SEPARATOR: char = ';';

#[derive(Clone)]
pub struct ExchangeConfig {
    /// Issuer written into light tokens.
    pub token_issuer: String,

    /// Shared light token secret.
    pub token_secret: SecretString,

    /// Light token digest algorithm.
    pub token_algorithm: DigestAlgorithm,

    /// How long a begun exchange may wait for its response.
    pub correlation_ttl: Duration,

    pub clock_skew_before: Duration,
    pub clock_skew_after: Duration,
    pub encryption_required: bool,
    pub check_bearer_ip: bool,
    pub expected_audience: Option<String>,
    pub signature_allow_list: Vec<SignatureAlgorithm>,
    pub require_signed_response: bool,
    pub require_signed_assertion: bool,
    pub check_revocation: bool,
    pub soft_fail_revocation: bool,

    /// Selects the Redis correlation backend when set.
    pub redis_url: Option<SecretString>,
}

impl fmt::Debug for ExchangeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeConfig")
            .field("token_issuer", &self.token_issuer)
            .field("token_secret", &"[REDACTED]")
            .field("token_algorithm", &self.token_algorithm)
            .field("correlation_ttl", &self.correlation_ttl)
            .field("clock_skew_before", &self.clock_skew_before)
            .field("clock_skew_after", &self.clock_skew_after)
            .field("encryption_required", &self.encryption_required)
            .field("check_bearer_ip", &self.check_bearer_ip)
            .field("expected_audience", &self.expected_audience)
            .field("signature_allow_list", &self.signature_allow_list)
            .field("require_signed_response", &self.require_signed_response)
            .field("require_signed_assertion", &self.require_signed_assertion)
            .field("check_revocation", &self.check_revocation)
            .field("soft_fail_revocation", &self.soft_fail_revocation)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl ExchangeConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// See [`ExchangeConfig::from_vars`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingEnvVar`] for a missing issuer or secret,
    /// [`ConfigError::InvalidValue`] for anything that does not parse or is
    /// out of range.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let token_issuer = required(vars, "LIGHT_TOKEN_ISSUER")?;
        let token_secret = SecretString::from(required(vars, "LIGHT_TOKEN_SECRET")?);

        let algorithm_name = vars
            .get("LIGHT_TOKEN_ALGORITHM")
            .map_or(DEFAULT_DIGEST_ALGORITHM, String::as_str);
        let token_algorithm =
            DigestAlgorithm::from_str(algorithm_name).map_err(|_| ConfigError::InvalidValue {
                name: "LIGHT_TOKEN_ALGORITHM".to_string(),
                reason: format!("unsupported digest algorithm '{algorithm_name}'"),
            })?;

        let correlation_ttl = seconds(vars, "CORRELATION_TTL_SECONDS", DEFAULT_CORRELATION_TTL_SECONDS, None)?;
        if correlation_ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "CORRELATION_TTL_SECONDS".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        let clock_skew_before = seconds(
            vars,
            "CLOCK_SKEW_BEFORE_SECONDS",
            DEFAULT_CLOCK_SKEW_SECONDS,
            Some(MAX_CLOCK_SKEW_SECONDS),
        )?;
        let clock_skew_after = seconds(
            vars,
            "CLOCK_SKEW_AFTER_SECONDS",
            DEFAULT_CLOCK_SKEW_SECONDS,
            Some(MAX_CLOCK_SKEW_SECONDS),
        )?;

        let signature_allow_list = match vars.get("SIGNATURE_ALGORITHM_ALLOW_LIST") {
            Some(value) => parse_allow_list(value)?,
            None => SignatureAlgorithm::default_allow_list(),
        };

        let expected_audience = vars
            .get("EXPECTED_AUDIENCE")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let redis_url = vars
            .get("REDIS_URL")
            .filter(|value| !value.trim().is_empty())
            .map(|value| SecretString::from(value.clone()));

        Ok(Self {
            token_issuer,
            token_secret,
            token_algorithm,
            correlation_ttl,
            clock_skew_before,
            clock_skew_after,
            encryption_required: flag(vars, "ENCRYPTION_REQUIRED", true)?,
            check_bearer_ip: flag(vars, "CHECK_BEARER_IP", true)?,
            expected_audience,
            signature_allow_list,
            require_signed_response: flag(vars, "REQUIRE_SIGNED_RESPONSE", true)?,
            require_signed_assertion: flag(vars, "REQUIRE_SIGNED_ASSERTION", false)?,
            check_revocation: flag(vars, "CHECK_REVOCATION", true)?,
            soft_fail_revocation: flag(vars, "SOFT_FAIL_REVOCATION", true)?,
            redis_url,
        })
    }

    /// Pipeline policy derived from this configuration.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            signature_allow_list: self.signature_allow_list.clone(),
            clock_skew_before: to_chrono(self.clock_skew_before),
            clock_skew_after: to_chrono(self.clock_skew_after),
            encryption_required: self.encryption_required,
            check_bearer_ip: self.check_bearer_ip,
            expected_audience: self.expected_audience.clone(),
            require_signed_response: self.require_signed_response,
            require_signed_assertion: self.require_signed_assertion,
            verifier_params: CertificateVerifierParams {
                check_revocation: self.check_revocation,
                soft_fail_revocation: self.soft_fail_revocation,
            },
        }
    }

    /// Redis when `REDIS_URL` is set, otherwise an in-process store.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::CorrelationBackend`] for an unusable Redis URL.
    pub fn open_correlation_store(
        &self,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<dyn CorrelationStore>, ExchangeError> {
        match &self.redis_url {
            Some(url) => Ok(Arc::new(RedisCorrelationStore::open(
                url.expose_secret(),
                DEFAULT_KEY_PREFIX,
            )?)),
            None => Ok(Arc::new(InMemoryCorrelationStore::with_clock(clock))),
        }
    }
}

fn required(vars: &HashMap<String, String>, name: &str) -> Result<String, ConfigError> {
    vars.get(name)
        .filter(|value| !value.trim().is_empty())
        .cloned()
        .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

fn flag(vars: &HashMap<String, String>, name: &str, default: bool) -> Result<bool, ConfigError> {
    match vars.get(name) {
        Some(value) => parse_bool(name, value),
        None => Ok(default),
    }
}

fn seconds(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
    max: Option<u64>,
) -> Result<Duration, ConfigError> {
    let Some(value_str) = vars.get(name) else {
        return Ok(Duration::from_secs(default));
    };

    let value: u64 = value_str.trim().parse().map_err(|e| ConfigError::InvalidValue {
        name: name.to_string(),
        reason: format!("must be a non-negative integer, got '{value_str}': {e}"),
    })?;

    if let Some(max) = max {
        if value > max {
            return Err(ConfigError::InvalidValue {
                name: name.to_string(),
                reason: format!("must not exceed {max} seconds, got {value}"),
            });
        }
    }

    Ok(Duration::from_secs(value))
}

fn parse_allow_list(value: &str) -> Result<Vec<SignatureAlgorithm>, ConfigError> {
    let algorithms = value
        .split(ALLOW_LIST_SEPARATOR)
        .map(str::trim)
        .filter(|uri| !uri.is_empty())
        .map(|uri| {
            SignatureAlgorithm::from_uri(uri).ok_or_else(|| ConfigError::InvalidValue {
                name: "SIGNATURE_ALGORITHM_ALLOW_LIST".to_string(),
                reason: format!("unknown signature algorithm '{uri}'"),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if algorithms.is_empty() {
        return Err(ConfigError::InvalidValue {
            name: "SIGNATURE_ALGORITHM_ALLOW_LIST".to_string(),
            reason: "must name at least one algorithm".to_string(),
        });
    }
    Ok(algorithms)
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
