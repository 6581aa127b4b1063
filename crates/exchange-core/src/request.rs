//! Outgoing authentication request and its stored form.

use crate::errors::ExchangeError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The request sent toward the remote authority.
///
/// The core only needs `id` (the correlation key) and `issuer`; the other
/// fields travel along so the completed exchange can be interpreted
/// without another lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationRequest {
    id: String,
    issuer: String,
    destination: Option<String>,
    citizen_country_code: Option<String>,
    level_of_assurance: Option<String>,
    requested_attributes: Vec<String>,
}

impl AuthenticationRequest {
    /// # Errors
    ///
    /// [`ExchangeError::InvalidRequest`] if `id` or `issuer` is blank.
    pub fn new(id: impl Into<String>, issuer: impl Into<String>) -> Result<Self, ExchangeError> {
        let id = id.into().trim().to_string();
        let issuer = issuer.into().trim().to_string();

        if id.is_empty() || issuer.is_empty() {
            debug!(target: "exchange.correlation", "Authentication request rejected: blank id or issuer");
            return Err(ExchangeError::InvalidRequest);
        }

        Ok(Self {
            id,
            issuer,
            destination: None,
            citizen_country_code: None,
            level_of_assurance: None,
            requested_attributes: Vec::new(),
        })
    }

    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    #[must_use]
    pub fn with_citizen_country_code(mut self, code: impl Into<String>) -> Self {
        self.citizen_country_code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_level_of_assurance(mut self, loa: impl Into<String>) -> Self {
        self.level_of_assurance = Some(loa.into());
        self
    }

    #[must_use]
    pub fn with_requested_attribute(mut self, name: impl Into<String>) -> Self {
        self.requested_attributes.push(name.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn citizen_country_code(&self) -> Option<&str> {
        self.citizen_country_code.as_deref()
    }

    pub fn level_of_assurance(&self) -> Option<&str> {
        self.level_of_assurance.as_deref()
    }

    pub fn requested_attributes(&self) -> &[String] {
        &self.requested_attributes
    }
}

/// A request parked in the correlation store while the user agent is away.
///
/// Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAuthenticationRequest {
    request: AuthenticationRequest,
    relay_state: Option<String>,
    remote_ip_address: String,
}

impl StoredAuthenticationRequest {
    /// # Errors
    ///
    /// [`ExchangeError::InvalidRequest`] if `remote_ip_address` is blank.
    pub fn new(
        request: AuthenticationRequest,
        relay_state: Option<String>,
        remote_ip_address: impl Into<String>,
    ) -> Result<Self, ExchangeError> {
        let remote_ip_address = remote_ip_address.into().trim().to_string();
        if remote_ip_address.is_empty() {
            debug!(target: "exchange.correlation", "Stored request rejected: blank remote address");
            return Err(ExchangeError::InvalidRequest);
        }

        Ok(Self {
            request,
            relay_state,
            remote_ip_address,
        })
    }

    pub fn request(&self) -> &AuthenticationRequest {
        &self.request
    }

    pub fn relay_state(&self) -> Option<&str> {
        self.relay_state.as_deref()
    }

    pub fn remote_ip_address(&self) -> &str {
        &self.remote_ip_address
    }
}
