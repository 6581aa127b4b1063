//! Values extracted from a validated response.

use crate::errors::ExchangeError;
use crate::xml::{ns, Element};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";

/// Top-level `samlp:Status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStatus {
    code: String,
    sub_code: Option<String>,
    message: Option<String>,
}

impl ResponseStatus {
    pub(crate) fn from_response(response: &Element) -> Result<Self, ExchangeError> {
        let status = response
            .first_child(ns::SAMLP, "Status")
            .ok_or(ExchangeError::MalformedResponse)?;
        let status_code = status
            .first_child(ns::SAMLP, "StatusCode")
            .ok_or(ExchangeError::MalformedResponse)?;
        let code = status_code
            .attribute("Value")
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(ExchangeError::MalformedResponse)?;

        Ok(Self {
            code: code.to_string(),
            sub_code: status_code
                .first_child(ns::SAMLP, "StatusCode")
                .and_then(|sub| sub.attribute("Value"))
                .map(|value| value.trim().to_string()),
            message: status
                .first_child(ns::SAMLP, "StatusMessage")
                .map(|message| message.text().trim().to_string()),
        })
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn sub_code(&self) -> Option<&str> {
        self.sub_code.as_deref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn is_success(&self) -> bool {
        self.code == STATUS_SUCCESS
    }
}

/// One `saml:Attribute` and its values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionAttribute {
    name: String,
    friendly_name: Option<String>,
    name_format: Option<String>,
    values: Vec<String>,
}

impl AssertionAttribute {
    fn from_element(attribute: &Element) -> Result<Self, ExchangeError> {
        let name = attribute
            .attribute("Name")
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or(ExchangeError::MalformedResponse)?;

        Ok(Self {
            name: name.to_string(),
            friendly_name: attribute.attribute("FriendlyName").map(str::to_string),
            name_format: attribute.attribute("NameFormat").map(str::to_string),
            values: attribute
                .children_named(ns::SAML, "AttributeValue")
                .map(|value| value.text().trim().to_string())
                .collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn friendly_name(&self) -> Option<&str> {
        self.friendly_name.as_deref()
    }

    pub fn name_format(&self) -> Option<&str> {
        self.name_format.as_deref()
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }
}

/// The single assertion that survived every pipeline check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedAssertion {
    id: String,
    issuer: String,
    subject_name_id: Option<String>,
    subject_name_id_format: Option<String>,
    not_before: DateTime<Utc>,
    not_on_or_after: DateTime<Utc>,
    audiences: Vec<String>,
    level_of_assurance: Option<String>,
    attributes: Vec<AssertionAttribute>,
}

impl ValidatedAssertion {
    pub(crate) fn extract(
        assertion: &Element,
        attribute_statement: &Element,
        not_before: DateTime<Utc>,
        not_on_or_after: DateTime<Utc>,
    ) -> Result<Self, ExchangeError> {
        let id = assertion.id().ok_or(ExchangeError::MalformedResponse)?;
        let issuer = assertion
            .first_child(ns::SAML, "Issuer")
            .map(|issuer| issuer.text().trim().to_string())
            .filter(|issuer| !issuer.is_empty())
            .ok_or(ExchangeError::MalformedResponse)?;

        let name_id = assertion
            .first_child(ns::SAML, "Subject")
            .and_then(|subject| subject.first_child(ns::SAML, "NameID"));

        let audiences: Vec<String> = assertion
            .first_child(ns::SAML, "Conditions")
            .map(|conditions| {
                conditions
                    .children_named(ns::SAML, "AudienceRestriction")
                    .flat_map(|restriction| restriction.children_named(ns::SAML, "Audience"))
                    .map(|audience| audience.text().trim().to_string())
                    .collect()
            })
            .unwrap_or_default();

        let level_of_assurance = assertion
            .first_child(ns::SAML, "AuthnStatement")
            .and_then(|statement| statement.first_child(ns::SAML, "AuthnContext"))
            .and_then(|context| context.first_child(ns::SAML, "AuthnContextClassRef"))
            .map(|class_ref| class_ref.text().trim().to_string());

        let attributes = attribute_statement
            .children_named(ns::SAML, "Attribute")
            .map(AssertionAttribute::from_element)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id: id.to_string(),
            issuer,
            subject_name_id: name_id.map(|name_id| name_id.text().trim().to_string()),
            subject_name_id_format: name_id
                .and_then(|name_id| name_id.attribute("Format"))
                .map(str::to_string),
            not_before,
            not_on_or_after,
            audiences,
            level_of_assurance,
            attributes,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn subject_name_id(&self) -> Option<&str> {
        self.subject_name_id.as_deref()
    }

    pub fn subject_name_id_format(&self) -> Option<&str> {
        self.subject_name_id_format.as_deref()
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_on_or_after(&self) -> DateTime<Utc> {
        self.not_on_or_after
    }

    pub fn audiences(&self) -> &[String] {
        &self.audiences
    }

    pub fn level_of_assurance(&self) -> Option<&str> {
        self.level_of_assurance.as_deref()
    }

    pub fn attributes(&self) -> &[AssertionAttribute] {
        &self.attributes
    }

    /// First attribute with the given `Name`.
    pub fn attribute(&self, name: &str) -> Option<&AssertionAttribute> {
        self.attributes.iter().find(|attribute| attribute.name == name)
    }
}

/// A response that passed the security pipeline.
///
/// `assertion` is `None` exactly when the status is not success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationResponse {
    id: String,
    in_response_to: Option<String>,
    issuer: Option<String>,
    destination: Option<String>,
    status: ResponseStatus,
    assertion: Option<ValidatedAssertion>,
    encrypted: bool,
}

impl AuthenticationResponse {
    pub(crate) fn new(
        response: &Element,
        status: ResponseStatus,
        assertion: Option<ValidatedAssertion>,
        encrypted: bool,
    ) -> Result<Self, ExchangeError> {
        let id = response.id().ok_or(ExchangeError::MalformedResponse)?;

        Ok(Self {
            id: id.to_string(),
            in_response_to: response.attribute("InResponseTo").map(str::to_string),
            issuer: response
                .first_child(ns::SAML, "Issuer")
                .map(|issuer| issuer.text().trim().to_string()),
            destination: response.attribute("Destination").map(str::to_string),
            status,
            assertion,
            encrypted,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn in_response_to(&self) -> Option<&str> {
        self.in_response_to.as_deref()
    }

    pub fn issuer(&self) -> Option<&str> {
        self.issuer.as_deref()
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn status(&self) -> &ResponseStatus {
        &self.status
    }

    pub fn assertion(&self) -> Option<&ValidatedAssertion> {
        self.assertion.as_ref()
    }

    /// Whether the assertion arrived encrypted.
    pub fn was_encrypted(&self) -> bool {
        self.encrypted
    }
}
