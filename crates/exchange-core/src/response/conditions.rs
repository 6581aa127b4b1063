//! Assertion checks that run after signatures: validity window, audience,
//! bearer subject confirmation and the attribute statement.

use crate::errors::ExchangeError;
use crate::xml::{ns, Element};
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

pub const BEARER_METHOD: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";

/// Validity window check with clock-skew allowances.
///
/// Valid when `now + before_skew >= not_before` and
/// `now - after_skew <= not_on_or_after`.
///
/// # Errors
///
/// [`ExchangeError::TokenNotYetValid`] or [`ExchangeError::TokenExpired`].
pub fn check_time_window(
    now: DateTime<Utc>,
    not_before: DateTime<Utc>,
    not_on_or_after: DateTime<Utc>,
    before_skew: Duration,
    after_skew: Duration,
) -> Result<(), ExchangeError> {
    let earliest = now
        .checked_add_signed(before_skew)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    if earliest < not_before {
        debug!(target: "exchange.response", %not_before, "Assertion not yet valid");
        return Err(ExchangeError::TokenNotYetValid);
    }

    let latest = now
        .checked_sub_signed(after_skew)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    if latest > not_on_or_after {
        debug!(target: "exchange.response", %not_on_or_after, "Assertion expired");
        return Err(ExchangeError::TokenExpired);
    }

    Ok(())
}

/// Read `Conditions/@NotBefore` and `@NotOnOrAfter` and check them.
/// Both bounds are mandatory.
pub(crate) fn verify_time_window(
    assertion: &Element,
    now: DateTime<Utc>,
    before_skew: Duration,
    after_skew: Duration,
) -> Result<(DateTime<Utc>, DateTime<Utc>), ExchangeError> {
    let conditions = assertion
        .first_child(ns::SAML, "Conditions")
        .ok_or(ExchangeError::MalformedConditions)?;
    let not_before = parse_instant(conditions.attribute("NotBefore"))?;
    let not_on_or_after = parse_instant(conditions.attribute("NotOnOrAfter"))?;

    check_time_window(now, not_before, not_on_or_after, before_skew, after_skew)?;
    Ok((not_before, not_on_or_after))
}

fn parse_instant(value: Option<&str>) -> Result<DateTime<Utc>, ExchangeError> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v.trim()).ok())
        .map(|instant| instant.with_timezone(&Utc))
        .ok_or(ExchangeError::MalformedConditions)
}

/// The first `AudienceRestriction` must list `expected`.
pub(crate) fn verify_audience(assertion: &Element, expected: &str) -> Result<(), ExchangeError> {
    let matched = assertion
        .first_child(ns::SAML, "Conditions")
        .and_then(|conditions| conditions.first_child(ns::SAML, "AudienceRestriction"))
        .is_some_and(|restriction| {
            restriction
                .children_named(ns::SAML, "Audience")
                .any(|audience| audience.text().trim() == expected)
        });

    if matched {
        Ok(())
    } else {
        debug!(target: "exchange.response", "Audience restriction does not name this service");
        Err(ExchangeError::AudienceRestrictionMismatch)
    }
}

/// Every subject confirmation must carry the caller's address; bearer
/// confirmations additionally require both sides to be present.
pub(crate) fn verify_bearer_ip(
    assertion: &Element,
    bearer_ip: Option<&str>,
) -> Result<(), ExchangeError> {
    let mismatch = |reason: &'static str| {
        debug!(target: "exchange.response", reason, "Subject confirmation rejected");
        ExchangeError::SubjectConfirmationMismatch
    };

    let subject = assertion
        .first_child(ns::SAML, "Subject")
        .ok_or_else(|| mismatch("missing Subject"))?;
    let confirmations: Vec<&Element> = subject
        .children_named(ns::SAML, "SubjectConfirmation")
        .collect();
    if confirmations.is_empty() {
        return Err(mismatch("no SubjectConfirmation"));
    }

    let user_ip = bearer_ip.map(str::trim).filter(|ip| !ip.is_empty());

    for confirmation in confirmations {
        let data = confirmation
            .first_child(ns::SAML, "SubjectConfirmationData")
            .ok_or_else(|| mismatch("missing SubjectConfirmationData"))?;
        let address = data
            .attribute("Address")
            .map(str::trim)
            .filter(|address| !address.is_empty());

        let is_bearer = confirmation.attribute("Method").map(str::trim) == Some(BEARER_METHOD);
        if is_bearer && (user_ip.is_none() || address.is_none()) {
            return Err(mismatch("bearer confirmation without address"));
        }
        if address != user_ip {
            return Err(mismatch("address differs from caller"));
        }
    }

    Ok(())
}

/// The one `AttributeStatement` of the assertion.
pub(crate) fn single_attribute_statement(assertion: &Element) -> Result<&Element, ExchangeError> {
    let mut statements = assertion.children_named(ns::SAML, "AttributeStatement");
    match (statements.next(), statements.next()) {
        (Some(statement), None) => Ok(statement),
        _ => {
            debug!(target: "exchange.response", "Assertion does not have exactly one attribute statement");
            Err(ExchangeError::MissingAttributeStatement)
        }
    }
}
