//! Custom test assertions for expressive tests
//!
//! Provides trait-based assertions for pipeline and exchange results.

use exchange_core::exchange::AuthenticationExchange;
use exchange_core::response::{AuthenticationResponse, ValidatedAssertion};
use exchange_core::ExchangeError;

/// Assertions on `Result<_, ExchangeError>`
///
/// # Example
/// ```rust,ignore
/// pipeline
///     .process(xml.as_bytes(), &context)
///     .assert_rejected_with(ExchangeError::InvalidSignature);
/// ```
pub trait ExchangeResultAssertions<T> {
    /// Assert the result is `Ok` and return the value
    fn assert_accepted(self) -> T;

    /// Assert the result failed with exactly `expected`
    fn assert_rejected_with(self, expected: ExchangeError);
}

impl<T: std::fmt::Debug> ExchangeResultAssertions<T> for Result<T, ExchangeError> {
    fn assert_accepted(self) -> T {
        match self {
            Ok(value) => value,
            Err(e) => panic!("Expected success, got {} ({e})", e.kind()),
        }
    }

    fn assert_rejected_with(self, expected: ExchangeError) {
        match self {
            Ok(value) => panic!("Expected {}, got success: {value:?}", expected.kind()),
            Err(actual) => assert_eq!(
                actual.kind(),
                expected.kind(),
                "Expected {}, got {}",
                expected.kind(),
                actual.kind()
            ),
        }
    }
}

/// Assertions on an accepted response
pub trait ResponseAssertions {
    /// Assert the status is success and return the assertion
    fn assert_has_assertion(&self) -> &ValidatedAssertion;

    /// Assert the response answers `request_id`
    fn assert_answers(&self, request_id: &str) -> &Self;
}

impl ResponseAssertions for AuthenticationResponse {
    fn assert_has_assertion(&self) -> &ValidatedAssertion {
        assert!(
            self.status().is_success(),
            "Expected success status, got {}",
            self.status().code()
        );
        self.assertion()
            .expect("Successful response must carry a validated assertion")
    }

    fn assert_answers(&self, request_id: &str) -> &Self {
        assert_eq!(
            self.in_response_to(),
            Some(request_id),
            "Response answers a different request"
        );
        self
    }
}

impl ResponseAssertions for AuthenticationExchange {
    fn assert_has_assertion(&self) -> &ValidatedAssertion {
        self.response().assert_has_assertion()
    }

    fn assert_answers(&self, request_id: &str) -> &Self {
        self.response().assert_answers(request_id);
        assert_eq!(
            self.stored_request().request().id(),
            request_id,
            "Exchange consumed a different request"
        );
        self
    }
}
