//! Fixed identifiers for deterministic tests
//!
//! Request and response ids are NCName-safe (leading underscore) so they can
//! be used directly as SAML `ID` values.

use uuid::Uuid;

// Request ids
pub const TEST_REQUEST_ID_1: &str = "_req-0001";
pub const TEST_REQUEST_ID_2: &str = "_req-0002";

// Response and assertion ids
pub const TEST_RESPONSE_ID: &str = "_resp-0001";
pub const TEST_ASSERTION_ID: &str = "_assert-0001";

// Parties
pub const TEST_CONNECTOR_ISSUER: &str = "https://connector.example/metadata";
pub const TEST_IDP_ISSUER: &str = "https://proxy.example/metadata";
pub const TEST_AUDIENCE: &str = "https://connector.example/metadata";
pub const TEST_DESTINATION: &str = "https://connector.example/response";

// Token issuer and shared secret
pub const TEST_TOKEN_ISSUER: &str = "connector";
pub const TEST_TOKEN_SECRET: &str = "test-secret-do-not-use-in-production";

// Caller addresses
pub const TEST_USER_IP: &str = "1.2.3.4";
pub const TEST_OTHER_IP: &str = "5.6.7.8";

// Relay state
pub const TEST_RELAY_STATE: &str = "abc";

// Subject
pub const TEST_SUBJECT_NAME_ID: &str = "CA/CB/12345";
pub const TEST_LEVEL_OF_ASSURANCE: &str = "http://eidas.europa.eu/LoA/substantial";

/// A fresh NCName-safe id for tests that need many distinct requests.
pub fn unique_id(prefix: &str) -> String {
    format!("_{prefix}-{}", Uuid::new_v4().simple())
}
