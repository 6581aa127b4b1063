//! Test utilities for the authentication exchange core.
//!
//! - [`pki`]: root / intermediate / leaf hierarchy with CRLs, generated per test
//! - [`crypto_fixtures`]: signing and decryption key material
//! - [`response_builder`]: signed and optionally encrypted SAML responses
//! - [`assertions`]: error-kind assertions on exchange results
//! - [`test_ids`]: fixed identifiers and addresses

pub mod assertions;
pub mod crypto_fixtures;
pub mod pki;
pub mod response_builder;
pub mod test_ids;

pub use assertions::*;
pub use crypto_fixtures::*;
pub use pki::*;
pub use response_builder::*;
pub use test_ids::*;
