//! Authentication exchange core.
//!
//! Correlates an outgoing authentication request with the signed, usually
//! encrypted response that comes back from a remote identity provider, and
//! only releases the response once its token, signatures, certificates and
//! conditions all check out.
//!
//! # Components
//!
//! - [`light_token`]: compact, keyed-digest token carried through the user
//!   agent
//! - [`correlation`]: single-use, TTL-bounded store of pending requests
//! - [`trust`]: certificate path building and revocation checking
//! - [`response`]: decryption, signature verification and assertion checks
//! - [`exchange`]: `begin` / `complete` orchestration over the above
//!
//! Everything is synchronous and safe to share between threads; the host
//! brings its own concurrency. Time always comes from an injected
//! [`common::clock::Clock`].

pub mod config;
pub mod correlation;
pub mod errors;
pub mod exchange;
pub mod light_token;
pub mod observability;
pub mod request;
pub mod response;
pub mod trust;
pub mod xml;

pub use errors::ExchangeError;

/// One-time process setup. Call once at startup, before the first
/// exchange; repeated calls are harmless.
pub fn initialize() {
    openssl::init();
}
