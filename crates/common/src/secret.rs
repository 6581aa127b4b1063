//! Secret types for protecting sensitive values from accidental logging.
//!
//! Light token secrets, Redis credentials and private key passphrases are
//! carried as [`SecretString`]. Its `Debug` implementation is redacted, so
//! config structs that derive `Debug` are safe to log, and the value is
//! zeroized on drop.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct TokenSettings {
//!     issuer: String,
//!     secret: SecretString,
//! }
//!
//! let settings = TokenSettings {
//!     issuer: "connector".to_string(),
//!     secret: SecretString::from("s3cr3t"),
//! };
//!
//! assert!(!format!("{settings:?}").contains("s3cr3t"));
//! assert_eq!(settings.secret.expose_secret(), "s3cr3t");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
