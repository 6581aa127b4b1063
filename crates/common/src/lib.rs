//! Common utilities shared by the authentication exchange crates.

#![warn(clippy::pedantic)]

/// Module for injectable time sources
pub mod clock;

/// Module for common configuration
pub mod config;

/// Module for tracing subscriber setup
pub mod observability;

/// Module for secret types that prevent accidental logging
pub mod secret;
