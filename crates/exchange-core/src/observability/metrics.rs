//! Metrics definitions for the exchange core.
//!
//! All metrics follow Prometheus naming conventions:
//! - `exchange_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `operation`: fixed per call site (encode, decode, put, get_and_remove, sweep)
//! - `status`: 2 values (success, error)
//! - `outcome`: fixed per call site (stored, hit, miss, expired, error)
//! - `error_kind`: bounded by `ExchangeError::kind()`

use metrics::{counter, histogram};
use std::time::Duration;

// ============================================================================
// Light Token Metrics
// ============================================================================

/// Record a light token encode or decode.
///
/// Metric: `exchange_token_operations_total`
/// Labels: `operation`, `status`
pub fn record_token_operation(operation: &'static str, status: &'static str) {
    counter!("exchange_token_operations_total", "operation" => operation, "status" => status)
        .increment(1);
}

// ============================================================================
// Correlation Metrics
// ============================================================================

/// Record a correlation store operation.
///
/// Metric: `exchange_correlation_operations_total`
/// Labels: `operation`, `outcome`
pub fn record_correlation_operation(operation: &'static str, outcome: &'static str) {
    counter!("exchange_correlation_operations_total", "operation" => operation, "outcome" => outcome)
        .increment(1);
}

// ============================================================================
// Trust Metrics
// ============================================================================

/// Record a certificate trust verification.
///
/// Metric: `exchange_trust_verifications_total`
/// Labels: `status`, `error_kind`
pub fn record_trust_verification(status: &'static str, error_kind: Option<&'static str>) {
    counter!("exchange_trust_verifications_total", "status" => status, "error_kind" => error_kind.unwrap_or("none"))
        .increment(1);
}

/// Record revocation data that was missing but tolerated.
///
/// Metric: `exchange_revocation_soft_failures_total`
pub fn record_revocation_soft_failure() {
    counter!("exchange_revocation_soft_failures_total").increment(1);
}

// ============================================================================
// Response Pipeline Metrics
// ============================================================================

/// Record a response security pipeline run.
///
/// Metric: `exchange_response_validations_total`
/// Labels: `status`, `error_kind`
pub fn record_response_validation(status: &'static str, error_kind: Option<&'static str>) {
    counter!("exchange_response_validations_total", "status" => status, "error_kind" => error_kind.unwrap_or("none"))
        .increment(1);
}

// ============================================================================
// Orchestrator Metrics
// ============================================================================

/// Record an exchange completion attempt.
///
/// Metric: `exchange_completions_total`, `exchange_completion_duration_seconds`
/// Labels: `status`, `error_kind`
pub fn record_completion(status: &'static str, error_kind: Option<&'static str>, duration: Duration) {
    histogram!("exchange_completion_duration_seconds", "status" => status)
        .record(duration.as_secs_f64());

    counter!("exchange_completions_total", "status" => status, "error_kind" => error_kind.unwrap_or("none"))
        .increment(1);
}
