//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// Threshold pair does not form a hysteresis band.
    #[error("Invalid thresholds: running={running}, idle={idle} (expected 0 <= idle < running)")]
    InvalidThresholds { running: f32, idle: f32 },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
