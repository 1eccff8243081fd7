//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic business failures (validation,
/// inventory shortfalls, illegal state transitions). Storage and transport
/// concerns belong to the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. non-positive dose volume).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A reservation exceeds a vial's remaining volume.
    #[error("insufficient volume: {0}")]
    InsufficientVolume(String),

    /// No single vial can satisfy the requested reservation.
    #[error("no eligible vial: {0}")]
    NoEligibleVial(String),

    /// A requested record was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// An operation was attempted against a record in the wrong lifecycle
    /// state; the message names the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A version check failed (stale record / concurrent writer).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn insufficient_volume(msg: impl Into<String>) -> Self {
        Self::InsufficientVolume(msg.into())
    }

    pub fn no_eligible_vial(msg: impl Into<String>) -> Self {
        Self::NoEligibleVial(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}
