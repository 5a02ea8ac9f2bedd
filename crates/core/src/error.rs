//! Errors raised when building domain values.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Rejected input for a project, resource row or identifier.
///
/// Storage failures are not represented here; the infra crate wraps this
/// type when a write is refused before reaching the backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("{0} cannot be empty")]
    EmptyField(&'static str),

    #[error("{field} for '{resource}' cannot be negative (got {value})")]
    NegativeAmount {
        resource: String,
        field: &'static str,
        value: i64,
    },

    #[error("invalid facility id '{input}': {reason}")]
    InvalidFacilityId { input: String, reason: String },
}
