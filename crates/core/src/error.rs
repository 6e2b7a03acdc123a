//! Domain error model.

use thiserror::Error;

use crate::id::MovementId;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, exhaustion, collaborator refusals). Infrastructure concerns belong
/// elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (missing reference, bad quantity, duplicate key).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// The movement already carries a compensating refund movement.
    #[error("movement {movement} already refunded by {refund}")]
    AlreadyRefunded {
        movement: MovementId,
        refund: MovementId,
    },

    /// No unallocated code remains for the coupon.
    #[error("no unallocated code left for coupon '{coupon}'")]
    Exhausted { coupon: String },

    /// An external collaborator (e.g. the payment gateway) refused the request.
    #[error("collaborator failure: {0}")]
    Collaborator(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// A conflict occurred (e.g. stale version / optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn exhausted(coupon: impl Into<String>) -> Self {
        Self::Exhausted {
            coupon: coupon.into(),
        }
    }

    pub fn collaborator(msg: impl Into<String>) -> Self {
        Self::Collaborator(msg.into())
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

    /// True for the refund double-spend guard.
    pub fn is_already_refunded(&self) -> bool {
        matches!(self, Self::AlreadyRefunded { .. })
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_refunded_names_both_movements() {
        let movement = MovementId::new();
        let refund = MovementId::new();
        let err = DomainError::AlreadyRefunded { movement, refund };

        let msg = err.to_string();
        assert!(msg.contains(&movement.to_string()));
        assert!(msg.contains(&refund.to_string()));
        assert!(err.is_already_refunded());
        assert!(!err.is_exhausted());
    }

    #[test]
    fn exhausted_mentions_campaign() {
        let err = DomainError::exhausted("LAUNCH");
        assert_eq!(err.to_string(), "no unallocated code left for coupon 'LAUNCH'");
        assert!(err.is_exhausted());
    }
}
