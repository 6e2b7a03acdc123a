//! Error type shared by the ledger service, stores and coupon pools.

use pledgebank_core::DomainError;

use crate::jobs::JobStoreError;

/// Failure of a ledger/coupon operation.
///
/// Domain errors pass through unchanged so callers can match on
/// `AlreadyRefunded`, `Exhausted` and friends; everything else is storage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            EngineError::Domain(e) => Some(e),
            EngineError::Storage(_) => None,
        }
    }

    pub fn is_already_refunded(&self) -> bool {
        self.domain().is_some_and(DomainError::is_already_refunded)
    }

    pub fn is_exhausted(&self) -> bool {
        self.domain().is_some_and(DomainError::is_exhausted)
    }
}

impl From<JobStoreError> for EngineError {
    fn from(err: JobStoreError) -> Self {
        EngineError::Storage(err.to_string())
    }
}

/// Map a poisoned lock to a storage error.
pub(crate) fn poisoned<T>(_: T) -> EngineError {
    EngineError::storage("lock poisoned")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_display_transparently() {
        let err: EngineError = DomainError::exhausted("LAUNCH").into();
        assert!(err.is_exhausted());
        assert_eq!(err.to_string(), "no unallocated code left for coupon 'LAUNCH'");
    }
}
