//! Stake ledger error taxonomy.
//!
//! Domain failures are explicit variants rather than stringly-typed messages
//! so callers can tell retryable failures from terminal ones. The transport
//! layer maps `kind()` into HTTP status codes and error payloads.

use thiserror::Error;

use super::store::StoreError;

#[derive(Debug, Error)]
pub enum StakeError {
    #[error("user not found")]
    UserNotFound,

    #[error("stake not found")]
    StakeNotFound,

    #[error("user already has an active stake")]
    DuplicateActiveStake,

    #[error("stake is not active")]
    StakeNotActive,

    #[error("stake already closed")]
    StakeAlreadyClosed,

    #[error("insufficient stake balance")]
    InsufficientBalance,

    #[error("nothing to settle: stake is fully refunded")]
    NothingToSettle,

    /// The external call definitively failed: funds did not move, no local
    /// state was touched. Safe to retry.
    #[error("fund transfer failed: {0}")]
    FundTransferFailed(String),

    /// The external call's result is unknown (timeout / network partition).
    /// NOT safe to blindly retry - reconcile against the payment network's
    /// records first.
    #[error("fund transfer outcome unknown: {0}")]
    AmbiguousTransferOutcome(String),

    /// Optimistic-lock retries exhausted.
    #[error("stake was modified concurrently")]
    ConcurrentModification,

    #[error("amount must be positive")]
    InvalidAmount,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("ledger store error: {0}")]
    Store(StoreError),
}

impl StakeError {
    /// Stable machine-readable kind, preserved in API error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            StakeError::UserNotFound => "USER_NOT_FOUND",
            StakeError::StakeNotFound => "STAKE_NOT_FOUND",
            StakeError::DuplicateActiveStake => "DUPLICATE_ACTIVE_STAKE",
            StakeError::StakeNotActive => "STAKE_NOT_ACTIVE",
            StakeError::StakeAlreadyClosed => "STAKE_ALREADY_CLOSED",
            StakeError::InsufficientBalance => "INSUFFICIENT_BALANCE",
            StakeError::NothingToSettle => "NOTHING_TO_SETTLE",
            StakeError::FundTransferFailed(_) => "FUND_TRANSFER_FAILED",
            StakeError::AmbiguousTransferOutcome(_) => "AMBIGUOUS_TRANSFER_OUTCOME",
            StakeError::ConcurrentModification => "CONCURRENT_MODIFICATION",
            StakeError::InvalidAmount => "INVALID_AMOUNT",
            StakeError::InvalidRequest(_) => "INVALID_REQUEST",
            StakeError::Store(_) => "STORE_ERROR",
        }
    }

    /// True when retrying the same request cannot double-move funds.
    pub fn is_safe_to_retry(&self) -> bool {
        !matches!(self, StakeError::AmbiguousTransferOutcome(_))
    }
}

impl From<StoreError> for StakeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UserNotFound => StakeError::UserNotFound,
            StoreError::StakeNotFound => StakeError::StakeNotFound,
            StoreError::DuplicateActiveStake => StakeError::DuplicateActiveStake,
            StoreError::StakeNotHeld => StakeError::StakeNotActive,
            StoreError::BalanceExceeded => StakeError::InsufficientBalance,
            StoreError::VersionConflict => StakeError::ConcurrentModification,
            StoreError::OperationKindMismatch => StakeError::InvalidRequest(
                "idempotency key already used for a different operation".to_string(),
            ),
            other => StakeError::Store(other),
        }
    }
}
