//! LedgerStore contract.
//!
//! Durable, invariant-preserving storage for the four ledger entities plus
//! the reconciliation-layer operation records. The store is an explicit
//! handle injected into `StakeService` at construction; implementations:
//! [`PgLedgerStore`](super::pg::PgLedgerStore) for production and
//! [`MemoryLedgerStore`](super::memory::MemoryLedgerStore) for simulation
//! mode and tests.
//!
//! Multi-row mutations (`commit_refund`, `commit_settlement`) are atomic:
//! either every write persists or none does.

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use super::types::{
    NewOperation, NewTransfer, NewUser, OperationClaim, OperationId, Pool, Stake,
    StakeWithTransfers, Transfer, User,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user not found")]
    UserNotFound,

    #[error("stake not found")]
    StakeNotFound,

    #[error("user already has a HELD stake")]
    DuplicateActiveStake,

    #[error("stake is not HELD")]
    StakeNotHeld,

    /// Commit would push amount_refunded past amount_total. The service
    /// validates before committing; this is the store's own backstop.
    #[error("refund would exceed stake total")]
    BalanceExceeded,

    /// The stake row changed since it was read (optimistic-lock miss).
    #[error("stake version conflict")]
    VersionConflict,

    #[error("operation record not found")]
    OperationNotFound,

    /// The `(stake_id, idempotency_key)` slot belongs to a different
    /// operation kind. A key identifies exactly one logical operation.
    #[error("idempotency key already used for a different operation kind")]
    OperationKindMismatch,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Storage contract for the stake ledger.
///
/// Writes to `Stake.status`, `Stake.amount_refunded` and `Pool.amount_total`
/// go exclusively through `StakeService`; transfers are append-only.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // --- users ---

    async fn create_user(&self, user: NewUser) -> Result<User, StoreError>;
    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn list_users(&self) -> Result<Vec<User>, StoreError>;

    // --- stakes ---

    /// Insert a new HELD stake. Fails with [`StoreError::DuplicateActiveStake`]
    /// if the user already has one; the check and the insert are atomic.
    async fn create_stake(&self, user_id: Uuid, amount_total: Decimal) -> Result<Stake, StoreError>;

    async fn get_stake(&self, id: Uuid) -> Result<Option<Stake>, StoreError>;

    /// Stakes for a user, newest first, each with its transfers (newest first).
    async fn stakes_for_user(&self, user_id: Uuid) -> Result<Vec<StakeWithTransfers>, StoreError>;

    // --- transfers ---

    async fn transfers_for_user(&self, user_id: Uuid) -> Result<Vec<Transfer>, StoreError>;
    async fn get_transfer(&self, id: Uuid) -> Result<Option<Transfer>, StoreError>;

    // --- settlement-critical atomic commits ---

    /// Record a completed refund: insert the transfer row and bump
    /// `amount_refunded` in one transaction, guarded by `expected_version`.
    async fn commit_refund(
        &self,
        stake_id: Uuid,
        expected_version: i64,
        transfer: NewTransfer,
    ) -> Result<(Transfer, Stake), StoreError>;

    /// Record a completed pool sweep: insert the transfer row, close the
    /// stake, and credit the pool in one transaction, guarded by
    /// `expected_version`. The pool row is created lazily if absent.
    async fn commit_settlement(
        &self,
        stake_id: Uuid,
        expected_version: i64,
        transfer: NewTransfer,
    ) -> Result<(Transfer, Stake, Pool), StoreError>;

    /// Close a fully-refunded stake with no transfer and no pool credit.
    async fn close_stake(&self, stake_id: Uuid, expected_version: i64)
    -> Result<Stake, StoreError>;

    // --- pool ---

    async fn get_pool(&self) -> Result<Option<Pool>, StoreError>;

    // --- reconciliation / idempotency ---

    /// Claim the `(stake_id, idempotency_key)` slot before the external call.
    ///
    /// Exactly one of: inserts a fresh PENDING record; re-arms an existing
    /// FAILED record; or reports the existing PENDING/SUCCEEDED record.
    /// A slot recorded for a different [`OperationKind`](super::types::OperationKind)
    /// is rejected with [`StoreError::OperationKindMismatch`] without mutation.
    async fn claim_operation(&self, op: NewOperation) -> Result<OperationClaim, StoreError>;

    /// Mark an operation SUCCEEDED and link the transfer it produced.
    async fn complete_operation(
        &self,
        id: &OperationId,
        transfer_id: Uuid,
    ) -> Result<(), StoreError>;

    /// Mark an operation FAILED (definitive failure - safe to retry later).
    async fn fail_operation(&self, id: &OperationId, error: &str) -> Result<(), StoreError>;
}
