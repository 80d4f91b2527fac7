//! In-memory LedgerStore.
//!
//! Same semantics as the PostgreSQL store, backed by plain maps behind one
//! async mutex (every call holds the lock for its full duration, so each
//! store call is trivially atomic). Used in simulation mode when no
//! `postgres_url` is configured, and by the test suite.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::store::{LedgerStore, StoreError};
use super::types::{
    NewOperation, NewTransfer, NewUser, OperationClaim, OperationId, OperationRecord,
    OperationState, Pool, Stake, StakeStatus, StakeWithTransfers, Transfer, User,
};

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    stakes: HashMap<Uuid, Stake>,
    /// Append-only, oldest first.
    transfers: Vec<Transfer>,
    pool: Option<Pool>,
    /// Keyed by operation id string.
    operations: HashMap<String, OperationRecord>,
    /// (stake_id, idempotency_key) -> operation id.
    operation_keys: HashMap<(Uuid, String), String>,
}

pub struct MemoryLedgerStore {
    inner: Mutex<Inner>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

fn append_transfer(inner: &mut Inner, new: NewTransfer) -> Transfer {
    let transfer = Transfer {
        id: Uuid::new_v4(),
        user_id: new.user_id,
        stake_id: new.stake_id,
        direction: new.direction,
        amount: new.amount,
        visa_status: new.visa_status,
        visa_transfer_id: new.visa_transfer_id,
        metadata: new.metadata,
        created_at: Utc::now(),
    };
    inner.transfers.push(transfer.clone());
    transfer
}

/// Shared HELD/version guard for the three stake mutations.
fn check_mutable(stake: &Stake, expected_version: i64) -> Result<(), StoreError> {
    if stake.status != StakeStatus::Held {
        return Err(StoreError::StakeNotHeld);
    }
    if stake.version != expected_version {
        return Err(StoreError::VersionConflict);
    }
    Ok(())
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn create_user(&self, user: NewUser) -> Result<User, StoreError> {
        let mut inner = self.inner.lock().await;
        let record = User {
            id: Uuid::new_v4(),
            name: user.name,
            pan_masked: user.pan_masked,
            card_last4: user.card_last4,
            created_at: Utc::now(),
        };
        inner.users.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.users.get(&id).cloned())
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let inner = self.inner.lock().await;
        let mut users: Vec<User> = inner.users.values().cloned().collect();
        users.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(users)
    }

    async fn create_stake(&self, user_id: Uuid, amount_total: Decimal) -> Result<Stake, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.users.contains_key(&user_id) {
            return Err(StoreError::UserNotFound);
        }
        // Serialized check-then-insert: the lock makes this atomic, mirroring
        // the partial unique index in the SQL schema.
        let has_held = inner
            .stakes
            .values()
            .any(|s| s.user_id == user_id && s.status == StakeStatus::Held);
        if has_held {
            return Err(StoreError::DuplicateActiveStake);
        }
        let stake = Stake {
            id: Uuid::new_v4(),
            user_id,
            amount_total,
            amount_refunded: Decimal::ZERO,
            status: StakeStatus::Held,
            version: 1,
            created_at: Utc::now(),
            closed_at: None,
        };
        inner.stakes.insert(stake.id, stake.clone());
        Ok(stake)
    }

    async fn get_stake(&self, id: Uuid) -> Result<Option<Stake>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.stakes.get(&id).cloned())
    }

    async fn stakes_for_user(&self, user_id: Uuid) -> Result<Vec<StakeWithTransfers>, StoreError> {
        let inner = self.inner.lock().await;
        let mut stakes: Vec<Stake> = inner
            .stakes
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        stakes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(stakes
            .into_iter()
            .map(|stake| {
                let transfers: Vec<Transfer> = inner
                    .transfers
                    .iter()
                    .rev()
                    .filter(|t| t.stake_id == Some(stake.id))
                    .cloned()
                    .collect();
                StakeWithTransfers { stake, transfers }
            })
            .collect())
    }

    async fn transfers_for_user(&self, user_id: Uuid) -> Result<Vec<Transfer>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transfers
            .iter()
            .rev()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn get_transfer(&self, id: Uuid) -> Result<Option<Transfer>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.transfers.iter().find(|t| t.id == id).cloned())
    }

    async fn commit_refund(
        &self,
        stake_id: Uuid,
        expected_version: i64,
        transfer: NewTransfer,
    ) -> Result<(Transfer, Stake), StoreError> {
        let mut inner = self.inner.lock().await;
        let stake = inner
            .stakes
            .get(&stake_id)
            .cloned()
            .ok_or(StoreError::StakeNotFound)?;
        check_mutable(&stake, expected_version)?;
        if stake.amount_refunded + transfer.amount > stake.amount_total {
            return Err(StoreError::BalanceExceeded);
        }

        let recorded = append_transfer(&mut inner, transfer);
        let stake = inner
            .stakes
            .get_mut(&stake_id)
            .ok_or(StoreError::StakeNotFound)?;
        stake.amount_refunded += recorded.amount;
        stake.version += 1;
        Ok((recorded, stake.clone()))
    }

    async fn commit_settlement(
        &self,
        stake_id: Uuid,
        expected_version: i64,
        transfer: NewTransfer,
    ) -> Result<(Transfer, Stake, Pool), StoreError> {
        let mut inner = self.inner.lock().await;
        let stake = inner
            .stakes
            .get(&stake_id)
            .cloned()
            .ok_or(StoreError::StakeNotFound)?;
        check_mutable(&stake, expected_version)?;

        let now = Utc::now();
        let amount = transfer.amount;
        let recorded = append_transfer(&mut inner, transfer);

        let stake = inner
            .stakes
            .get_mut(&stake_id)
            .ok_or(StoreError::StakeNotFound)?;
        stake.status = StakeStatus::Closed;
        stake.closed_at = Some(now);
        stake.version += 1;
        let closed = stake.clone();

        let pool = inner.pool.get_or_insert(Pool {
            amount_total: Decimal::ZERO,
            last_settlement_at: None,
        });
        pool.amount_total += amount;
        pool.last_settlement_at = Some(now);
        Ok((recorded, closed, pool.clone()))
    }

    async fn close_stake(
        &self,
        stake_id: Uuid,
        expected_version: i64,
    ) -> Result<Stake, StoreError> {
        let mut inner = self.inner.lock().await;
        let stake = inner
            .stakes
            .get_mut(&stake_id)
            .ok_or(StoreError::StakeNotFound)?;
        check_mutable(stake, expected_version)?;
        stake.status = StakeStatus::Closed;
        stake.closed_at = Some(Utc::now());
        stake.version += 1;
        Ok(stake.clone())
    }

    async fn get_pool(&self) -> Result<Option<Pool>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.pool.clone())
    }

    async fn claim_operation(&self, op: NewOperation) -> Result<OperationClaim, StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (op.stake_id, op.idempotency_key.clone());

        if let Some(existing_id) = inner.operation_keys.get(&key).cloned() {
            let record = inner
                .operations
                .get_mut(&existing_id)
                .ok_or_else(|| StoreError::Corrupt(format!("dangling operation key {existing_id}")))?;
            if record.kind != op.kind {
                return Err(StoreError::OperationKindMismatch);
            }
            return Ok(match record.state {
                OperationState::Pending => OperationClaim::InFlight(record.clone()),
                OperationState::Succeeded => OperationClaim::Completed(record.clone()),
                OperationState::Failed => {
                    // Definitive failure: re-arm the slot for this retry.
                    record.state = OperationState::Pending;
                    record.amount = op.amount;
                    record.error = None;
                    record.updated_at = Utc::now();
                    OperationClaim::Fresh(record.clone())
                }
            });
        }

        let now = Utc::now();
        let record = OperationRecord {
            id: op.id,
            stake_id: op.stake_id,
            idempotency_key: op.idempotency_key,
            kind: op.kind,
            amount: op.amount,
            state: OperationState::Pending,
            transfer_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        inner
            .operation_keys
            .insert(key, record.id.to_string());
        inner
            .operations
            .insert(record.id.to_string(), record.clone());
        Ok(OperationClaim::Fresh(record))
    }

    async fn complete_operation(
        &self,
        id: &OperationId,
        transfer_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .operations
            .get_mut(&id.to_string())
            .ok_or(StoreError::OperationNotFound)?;
        record.state = OperationState::Succeeded;
        record.transfer_id = Some(transfer_id);
        record.error = None;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn fail_operation(&self, id: &OperationId, error: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .operations
            .get_mut(&id.to_string())
            .ok_or(StoreError::OperationNotFound)?;
        record.state = OperationState::Failed;
        record.error = Some(error.to_string());
        record.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::types::{OperationKind, TransferDirection};

    fn new_user() -> NewUser {
        NewUser {
            name: "alice".to_string(),
            pan_masked: "****1126".to_string(),
            card_last4: "1126".to_string(),
        }
    }

    fn push_transfer(user_id: Uuid, stake_id: Uuid, amount: Decimal) -> NewTransfer {
        NewTransfer {
            user_id,
            stake_id: Some(stake_id),
            direction: TransferDirection::Push,
            amount,
            visa_status: "APPROVED".to_string(),
            visa_transfer_id: "vt-1".to_string(),
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_duplicate_active_stake_rejected() {
        let store = MemoryLedgerStore::new();
        let user = store.create_user(new_user()).await.unwrap();
        store.create_stake(user.id, Decimal::from(100)).await.unwrap();

        let err = store.create_stake(user.id, Decimal::from(50)).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateActiveStake));
    }

    #[tokio::test]
    async fn test_second_stake_allowed_after_close() {
        let store = MemoryLedgerStore::new();
        let user = store.create_user(new_user()).await.unwrap();
        let stake = store.create_stake(user.id, Decimal::from(100)).await.unwrap();
        store.close_stake(stake.id, stake.version).await.unwrap();

        assert!(store.create_stake(user.id, Decimal::from(50)).await.is_ok());
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let store = MemoryLedgerStore::new();
        let user = store.create_user(new_user()).await.unwrap();
        let stake = store.create_stake(user.id, Decimal::from(100)).await.unwrap();

        store
            .commit_refund(stake.id, stake.version, push_transfer(user.id, stake.id, Decimal::from(10)))
            .await
            .unwrap();

        // Second commit against the version we read before the first one.
        let err = store
            .commit_refund(stake.id, stake.version, push_transfer(user.id, stake.id, Decimal::from(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict));
    }

    #[tokio::test]
    async fn test_refund_beyond_total_is_rejected() {
        let store = MemoryLedgerStore::new();
        let user = store.create_user(new_user()).await.unwrap();
        let stake = store.create_stake(user.id, Decimal::from(100)).await.unwrap();

        let err = store
            .commit_refund(stake.id, stake.version, push_transfer(user.id, stake.id, Decimal::from(150)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BalanceExceeded));
    }

    #[tokio::test]
    async fn test_settlement_credits_pool_and_closes() {
        let store = MemoryLedgerStore::new();
        let user = store.create_user(new_user()).await.unwrap();
        let stake = store.create_stake(user.id, Decimal::from(100)).await.unwrap();

        let (_, closed, pool) = store
            .commit_settlement(stake.id, stake.version, push_transfer(user.id, stake.id, Decimal::from(100)))
            .await
            .unwrap();
        assert_eq!(closed.status, StakeStatus::Closed);
        assert!(closed.closed_at.is_some());
        assert_eq!(pool.amount_total, Decimal::from(100));

        let err = store
            .commit_settlement(stake.id, closed.version, push_transfer(user.id, stake.id, Decimal::from(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StakeNotHeld));
    }

    #[tokio::test]
    async fn test_claim_rejects_kind_reuse() {
        let store = MemoryLedgerStore::new();
        let user = store.create_user(new_user()).await.unwrap();
        let stake = store.create_stake(user.id, Decimal::from(100)).await.unwrap();

        let refund_op = NewOperation {
            id: OperationId::new(),
            stake_id: stake.id,
            idempotency_key: "shared".to_string(),
            kind: OperationKind::Refund,
            amount: Decimal::from(10),
        };
        store.claim_operation(refund_op.clone()).await.unwrap();

        // Same key, different kind: refused without touching the slot,
        // in every state of the original record.
        let settle_op = NewOperation {
            id: OperationId::new(),
            kind: OperationKind::Settlement,
            ..refund_op.clone()
        };
        let err = store.claim_operation(settle_op.clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::OperationKindMismatch));

        store.fail_operation(&refund_op.id, "declined").await.unwrap();
        let err = store.claim_operation(settle_op.clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::OperationKindMismatch));

        store
            .complete_operation(&refund_op.id, Uuid::new_v4())
            .await
            .unwrap();
        let err = store.claim_operation(settle_op).await.unwrap_err();
        assert!(matches!(err, StoreError::OperationKindMismatch));

        // The original kind still replays normally.
        let claim = store
            .claim_operation(NewOperation {
                id: OperationId::new(),
                ..refund_op
            })
            .await
            .unwrap();
        assert!(matches!(claim, OperationClaim::Completed(_)));
    }

    #[tokio::test]
    async fn test_operation_claim_lifecycle() {
        let store = MemoryLedgerStore::new();
        let user = store.create_user(new_user()).await.unwrap();
        let stake = store.create_stake(user.id, Decimal::from(100)).await.unwrap();

        let op = NewOperation {
            id: OperationId::new(),
            stake_id: stake.id,
            idempotency_key: "key-1".to_string(),
            kind: OperationKind::Refund,
            amount: Decimal::from(10),
        };

        let claim = store.claim_operation(op.clone()).await.unwrap();
        assert!(matches!(claim, OperationClaim::Fresh(_)));

        // Same key while pending: in flight.
        let claim = store
            .claim_operation(NewOperation {
                id: OperationId::new(),
                ..op.clone()
            })
            .await
            .unwrap();
        assert!(matches!(claim, OperationClaim::InFlight(_)));

        // Definitive failure re-arms the slot.
        store.fail_operation(&op.id, "declined").await.unwrap();
        let claim = store
            .claim_operation(NewOperation {
                id: OperationId::new(),
                ..op.clone()
            })
            .await
            .unwrap();
        match claim {
            OperationClaim::Fresh(record) => assert_eq!(record.id, op.id),
            other => panic!("expected Fresh, got {other:?}"),
        }

        // Success makes replays return the recorded outcome.
        let transfer_id = Uuid::new_v4();
        store.complete_operation(&op.id, transfer_id).await.unwrap();
        let claim = store
            .claim_operation(NewOperation {
                id: OperationId::new(),
                ..op
            })
            .await
            .unwrap();
        match claim {
            OperationClaim::Completed(record) => assert_eq!(record.transfer_id, Some(transfer_id)),
            other => panic!("expected Completed, got {other:?}"),
        }
    }
}
