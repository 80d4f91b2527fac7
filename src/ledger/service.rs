//! StakeService: the settlement engine.
//!
//! Owns every mutation of stake balances and the pool. The invariant order
//! for anything that moves money is fixed:
//!
//!   1. acquire the per-stake lock
//!   2. claim the (stake_id, idempotency_key) operation slot
//!   3. validate status and balance
//!   4. push funds through the payment network
//!   5. commit the local ledger mutation
//!
//! The external push happens strictly before the local commit, so a crash
//! between 4 and 5 leaves the operation PENDING and the money provably
//! pushed at most once. A PENDING slot is never re-armed; replays against
//! it surface `AmbiguousTransferOutcome` until an operator reconciles.

use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RecipientValidation;
use crate::visa::{CardCredential, CardVault, PaymentNetworkClient, PushFundsRequest};

use super::error::StakeError;
use super::store::{LedgerStore, StoreError};
use super::types::{
    NewOperation, NewTransfer, NewUser, OperationClaim, OperationId, OperationKind,
    OperationRecord, PoolSummary, RefundOutcome, SettlementOutcome, Stake, StakeStatus,
    StakeWithTransfers, Transfer, TransferDirection, User, mask_pan,
};

/// Bounded retries for an optimistic-lock miss on commit. The retry re-reads
/// and re-commits only; it never re-pushes funds.
const MAX_COMMIT_RETRIES: usize = 3;

/// Escrow-side accounts the engine moves money from and to.
#[derive(Debug, Clone)]
pub struct EscrowAccounts {
    /// Card the escrow balance lives on; sender for every push.
    pub escrow_card: CardCredential,
    /// Destination account for pool sweeps.
    pub pool_pan: String,
}

pub struct StakeService {
    store: Arc<dyn LedgerStore>,
    network: Arc<dyn PaymentNetworkClient>,
    vault: Arc<dyn CardVault>,
    escrow: EscrowAccounts,
    recipient_validation: RecipientValidation,
    /// Per-stake serialization for in-process callers. Cross-process writers
    /// are caught by the store's version guard instead.
    stake_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl StakeService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        network: Arc<dyn PaymentNetworkClient>,
        vault: Arc<dyn CardVault>,
        escrow: EscrowAccounts,
        recipient_validation: RecipientValidation,
    ) -> Self {
        Self {
            store,
            network,
            vault,
            escrow,
            recipient_validation,
            stake_locks: DashMap::new(),
        }
    }

    fn stake_lock(&self, stake_id: Uuid) -> Arc<Mutex<()>> {
        self.stake_locks
            .entry(stake_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ========================================================================
    // Users
    // ========================================================================

    pub async fn create_user(&self, name: &str, card_pan: &str) -> Result<User, StakeError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StakeError::InvalidRequest("name must not be empty".into()));
        }
        let digits: String = card_pan.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() < 12 || digits.len() > 19 {
            return Err(StakeError::InvalidRequest(
                "card number must be 12 to 19 digits".into(),
            ));
        }

        match self.network.validate_recipient(&digits).await {
            Ok(attrs) if !attrs.push_funds_enabled => {
                if self.recipient_validation == RecipientValidation::Required {
                    return Err(StakeError::InvalidRequest(
                        "card cannot receive pushed funds".into(),
                    ));
                }
                warn!(card_last4 = &digits[digits.len() - 4..], "card not push-enabled");
            }
            Ok(_) => {}
            Err(e) => {
                // No funds have moved at this point, so this is a rejected
                // registration rather than a transfer failure.
                if self.recipient_validation == RecipientValidation::Required {
                    return Err(StakeError::InvalidRequest(format!(
                        "recipient validation failed: {e}"
                    )));
                }
                warn!(error = %e, "recipient validation skipped");
            }
        }

        let (pan_masked, card_last4) = mask_pan(&digits);
        let user = self
            .store
            .create_user(NewUser {
                name: name.to_string(),
                pan_masked,
                card_last4,
            })
            .await?;
        info!(user_id = %user.id, "user registered");
        Ok(user)
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<User, StakeError> {
        self.store
            .get_user(user_id)
            .await?
            .ok_or(StakeError::UserNotFound)
    }

    pub async fn list_users(&self) -> Result<Vec<User>, StakeError> {
        Ok(self.store.list_users().await?)
    }

    // ========================================================================
    // Stakes
    // ========================================================================

    /// Open a new HELD stake. The funds are assumed captured by the
    /// collaborator that pulled them; this engine only records the escrow.
    pub async fn create_stake(
        &self,
        user_id: Uuid,
        amount: Decimal,
    ) -> Result<Stake, StakeError> {
        if amount <= Decimal::ZERO {
            return Err(StakeError::InvalidAmount);
        }
        self.get_user(user_id).await?;
        let stake = self.store.create_stake(user_id, amount).await?;
        info!(stake_id = %stake.id, user_id = %user_id, amount = %amount, "stake opened");
        Ok(stake)
    }

    pub async fn get_stake(&self, stake_id: Uuid) -> Result<Stake, StakeError> {
        self.store
            .get_stake(stake_id)
            .await?
            .ok_or(StakeError::StakeNotFound)
    }

    pub async fn stakes_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<StakeWithTransfers>, StakeError> {
        self.get_user(user_id).await?;
        Ok(self.store.stakes_for_user(user_id).await?)
    }

    pub async fn transfers_for_user(&self, user_id: Uuid) -> Result<Vec<Transfer>, StakeError> {
        self.get_user(user_id).await?;
        Ok(self.store.transfers_for_user(user_id).await?)
    }

    pub async fn pool_summary(&self) -> Result<PoolSummary, StakeError> {
        let pool = self.store.get_pool().await?;
        Ok(match pool {
            Some(p) => PoolSummary {
                amount_total: p.amount_total,
                last_settlement_at: p.last_settlement_at,
            },
            None => PoolSummary {
                amount_total: Decimal::ZERO,
                last_settlement_at: None,
            },
        })
    }

    // ========================================================================
    // Refunds
    // ========================================================================

    /// Push part of a stake's remaining balance back to the user's card.
    pub async fn process_refund(
        &self,
        user_id: Uuid,
        stake_id: Uuid,
        amount: Decimal,
        idempotency_key: Option<String>,
    ) -> Result<RefundOutcome, StakeError> {
        if amount <= Decimal::ZERO {
            return Err(StakeError::InvalidAmount);
        }

        let lock = self.stake_lock(stake_id);
        let _guard = lock.lock().await;

        let stake = self.get_stake(stake_id).await?;
        if stake.user_id != user_id {
            return Err(StakeError::StakeNotFound);
        }

        let op_id = OperationId::new();
        let key = idempotency_key.unwrap_or_else(|| op_id.to_string());
        let op = match self
            .store
            .claim_operation(NewOperation {
                id: op_id,
                stake_id,
                idempotency_key: key.clone(),
                kind: OperationKind::Refund,
                amount,
            })
            .await?
        {
            OperationClaim::Completed(record) => {
                return self.replay_refund(&record, amount, &stake).await;
            }
            OperationClaim::InFlight(_) => {
                return Err(StakeError::AmbiguousTransferOutcome(format!(
                    "refund with key {key} is pending; reconcile before retrying"
                )));
            }
            OperationClaim::Fresh(record) => record,
        };

        if let Err(e) = self.check_refundable(&stake, amount) {
            self.store.fail_operation(&op.id, &e.to_string()).await?;
            return Err(e);
        }

        let user = self.get_user(user_id).await?;
        let recipient = self
            .vault
            .card_for_user(user.id)
            .await
            .map_err(|e| StakeError::InvalidRequest(e.to_string()))?;

        let receipt = match self
            .network
            .push_funds(&PushFundsRequest {
                sender: self.escrow.escrow_card.clone(),
                recipient_pan: recipient.pan,
                amount,
                reference: key.clone(),
            })
            .await
        {
            Ok(receipt) => receipt,
            Err(e) if e.is_ambiguous() => {
                // Funds may have moved. The slot stays PENDING so a retry
                // with the same key cannot trigger a second push.
                warn!(stake_id = %stake_id, key = %key, error = %e, "refund outcome unknown");
                return Err(StakeError::AmbiguousTransferOutcome(e.to_string()));
            }
            Err(e) => {
                self.store.fail_operation(&op.id, &e.to_string()).await?;
                return Err(StakeError::FundTransferFailed(e.to_string()));
            }
        };

        let (transfer, updated) = self
            .commit_refund_with_retry(
                stake_id,
                stake.version,
                NewTransfer {
                    user_id,
                    stake_id: Some(stake_id),
                    direction: TransferDirection::Push,
                    amount,
                    visa_status: receipt.status.clone(),
                    visa_transfer_id: receipt.visa_transfer_id.clone(),
                    metadata: receipt.raw,
                },
                amount,
            )
            .await?;
        self.store.complete_operation(&op.id, transfer.id).await?;

        info!(
            stake_id = %stake_id,
            transfer_id = %transfer.id,
            amount = %amount,
            remaining = %updated.remaining(),
            "refund pushed"
        );
        Ok(RefundOutcome {
            transfer_id: transfer.id,
            visa_transfer_id: transfer.visa_transfer_id,
            amount,
            visa_status: transfer.visa_status,
            remaining_balance: updated.remaining(),
        })
    }

    fn check_refundable(&self, stake: &Stake, amount: Decimal) -> Result<(), StakeError> {
        match stake.status {
            StakeStatus::Closed => Err(StakeError::StakeAlreadyClosed),
            StakeStatus::Held if amount > stake.remaining() => {
                Err(StakeError::InsufficientBalance)
            }
            StakeStatus::Held => Ok(()),
        }
    }

    /// Serve a repeated request from the recorded outcome without touching
    /// the network.
    async fn replay_refund(
        &self,
        record: &OperationRecord,
        amount: Decimal,
        stake: &Stake,
    ) -> Result<RefundOutcome, StakeError> {
        if record.amount != amount {
            return Err(StakeError::InvalidRequest(format!(
                "idempotency key {} was used with amount {}",
                record.idempotency_key, record.amount
            )));
        }
        let transfer_id = record
            .transfer_id
            .ok_or_else(|| StakeError::Store(StoreError::Corrupt(
                "succeeded operation without transfer".into(),
            )))?;
        let transfer = self
            .store
            .get_transfer(transfer_id)
            .await?
            .ok_or_else(|| StakeError::Store(StoreError::Corrupt(
                "operation points at missing transfer".into(),
            )))?;
        info!(stake_id = %stake.id, transfer_id = %transfer.id, "refund replayed");
        Ok(RefundOutcome {
            transfer_id: transfer.id,
            visa_transfer_id: transfer.visa_transfer_id,
            amount: transfer.amount,
            visa_status: transfer.visa_status,
            remaining_balance: stake.remaining(),
        })
    }

    /// Commit after a successful push. A version conflict means some other
    /// process touched the stake between our read and our write; re-read and
    /// commit again, never push again. If the commit cannot land, the
    /// operation stays PENDING for reconciliation.
    async fn commit_refund_with_retry(
        &self,
        stake_id: Uuid,
        mut version: i64,
        transfer: NewTransfer,
        amount: Decimal,
    ) -> Result<(Transfer, Stake), StakeError> {
        let mut attempt = 0;
        loop {
            match self
                .store
                .commit_refund(stake_id, version, transfer.clone())
                .await
            {
                Ok(result) => return Ok(result),
                Err(StoreError::VersionConflict) if attempt + 1 < MAX_COMMIT_RETRIES => {
                    attempt += 1;
                    let current = self.get_stake(stake_id).await?;
                    if current.status != StakeStatus::Held || amount > current.remaining() {
                        warn!(stake_id = %stake_id, "pushed refund no longer fits the stake");
                        return Err(StakeError::AmbiguousTransferOutcome(
                            "funds pushed but stake changed concurrently; reconcile".into(),
                        ));
                    }
                    version = current.version;
                }
                Err(StoreError::VersionConflict) => {
                    // Retries exhausted with the push already made. This must
                    // not map to a retry-safe error: the slot stays PENDING
                    // and the caller reconciles instead of pushing again.
                    warn!(stake_id = %stake_id, "refund commit conflicts exhausted after push");
                    return Err(StakeError::AmbiguousTransferOutcome(
                        "funds pushed but commit kept conflicting; reconcile".into(),
                    ));
                }
                Err(e) => {
                    warn!(stake_id = %stake_id, error = %e, "refund commit failed after push");
                    return Err(e.into());
                }
            }
        }
    }

    // ========================================================================
    // Settlement
    // ========================================================================

    /// Sweep a stake's unreturned balance into the shared pool and close it.
    ///
    /// A fully refunded stake has nothing to sweep: it is closed in place
    /// and the call reports `NothingToSettle`.
    pub async fn settle_to_pool(
        &self,
        stake_id: Uuid,
        idempotency_key: Option<String>,
    ) -> Result<SettlementOutcome, StakeError> {
        let lock = self.stake_lock(stake_id);
        let _guard = lock.lock().await;

        let stake = self.get_stake(stake_id).await?;
        let remaining = stake.remaining();

        let op_id = OperationId::new();
        let key = idempotency_key.unwrap_or_else(|| op_id.to_string());
        let op = match self
            .store
            .claim_operation(NewOperation {
                id: op_id,
                stake_id,
                idempotency_key: key.clone(),
                kind: OperationKind::Settlement,
                amount: remaining,
            })
            .await?
        {
            OperationClaim::Completed(record) => {
                return self.replay_settlement(&record).await;
            }
            OperationClaim::InFlight(_) => {
                return Err(StakeError::AmbiguousTransferOutcome(format!(
                    "settlement with key {key} is pending; reconcile before retrying"
                )));
            }
            OperationClaim::Fresh(record) => record,
        };

        if stake.status == StakeStatus::Closed {
            let e = StakeError::StakeAlreadyClosed;
            self.store.fail_operation(&op.id, &e.to_string()).await?;
            return Err(e);
        }
        if remaining == Decimal::ZERO {
            let e = StakeError::NothingToSettle;
            self.store.fail_operation(&op.id, &e.to_string()).await?;
            let closed = self.store.close_stake(stake_id, stake.version).await?;
            info!(stake_id = %closed.id, "fully refunded stake closed without sweep");
            return Err(e);
        }

        let receipt = match self
            .network
            .push_funds(&PushFundsRequest {
                sender: self.escrow.escrow_card.clone(),
                recipient_pan: self.escrow.pool_pan.clone(),
                amount: remaining,
                reference: key.clone(),
            })
            .await
        {
            Ok(receipt) => receipt,
            Err(e) if e.is_ambiguous() => {
                warn!(stake_id = %stake_id, key = %key, error = %e, "settlement outcome unknown");
                return Err(StakeError::AmbiguousTransferOutcome(e.to_string()));
            }
            Err(e) => {
                self.store.fail_operation(&op.id, &e.to_string()).await?;
                return Err(StakeError::FundTransferFailed(e.to_string()));
            }
        };

        let transfer = NewTransfer {
            user_id: stake.user_id,
            stake_id: Some(stake_id),
            direction: TransferDirection::Push,
            amount: remaining,
            visa_status: receipt.status.clone(),
            visa_transfer_id: receipt.visa_transfer_id.clone(),
            metadata: receipt.raw,
        };
        let mut version = stake.version;
        let mut attempt = 0;
        let (recorded, closed, pool) = loop {
            match self
                .store
                .commit_settlement(stake_id, version, transfer.clone())
                .await
            {
                Ok(result) => break result,
                Err(StoreError::VersionConflict) if attempt + 1 < MAX_COMMIT_RETRIES => {
                    attempt += 1;
                    let current = self.get_stake(stake_id).await?;
                    if current.status != StakeStatus::Held || current.remaining() != remaining {
                        warn!(stake_id = %stake_id, "swept amount no longer matches the stake");
                        return Err(StakeError::AmbiguousTransferOutcome(
                            "funds pushed but stake changed concurrently; reconcile".into(),
                        ));
                    }
                    version = current.version;
                }
                Err(StoreError::VersionConflict) => {
                    warn!(stake_id = %stake_id, "settlement commit conflicts exhausted after push");
                    return Err(StakeError::AmbiguousTransferOutcome(
                        "funds pushed but commit kept conflicting; reconcile".into(),
                    ));
                }
                Err(e) => {
                    warn!(stake_id = %stake_id, error = %e, "settlement commit failed after push");
                    return Err(e.into());
                }
            }
        };
        self.store.complete_operation(&op.id, recorded.id).await?;

        info!(
            stake_id = %stake_id,
            transfer_id = %recorded.id,
            amount = %remaining,
            pool_total = %pool.amount_total,
            "stake settled to pool"
        );
        Ok(SettlementOutcome {
            transfer_id: recorded.id,
            visa_transfer_id: recorded.visa_transfer_id,
            amount: remaining,
            stake_status: closed.status,
        })
    }

    async fn replay_settlement(
        &self,
        record: &OperationRecord,
    ) -> Result<SettlementOutcome, StakeError> {
        let transfer_id = record
            .transfer_id
            .ok_or_else(|| StakeError::Store(StoreError::Corrupt(
                "succeeded operation without transfer".into(),
            )))?;
        let transfer = self
            .store
            .get_transfer(transfer_id)
            .await?
            .ok_or_else(|| StakeError::Store(StoreError::Corrupt(
                "operation points at missing transfer".into(),
            )))?;
        info!(stake_id = %record.stake_id, transfer_id = %transfer.id, "settlement replayed");
        Ok(SettlementOutcome {
            transfer_id: transfer.id,
            visa_transfer_id: transfer.visa_transfer_id,
            amount: transfer.amount,
            stake_status: StakeStatus::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::ledger::memory::MemoryLedgerStore;
    use crate::ledger::types::Pool;
    use crate::visa::mock::{MockBehavior, MockPaymentNetwork};
    use crate::visa::StaticCardVault;

    struct Harness {
        service: Arc<StakeService>,
        network: Arc<MockPaymentNetwork>,
    }

    fn harness_with(store: Arc<dyn LedgerStore>, policy: RecipientValidation) -> Harness {
        let network = Arc::new(MockPaymentNetwork::new());
        let service = Arc::new(StakeService::new(
            store,
            network.clone(),
            Arc::new(StaticCardVault::new(
                "4957030420210454".into(),
                "2031-12".into(),
            )),
            EscrowAccounts {
                escrow_card: CardCredential {
                    pan: "4005520000011126".into(),
                    expiry: "2031-12".into(),
                },
                pool_pan: "4005520000012345".into(),
            },
            policy,
        ));
        Harness { service, network }
    }

    fn harness() -> Harness {
        harness_with(
            Arc::new(MemoryLedgerStore::new()),
            RecipientValidation::Advisory,
        )
    }

    /// Store whose ledger commits always lose the optimistic-lock race,
    /// as if another process kept winning between our read and our write.
    struct ConflictingStore {
        inner: MemoryLedgerStore,
    }

    #[async_trait]
    impl LedgerStore for ConflictingStore {
        async fn create_user(&self, user: NewUser) -> Result<User, StoreError> {
            self.inner.create_user(user).await
        }
        async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
            self.inner.get_user(id).await
        }
        async fn list_users(&self) -> Result<Vec<User>, StoreError> {
            self.inner.list_users().await
        }
        async fn create_stake(
            &self,
            user_id: Uuid,
            amount_total: Decimal,
        ) -> Result<Stake, StoreError> {
            self.inner.create_stake(user_id, amount_total).await
        }
        async fn get_stake(&self, id: Uuid) -> Result<Option<Stake>, StoreError> {
            self.inner.get_stake(id).await
        }
        async fn stakes_for_user(
            &self,
            user_id: Uuid,
        ) -> Result<Vec<StakeWithTransfers>, StoreError> {
            self.inner.stakes_for_user(user_id).await
        }
        async fn transfers_for_user(&self, user_id: Uuid) -> Result<Vec<Transfer>, StoreError> {
            self.inner.transfers_for_user(user_id).await
        }
        async fn get_transfer(&self, id: Uuid) -> Result<Option<Transfer>, StoreError> {
            self.inner.get_transfer(id).await
        }
        async fn commit_refund(
            &self,
            _stake_id: Uuid,
            _expected_version: i64,
            _transfer: NewTransfer,
        ) -> Result<(Transfer, Stake), StoreError> {
            Err(StoreError::VersionConflict)
        }
        async fn commit_settlement(
            &self,
            _stake_id: Uuid,
            _expected_version: i64,
            _transfer: NewTransfer,
        ) -> Result<(Transfer, Stake, Pool), StoreError> {
            Err(StoreError::VersionConflict)
        }
        async fn close_stake(
            &self,
            stake_id: Uuid,
            expected_version: i64,
        ) -> Result<Stake, StoreError> {
            self.inner.close_stake(stake_id, expected_version).await
        }
        async fn get_pool(&self) -> Result<Option<Pool>, StoreError> {
            self.inner.get_pool().await
        }
        async fn claim_operation(&self, op: NewOperation) -> Result<OperationClaim, StoreError> {
            self.inner.claim_operation(op).await
        }
        async fn complete_operation(
            &self,
            id: &OperationId,
            transfer_id: Uuid,
        ) -> Result<(), StoreError> {
            self.inner.complete_operation(id, transfer_id).await
        }
        async fn fail_operation(&self, id: &OperationId, error: &str) -> Result<(), StoreError> {
            self.inner.fail_operation(id, error).await
        }
    }

    async fn user_with_stake(h: &Harness, amount: u32) -> (User, Stake) {
        let user = h
            .service
            .create_user("alice", "4957030420210454")
            .await
            .unwrap();
        let stake = h
            .service
            .create_stake(user.id, Decimal::from(amount))
            .await
            .unwrap();
        (user, stake)
    }

    #[tokio::test]
    async fn test_refund_decrements_remaining_balance() {
        let h = harness();
        let (user, stake) = user_with_stake(&h, 100).await;

        let outcome = h
            .service
            .process_refund(user.id, stake.id, Decimal::from(30), None)
            .await
            .unwrap();
        assert_eq!(outcome.amount, Decimal::from(30));
        assert_eq!(outcome.remaining_balance, Decimal::from(70));

        let transfers = h.service.transfers_for_user(user.id).await.unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].direction, TransferDirection::Push);
        assert_eq!(h.network.push_count(), 1);
    }

    #[tokio::test]
    async fn test_refund_rejects_insufficient_balance_without_pushing() {
        let h = harness();
        let (user, stake) = user_with_stake(&h, 50).await;

        let err = h
            .service
            .process_refund(user.id, stake.id, Decimal::from(51), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StakeError::InsufficientBalance));
        assert_eq!(h.network.push_count(), 0);

        let stake = h.service.get_stake(stake.id).await.unwrap();
        assert_eq!(stake.amount_refunded, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_refund_rejects_nonpositive_amount() {
        let h = harness();
        let (user, stake) = user_with_stake(&h, 50).await;
        let err = h
            .service
            .process_refund(user.id, stake.id, Decimal::ZERO, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StakeError::InvalidAmount));
        let err = h
            .service
            .process_refund(user.id, stake.id, Decimal::from(-5), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StakeError::InvalidAmount));
    }

    #[tokio::test]
    async fn test_refund_wrong_user_is_not_found() {
        let h = harness();
        let (_, stake) = user_with_stake(&h, 50).await;
        let err = h
            .service
            .process_refund(Uuid::new_v4(), stake.id, Decimal::from(10), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StakeError::StakeNotFound));
    }

    #[tokio::test]
    async fn test_declined_refund_leaves_stake_untouched_and_is_retryable() {
        let h = harness();
        let (user, stake) = user_with_stake(&h, 100).await;

        h.network.set_behavior(MockBehavior::Decline);
        let err = h
            .service
            .process_refund(user.id, stake.id, Decimal::from(40), Some("k1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StakeError::FundTransferFailed(_)));
        assert!(err.is_safe_to_retry());

        let current = h.service.get_stake(stake.id).await.unwrap();
        assert_eq!(current.amount_refunded, Decimal::ZERO);

        // Same key after a definitive failure re-arms and goes through.
        h.network.set_behavior(MockBehavior::Succeed);
        let outcome = h
            .service
            .process_refund(user.id, stake.id, Decimal::from(40), Some("k1".into()))
            .await
            .unwrap();
        assert_eq!(outcome.remaining_balance, Decimal::from(60));
        assert_eq!(h.network.push_count(), 2);
    }

    #[tokio::test]
    async fn test_ambiguous_refund_blocks_replay_with_same_key() {
        let h = harness();
        let (user, stake) = user_with_stake(&h, 100).await;

        h.network.set_behavior(MockBehavior::Ambiguous);
        let err = h
            .service
            .process_refund(user.id, stake.id, Decimal::from(25), Some("k1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StakeError::AmbiguousTransferOutcome(_)));
        assert!(!err.is_safe_to_retry());

        // Even with the network healthy again, the same key must not push.
        h.network.set_behavior(MockBehavior::Succeed);
        let err = h
            .service
            .process_refund(user.id, stake.id, Decimal::from(25), Some("k1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StakeError::AmbiguousTransferOutcome(_)));
        assert_eq!(h.network.push_count(), 1);
    }

    #[tokio::test]
    async fn test_refund_replay_returns_original_outcome_without_second_push() {
        let h = harness();
        let (user, stake) = user_with_stake(&h, 100).await;

        let first = h
            .service
            .process_refund(user.id, stake.id, Decimal::from(20), Some("k1".into()))
            .await
            .unwrap();
        let second = h
            .service
            .process_refund(user.id, stake.id, Decimal::from(20), Some("k1".into()))
            .await
            .unwrap();
        assert_eq!(first.transfer_id, second.transfer_id);
        assert_eq!(first.visa_transfer_id, second.visa_transfer_id);
        assert_eq!(h.network.push_count(), 1);

        let current = h.service.get_stake(stake.id).await.unwrap();
        assert_eq!(current.amount_refunded, Decimal::from(20));
    }

    #[tokio::test]
    async fn test_refund_replay_with_different_amount_is_rejected() {
        let h = harness();
        let (user, stake) = user_with_stake(&h, 100).await;
        h.service
            .process_refund(user.id, stake.id, Decimal::from(20), Some("k1".into()))
            .await
            .unwrap();
        let err = h
            .service
            .process_refund(user.id, stake.id, Decimal::from(30), Some("k1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StakeError::InvalidRequest(_)));
        assert_eq!(h.network.push_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_refunds_cannot_overdraw() {
        let h = harness();
        let (user, stake) = user_with_stake(&h, 100).await;

        let a = {
            let service = h.service.clone();
            tokio::spawn(async move {
                service
                    .process_refund(user.id, stake.id, Decimal::from(60), None)
                    .await
            })
        };
        let b = {
            let service = h.service.clone();
            tokio::spawn(async move {
                service
                    .process_refund(user.id, stake.id, Decimal::from(60), None)
                    .await
            })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(StakeError::InsufficientBalance)
        )));
        assert_eq!(h.network.push_count(), 1);

        let current = h.service.get_stake(stake.id).await.unwrap();
        assert_eq!(current.amount_refunded, Decimal::from(60));
    }

    #[tokio::test]
    async fn test_settle_sweeps_remaining_and_closes() {
        let h = harness();
        let (user, stake) = user_with_stake(&h, 100).await;
        h.service
            .process_refund(user.id, stake.id, Decimal::from(30), None)
            .await
            .unwrap();

        let outcome = h.service.settle_to_pool(stake.id, None).await.unwrap();
        assert_eq!(outcome.amount, Decimal::from(70));
        assert_eq!(outcome.stake_status, StakeStatus::Closed);

        let pool = h.service.pool_summary().await.unwrap();
        assert_eq!(pool.amount_total, Decimal::from(70));
        assert!(pool.last_settlement_at.is_some());

        let closed = h.service.get_stake(stake.id).await.unwrap();
        assert_eq!(closed.status, StakeStatus::Closed);
        assert!(closed.closed_at.is_some());
    }

    #[tokio::test]
    async fn test_settle_fully_refunded_stake_closes_without_sweep() {
        let h = harness();
        let (user, stake) = user_with_stake(&h, 50).await;
        h.service
            .process_refund(user.id, stake.id, Decimal::from(50), None)
            .await
            .unwrap();
        let pushes_before = h.network.push_count();

        let err = h.service.settle_to_pool(stake.id, None).await.unwrap_err();
        assert!(matches!(err, StakeError::NothingToSettle));
        assert_eq!(h.network.push_count(), pushes_before);

        let closed = h.service.get_stake(stake.id).await.unwrap();
        assert_eq!(closed.status, StakeStatus::Closed);

        let pool = h.service.pool_summary().await.unwrap();
        assert_eq!(pool.amount_total, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_settle_closed_stake_is_rejected() {
        let h = harness();
        let (_, stake) = user_with_stake(&h, 100).await;
        h.service.settle_to_pool(stake.id, None).await.unwrap();

        let err = h.service.settle_to_pool(stake.id, None).await.unwrap_err();
        assert!(matches!(err, StakeError::StakeAlreadyClosed));
    }

    #[tokio::test]
    async fn test_settle_replay_returns_original_outcome() {
        let h = harness();
        let (_, stake) = user_with_stake(&h, 100).await;

        let first = h
            .service
            .settle_to_pool(stake.id, Some("settle-1".into()))
            .await
            .unwrap();
        let second = h
            .service
            .settle_to_pool(stake.id, Some("settle-1".into()))
            .await
            .unwrap();
        assert_eq!(first.transfer_id, second.transfer_id);
        assert_eq!(h.network.push_count(), 1);

        let pool = h.service.pool_summary().await.unwrap();
        assert_eq!(pool.amount_total, Decimal::from(100));
    }

    #[tokio::test]
    async fn test_refund_after_close_is_rejected() {
        let h = harness();
        let (user, stake) = user_with_stake(&h, 100).await;
        h.service.settle_to_pool(stake.id, None).await.unwrap();

        let err = h
            .service
            .process_refund(user.id, stake.id, Decimal::from(10), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StakeError::StakeAlreadyClosed));
    }

    #[tokio::test]
    async fn test_one_active_stake_per_user() {
        let h = harness();
        let (user, stake) = user_with_stake(&h, 100).await;

        let err = h
            .service
            .create_stake(user.id, Decimal::from(10))
            .await
            .unwrap_err();
        assert!(matches!(err, StakeError::DuplicateActiveStake));

        h.service.settle_to_pool(stake.id, None).await.unwrap();
        let next = h
            .service
            .create_stake(user.id, Decimal::from(10))
            .await
            .unwrap();
        assert_eq!(next.amount_total, Decimal::from(10));
    }

    #[tokio::test]
    async fn test_create_stake_validation() {
        let h = harness();
        let err = h
            .service
            .create_stake(Uuid::new_v4(), Decimal::from(10))
            .await
            .unwrap_err();
        assert!(matches!(err, StakeError::UserNotFound));

        let user = h
            .service
            .create_user("bob", "4957030420210454")
            .await
            .unwrap();
        let err = h
            .service
            .create_stake(user.id, Decimal::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, StakeError::InvalidAmount));
    }

    #[tokio::test]
    async fn test_create_user_masks_pan() {
        let h = harness();
        let user = h
            .service
            .create_user("carol", "4957-0304-2021-0454")
            .await
            .unwrap();
        assert_eq!(user.pan_masked, "****0454");
        assert_eq!(user.card_last4, "0454");

        let err = h.service.create_user("dave", "123").await.unwrap_err();
        assert!(matches!(err, StakeError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_idempotency_key_cannot_switch_operations() {
        let h = harness();
        let (user, stake) = user_with_stake(&h, 100).await;
        h.service
            .process_refund(user.id, stake.id, Decimal::from(20), Some("shared".into()))
            .await
            .unwrap();
        let pushes = h.network.push_count();

        // Reusing the refund's key for a settlement must not fabricate a
        // settlement outcome from the refund's recorded transfer.
        let err = h
            .service
            .settle_to_pool(stake.id, Some("shared".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StakeError::InvalidRequest(_)));
        assert_eq!(h.network.push_count(), pushes);

        let current = h.service.get_stake(stake.id).await.unwrap();
        assert_eq!(current.status, StakeStatus::Held);
        let pool = h.service.pool_summary().await.unwrap();
        assert_eq!(pool.amount_total, Decimal::ZERO);

        // And the reverse direction after a real sweep.
        h.service
            .settle_to_pool(stake.id, Some("sweep".into()))
            .await
            .unwrap();
        let err = h
            .service
            .process_refund(user.id, stake.id, Decimal::from(10), Some("sweep".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StakeError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_refund_commit_conflict_exhaustion_is_not_retryable() {
        let h = harness_with(
            Arc::new(ConflictingStore {
                inner: MemoryLedgerStore::new(),
            }),
            RecipientValidation::Advisory,
        );
        let (user, stake) = user_with_stake(&h, 100).await;

        let err = h
            .service
            .process_refund(user.id, stake.id, Decimal::from(30), Some("k1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StakeError::AmbiguousTransferOutcome(_)));
        assert!(!err.is_safe_to_retry());
        assert_eq!(h.network.push_count(), 1);

        // The operation stays PENDING, so the same key never pushes again.
        let err = h
            .service
            .process_refund(user.id, stake.id, Decimal::from(30), Some("k1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StakeError::AmbiguousTransferOutcome(_)));
        assert_eq!(h.network.push_count(), 1);
    }

    #[tokio::test]
    async fn test_settlement_commit_conflict_exhaustion_is_not_retryable() {
        let h = harness_with(
            Arc::new(ConflictingStore {
                inner: MemoryLedgerStore::new(),
            }),
            RecipientValidation::Advisory,
        );
        let (_, stake) = user_with_stake(&h, 100).await;

        let err = h
            .service
            .settle_to_pool(stake.id, Some("s1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StakeError::AmbiguousTransferOutcome(_)));
        assert!(!err.is_safe_to_retry());
        assert_eq!(h.network.push_count(), 1);
    }

    #[tokio::test]
    async fn test_required_policy_rejects_unverifiable_card() {
        let h = harness_with(
            Arc::new(MemoryLedgerStore::new()),
            RecipientValidation::Required,
        );

        // Inquiry unreachable: no transfer was attempted, so the caller gets
        // a validation error, not a transfer failure.
        h.network.set_behavior(MockBehavior::NetworkDown);
        let err = h
            .service
            .create_user("erin", "4957030420210454")
            .await
            .unwrap_err();
        assert!(matches!(err, StakeError::InvalidRequest(_)));

        // Card reported as unable to receive pushes.
        h.network.set_behavior(MockBehavior::Decline);
        let err = h
            .service
            .create_user("erin", "4957030420210454")
            .await
            .unwrap_err();
        assert!(matches!(err, StakeError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_advisory_policy_registers_despite_inquiry_failure() {
        let h = harness();
        h.network.set_behavior(MockBehavior::NetworkDown);
        assert!(
            h.service
                .create_user("erin", "4957030420210454")
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_stakes_listing_includes_transfers() {
        let h = harness();
        let (user, stake) = user_with_stake(&h, 100).await;
        h.service
            .process_refund(user.id, stake.id, Decimal::from(10), None)
            .await
            .unwrap();
        h.service
            .process_refund(user.id, stake.id, Decimal::from(15), None)
            .await
            .unwrap();

        let stakes = h.service.stakes_for_user(user.id).await.unwrap();
        assert_eq!(stakes.len(), 1);
        assert_eq!(stakes[0].stake.id, stake.id);
        assert_eq!(stakes[0].transfers.len(), 2);
    }
}
