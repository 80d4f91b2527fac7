//! PostgreSQL LedgerStore.
//!
//! All multi-row mutations run inside one transaction with the stake row
//! locked via `SELECT ... FOR UPDATE`, so the version/status/balance checks
//! and the writes they guard cannot interleave with a concurrent committer.
//! Single-active-stake is enforced by the partial unique index
//! `one_held_stake_per_user` rather than a check-then-insert race.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::store::{LedgerStore, StoreError};
use super::types::{
    NewOperation, NewTransfer, NewUser, OperationClaim, OperationId, OperationKind,
    OperationRecord, OperationState, Pool, Stake, StakeStatus, StakeWithTransfers, Transfer,
    TransferDirection, User,
};

pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const STAKE_COLS: &str =
    "id, user_id, amount_total, amount_refunded, status, version, created_at, closed_at";
const TRANSFER_COLS: &str =
    "id, user_id, stake_id, direction, amount, visa_status, visa_transfer_id, metadata, created_at";
const OPERATION_COLS: &str = "id, stake_id, idempotency_key, kind, amount, state, transfer_id, \
                              error_message, created_at, updated_at";

// ============================================================================
// Row mapping
// ============================================================================

fn row_to_user(row: &PgRow) -> Result<User, StoreError> {
    Ok(User {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        pan_masked: row.try_get("pan_masked")?,
        card_last4: row.try_get("card_last4")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_stake(row: &PgRow) -> Result<Stake, StoreError> {
    let status_str: String = row.try_get("status")?;
    let status = StakeStatus::from_str_db(&status_str)
        .ok_or_else(|| StoreError::Corrupt(format!("invalid stake status: {status_str}")))?;
    Ok(Stake {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        amount_total: row.try_get("amount_total")?,
        amount_refunded: row.try_get("amount_refunded")?,
        status,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        closed_at: row.try_get("closed_at")?,
    })
}

fn row_to_transfer(row: &PgRow) -> Result<Transfer, StoreError> {
    let direction_str: String = row.try_get("direction")?;
    let direction = TransferDirection::from_str_db(&direction_str)
        .ok_or_else(|| StoreError::Corrupt(format!("invalid transfer direction: {direction_str}")))?;
    Ok(Transfer {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        stake_id: row.try_get("stake_id")?,
        direction,
        amount: row.try_get("amount")?,
        visa_status: row.try_get("visa_status")?,
        visa_transfer_id: row.try_get("visa_transfer_id")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_operation(row: &PgRow) -> Result<OperationRecord, StoreError> {
    let id_str: String = row.try_get("id")?;
    let id: OperationId = id_str
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("invalid operation id: {id_str}")))?;
    let kind_str: String = row.try_get("kind")?;
    let kind = OperationKind::from_str_db(&kind_str)
        .ok_or_else(|| StoreError::Corrupt(format!("invalid operation kind: {kind_str}")))?;
    let state_str: String = row.try_get("state")?;
    let state = OperationState::from_str_db(&state_str)
        .ok_or_else(|| StoreError::Corrupt(format!("invalid operation state: {state_str}")))?;
    Ok(OperationRecord {
        id,
        stake_id: row.try_get("stake_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        kind,
        amount: row.try_get("amount")?,
        state,
        transfer_id: row.try_get("transfer_id")?,
        error: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Map unique/foreign-key violations from stake inserts onto store errors.
fn map_stake_insert_err(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db) = err {
        match db.constraint() {
            Some("one_held_stake_per_user") => return StoreError::DuplicateActiveStake,
            Some("stakes_tb_user_id_fkey") => return StoreError::UserNotFound,
            _ => {}
        }
    }
    StoreError::Database(err)
}

async fn insert_transfer(
    tx: &mut sqlx::PgTransaction<'_>,
    transfer: &NewTransfer,
) -> Result<Transfer, StoreError> {
    let row = sqlx::query(&format!(
        "INSERT INTO transfers_tb \
             (id, user_id, stake_id, direction, amount, visa_status, visa_transfer_id, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING {TRANSFER_COLS}"
    ))
    .bind(Uuid::new_v4())
    .bind(transfer.user_id)
    .bind(transfer.stake_id)
    .bind(transfer.direction.as_str())
    .bind(transfer.amount)
    .bind(&transfer.visa_status)
    .bind(&transfer.visa_transfer_id)
    .bind(&transfer.metadata)
    .fetch_one(&mut **tx)
    .await?;
    row_to_transfer(&row)
}

/// Lock the stake row and run the shared HELD/version guard.
async fn lock_stake(
    tx: &mut sqlx::PgTransaction<'_>,
    stake_id: Uuid,
    expected_version: i64,
) -> Result<Stake, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {STAKE_COLS} FROM stakes_tb WHERE id = $1 FOR UPDATE"
    ))
    .bind(stake_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(StoreError::StakeNotFound)?;
    let stake = row_to_stake(&row)?;
    if stake.status != StakeStatus::Held {
        return Err(StoreError::StakeNotHeld);
    }
    if stake.version != expected_version {
        return Err(StoreError::VersionConflict);
    }
    Ok(stake)
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn create_user(&self, user: NewUser) -> Result<User, StoreError> {
        let row = sqlx::query(
            "INSERT INTO users_tb (id, name, pan_masked, card_last4) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, name, pan_masked, card_last4, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(&user.name)
        .bind(&user.pan_masked)
        .bind(&user.card_last4)
        .fetch_one(&self.pool)
        .await?;
        row_to_user(&row)
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, pan_masked, card_last4, created_at FROM users_tb WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, pan_masked, card_last4, created_at FROM users_tb \
             ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_user).collect()
    }

    async fn create_stake(&self, user_id: Uuid, amount_total: Decimal) -> Result<Stake, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO stakes_tb (id, user_id, amount_total) \
             VALUES ($1, $2, $3) \
             RETURNING {STAKE_COLS}"
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(amount_total)
        .fetch_one(&self.pool)
        .await
        .map_err(map_stake_insert_err)?;
        row_to_stake(&row)
    }

    async fn get_stake(&self, id: Uuid) -> Result<Option<Stake>, StoreError> {
        let row = sqlx::query(&format!("SELECT {STAKE_COLS} FROM stakes_tb WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_stake).transpose()
    }

    async fn stakes_for_user(&self, user_id: Uuid) -> Result<Vec<StakeWithTransfers>, StoreError> {
        let stake_rows = sqlx::query(&format!(
            "SELECT {STAKE_COLS} FROM stakes_tb WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        let stakes: Vec<Stake> = stake_rows.iter().map(row_to_stake).collect::<Result<_, _>>()?;

        let transfer_rows = sqlx::query(&format!(
            "SELECT {TRANSFER_COLS} FROM transfers_tb \
             WHERE user_id = $1 AND stake_id IS NOT NULL \
             ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        let transfers: Vec<Transfer> = transfer_rows
            .iter()
            .map(row_to_transfer)
            .collect::<Result<_, _>>()?;

        Ok(stakes
            .into_iter()
            .map(|stake| {
                let mine: Vec<Transfer> = transfers
                    .iter()
                    .filter(|t| t.stake_id == Some(stake.id))
                    .cloned()
                    .collect();
                StakeWithTransfers {
                    stake,
                    transfers: mine,
                }
            })
            .collect())
    }

    async fn transfers_for_user(&self, user_id: Uuid) -> Result<Vec<Transfer>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSFER_COLS} FROM transfers_tb WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_transfer).collect()
    }

    async fn get_transfer(&self, id: Uuid) -> Result<Option<Transfer>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TRANSFER_COLS} FROM transfers_tb WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_transfer).transpose()
    }

    async fn commit_refund(
        &self,
        stake_id: Uuid,
        expected_version: i64,
        transfer: NewTransfer,
    ) -> Result<(Transfer, Stake), StoreError> {
        let mut tx = self.pool.begin().await?;

        let stake = lock_stake(&mut tx, stake_id, expected_version).await?;
        if stake.amount_refunded + transfer.amount > stake.amount_total {
            return Err(StoreError::BalanceExceeded);
        }

        let recorded = insert_transfer(&mut tx, &transfer).await?;

        let row = sqlx::query(&format!(
            "UPDATE stakes_tb \
             SET amount_refunded = amount_refunded + $2, version = version + 1 \
             WHERE id = $1 \
             RETURNING {STAKE_COLS}"
        ))
        .bind(stake_id)
        .bind(transfer.amount)
        .fetch_one(&mut *tx)
        .await?;
        let updated = row_to_stake(&row)?;

        tx.commit().await?;
        Ok((recorded, updated))
    }

    async fn commit_settlement(
        &self,
        stake_id: Uuid,
        expected_version: i64,
        transfer: NewTransfer,
    ) -> Result<(Transfer, Stake, Pool), StoreError> {
        let mut tx = self.pool.begin().await?;

        lock_stake(&mut tx, stake_id, expected_version).await?;
        let recorded = insert_transfer(&mut tx, &transfer).await?;

        let row = sqlx::query(&format!(
            "UPDATE stakes_tb \
             SET status = 'CLOSED', closed_at = NOW(), version = version + 1 \
             WHERE id = $1 \
             RETURNING {STAKE_COLS}"
        ))
        .bind(stake_id)
        .fetch_one(&mut *tx)
        .await?;
        let closed = row_to_stake(&row)?;

        // Lazily created on first settlement; singleton row pinned at id = 1.
        let pool_row = sqlx::query(
            "INSERT INTO pool_tb (id, amount_total, last_settlement_at) \
             VALUES (1, $1, NOW()) \
             ON CONFLICT (id) DO UPDATE \
                 SET amount_total = pool_tb.amount_total + EXCLUDED.amount_total, \
                     last_settlement_at = EXCLUDED.last_settlement_at \
             RETURNING amount_total, last_settlement_at",
        )
        .bind(transfer.amount)
        .fetch_one(&mut *tx)
        .await?;
        let pool = Pool {
            amount_total: pool_row.try_get("amount_total")?,
            last_settlement_at: pool_row.try_get("last_settlement_at")?,
        };

        tx.commit().await?;
        Ok((recorded, closed, pool))
    }

    async fn close_stake(
        &self,
        stake_id: Uuid,
        expected_version: i64,
    ) -> Result<Stake, StoreError> {
        let mut tx = self.pool.begin().await?;
        lock_stake(&mut tx, stake_id, expected_version).await?;
        let row = sqlx::query(&format!(
            "UPDATE stakes_tb \
             SET status = 'CLOSED', closed_at = NOW(), version = version + 1 \
             WHERE id = $1 \
             RETURNING {STAKE_COLS}"
        ))
        .bind(stake_id)
        .fetch_one(&mut *tx)
        .await?;
        let closed = row_to_stake(&row)?;
        tx.commit().await?;
        Ok(closed)
    }

    async fn get_pool(&self) -> Result<Option<Pool>, StoreError> {
        let row = sqlx::query("SELECT amount_total, last_settlement_at FROM pool_tb WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(Pool {
                amount_total: row.try_get("amount_total")?,
                last_settlement_at: row.try_get("last_settlement_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn claim_operation(&self, op: NewOperation) -> Result<OperationClaim, StoreError> {
        // Atomic claim: exactly one inserter wins the (stake_id, key) slot.
        let inserted = sqlx::query(&format!(
            "INSERT INTO ledger_operations_tb (id, stake_id, idempotency_key, kind, amount, state) \
             VALUES ($1, $2, $3, $4, $5, 'PENDING') \
             ON CONFLICT (stake_id, idempotency_key) DO NOTHING \
             RETURNING {OPERATION_COLS}"
        ))
        .bind(op.id.to_string())
        .bind(op.stake_id)
        .bind(&op.idempotency_key)
        .bind(op.kind.as_str())
        .bind(op.amount)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = inserted {
            return Ok(OperationClaim::Fresh(row_to_operation(&row)?));
        }

        let row = sqlx::query(&format!(
            "SELECT {OPERATION_COLS} FROM ledger_operations_tb \
             WHERE stake_id = $1 AND idempotency_key = $2"
        ))
        .bind(op.stake_id)
        .bind(&op.idempotency_key)
        .fetch_one(&self.pool)
        .await?;
        let existing = row_to_operation(&row)?;
        if existing.kind != op.kind {
            return Err(StoreError::OperationKindMismatch);
        }

        match existing.state {
            OperationState::Pending => Ok(OperationClaim::InFlight(existing)),
            OperationState::Succeeded => Ok(OperationClaim::Completed(existing)),
            OperationState::Failed => {
                // Re-arm via CAS; a racing retry that beats us leaves it PENDING.
                let rearmed = sqlx::query(&format!(
                    "UPDATE ledger_operations_tb \
                     SET state = 'PENDING', amount = $2, error_message = NULL, updated_at = NOW() \
                     WHERE id = $1 AND state = 'FAILED' \
                     RETURNING {OPERATION_COLS}"
                ))
                .bind(existing.id.to_string())
                .bind(op.amount)
                .fetch_optional(&self.pool)
                .await?;
                match rearmed {
                    Some(row) => Ok(OperationClaim::Fresh(row_to_operation(&row)?)),
                    None => Ok(OperationClaim::InFlight(existing)),
                }
            }
        }
    }

    async fn complete_operation(
        &self,
        id: &OperationId,
        transfer_id: Uuid,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE ledger_operations_tb \
             SET state = 'SUCCEEDED', transfer_id = $2, error_message = NULL, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id.to_string())
        .bind(transfer_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::OperationNotFound);
        }
        Ok(())
    }

    async fn fail_operation(&self, id: &OperationId, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE ledger_operations_tb \
             SET state = 'FAILED', error_message = $2, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id.to_string())
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::OperationNotFound);
        }
        Ok(())
    }
}
