//! Ledger entity types
//!
//! The four persisted entities (User, Stake, Transfer, Pool) plus the
//! operation records used by the reconciliation/idempotency layer.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier for one refund/settlement attempt in the reconciliation layer.
///
/// ULID-based: lexically sortable by creation time, generated without
/// coordination. Doubles as the engine-generated idempotency key when the
/// caller does not supply one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(Ulid);

impl OperationId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for OperationId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

// ============================================================================
// Enums
// ============================================================================

/// Stake lifecycle status. Transitions HELD -> CLOSED exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StakeStatus {
    Held,
    Closed,
}

impl StakeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StakeStatus::Held => "HELD",
            StakeStatus::Closed => "CLOSED",
        }
    }

    pub fn from_str_db(s: &str) -> Option<Self> {
        match s {
            "HELD" => Some(StakeStatus::Held),
            "CLOSED" => Some(StakeStatus::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for StakeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a funds movement as seen from the escrow wallet.
///
/// All movements this engine performs today are PUSH (escrow -> card or
/// escrow -> pool account). PULL exists for the card-pull that funds a stake,
/// which is a collaborator concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferDirection {
    Push,
    Pull,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Push => "PUSH",
            TransferDirection::Pull => "PULL",
        }
    }

    pub fn from_str_db(s: &str) -> Option<Self> {
        match s {
            "PUSH" => Some(TransferDirection::Push),
            "PULL" => Some(TransferDirection::Pull),
            _ => None,
        }
    }
}

/// Which ledger operation an attempt record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Refund,
    Settlement,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Refund => "REFUND",
            OperationKind::Settlement => "SETTLEMENT",
        }
    }

    pub fn from_str_db(s: &str) -> Option<Self> {
        match s {
            "REFUND" => Some(OperationKind::Refund),
            "SETTLEMENT" => Some(OperationKind::Settlement),
            _ => None,
        }
    }
}

/// Outcome state of one external-call attempt.
///
/// PENDING covers both "in flight" and "outcome unknown" (timeout). A PENDING
/// record is never silently re-armed: a replay against it surfaces an
/// ambiguous-outcome error so the operator reconciles first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    Pending,
    Succeeded,
    Failed,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Pending => "PENDING",
            OperationState::Succeeded => "SUCCEEDED",
            OperationState::Failed => "FAILED",
        }
    }

    pub fn from_str_db(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OperationState::Pending),
            "SUCCEEDED" => Some(OperationState::Succeeded),
            "FAILED" => Some(OperationState::Failed),
            _ => None,
        }
    }
}

// ============================================================================
// Entities
// ============================================================================

/// Registered user. Immutable after creation except for the display name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    /// Masked primary account number, e.g. "****1234". The real PAN never
    /// enters this store; it lives behind the card vault.
    pub pan_masked: String,
    pub card_last4: String,
    pub created_at: DateTime<Utc>,
}

/// Input for user registration.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub pan_masked: String,
    pub card_last4: String,
}

/// An escrow commitment of funds for one user.
///
/// Invariants (enforced by StakeService + the store):
/// - `0 <= amount_refunded <= amount_total`
/// - at most one HELD stake per user
/// - status moves HELD -> CLOSED exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stake {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount_total: Decimal,
    pub amount_refunded: Decimal,
    pub status: StakeStatus,
    /// Optimistic concurrency counter. Every balance/status mutation bumps it;
    /// commits carry the version they read and fail on mismatch.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Stake {
    /// Unreturned balance still held in escrow.
    pub fn remaining(&self) -> Decimal {
        self.amount_total - self.amount_refunded
    }
}

/// Immutable audit row for one attempted or completed funds movement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Pool sweeps keep the originating stake here as well.
    pub stake_id: Option<Uuid>,
    pub direction: TransferDirection,
    pub amount: Decimal,
    /// Opaque status string reported by the payment network.
    pub visa_status: String,
    pub visa_transfer_id: String,
    /// Raw response payload, kept verbatim for audit.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Input for the append-only transfer insert.
#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub user_id: Uuid,
    pub stake_id: Option<Uuid>,
    pub direction: TransferDirection,
    pub amount: Decimal,
    pub visa_status: String,
    pub visa_transfer_id: String,
    pub metadata: serde_json::Value,
}

/// Singleton aggregate of all funds swept in from closed stakes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub amount_total: Decimal,
    pub last_settlement_at: Option<DateTime<Utc>>,
}

/// Stake together with its transfers, newest transfer first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakeWithTransfers {
    pub stake: Stake,
    pub transfers: Vec<Transfer>,
}

// ============================================================================
// Reconciliation layer records
// ============================================================================

/// One recorded refund/settlement attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRecord {
    pub id: OperationId,
    pub stake_id: Uuid,
    pub idempotency_key: String,
    pub kind: OperationKind,
    pub amount: Decimal,
    pub state: OperationState,
    pub transfer_id: Option<Uuid>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for claiming an operation slot before the external call.
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub id: OperationId,
    pub stake_id: Uuid,
    pub idempotency_key: String,
    pub kind: OperationKind,
    pub amount: Decimal,
}

/// Result of attempting to claim `(stake_id, idempotency_key)`.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationClaim {
    /// Slot is ours: freshly inserted, or a previously FAILED attempt re-armed.
    Fresh(OperationRecord),
    /// A prior attempt with this key is PENDING - its outcome is unknown.
    InFlight(OperationRecord),
    /// A prior attempt with this key already succeeded.
    Completed(OperationRecord),
}

// ============================================================================
// Service outcomes
// ============================================================================

/// Result of a successful refund.
#[derive(Debug, Clone, PartialEq)]
pub struct RefundOutcome {
    pub transfer_id: Uuid,
    pub visa_transfer_id: String,
    pub amount: Decimal,
    pub visa_status: String,
    pub remaining_balance: Decimal,
}

/// Result of a successful pool settlement.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementOutcome {
    pub transfer_id: Uuid,
    pub visa_transfer_id: String,
    pub amount: Decimal,
    pub stake_status: StakeStatus,
}

/// Pool aggregate for the read API. Zero before the first settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSummary {
    pub amount_total: Decimal,
    pub last_settlement_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Helpers
// ============================================================================

/// Mask a PAN down to its last four digits, e.g. "****1234".
///
/// Returns the masked form and the last-4 digits. Short inputs are masked
/// in full rather than rejected; format validation is the caller's job.
pub fn mask_pan(pan: &str) -> (String, String) {
    let digits: String = pan.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() <= 4 {
        return ("****".to_string(), digits);
    }
    let last4 = digits[digits.len() - 4..].to_string();
    (format!("****{}", last4), last4)
}
