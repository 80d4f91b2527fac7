//! Payment network abstraction.
//!
//! `PaymentNetworkClient` is the single seam through which money leaves
//! escrow. The production implementation speaks Visa Direct over HTTPS
//! ([`client::VisaDirectClient`]); tests and simulation mode use
//! [`mock::MockPaymentNetwork`]. Callers treat the network as
//! fire-and-confirm: a push either definitively succeeds, definitively
//! fails, or times out with the outcome unknown, and the error taxonomy
//! keeps those three cases apart.

pub mod client;
pub mod mock;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use client::VisaDirectClient;
pub use mock::MockPaymentNetwork;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum PaymentNetworkError {
    /// The network processed the request and said no. Funds did not move.
    #[error("transfer declined: {0}")]
    Declined(String),

    /// We got a response but could not make sense of it. Treated as
    /// definitive because the network rejected or never accepted the push.
    #[error("invalid network response: {0}")]
    InvalidResponse(String),

    /// The request never reached the network (connect/DNS failure).
    #[error("network unreachable: {0}")]
    Network(String),

    /// The request may or may not have been processed (timeout, 5xx after
    /// the request was sent). The caller must NOT retry blindly.
    #[error("transfer outcome unknown: {0}")]
    Ambiguous(String),
}

impl PaymentNetworkError {
    /// True when funds may have moved despite the error.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, PaymentNetworkError::Ambiguous(_))
    }
}

// ============================================================================
// Wire types
// ============================================================================

/// Full card details for the sending side of a push. Never persisted.
#[derive(Debug, Clone)]
pub struct CardCredential {
    pub pan: String,
    /// Expiry in `YYYY-MM` form.
    pub expiry: String,
}

/// One push-funds request (OCT in Visa Direct terms).
#[derive(Debug, Clone)]
pub struct PushFundsRequest {
    pub sender: CardCredential,
    pub recipient_pan: String,
    pub amount: Decimal,
    /// Caller-scoped reference forwarded to the network for its own
    /// duplicate detection. We use the operation's idempotency key.
    pub reference: String,
}

/// Network confirmation for a completed push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFundsReceipt {
    /// The network's transaction identifier.
    pub visa_transfer_id: String,
    /// Network-reported status string, stored verbatim on the transfer row.
    pub status: String,
    /// Raw response body, kept for audit.
    pub raw: serde_json::Value,
}

/// What the network knows about a recipient card's ability to receive funds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientAttributes {
    pub push_funds_enabled: bool,
    pub fast_funds: bool,
}

// ============================================================================
// Traits
// ============================================================================

/// External payment network used to push funds out of escrow.
#[async_trait]
pub trait PaymentNetworkClient: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Query whether a card can receive pushed funds.
    async fn validate_recipient(
        &self,
        pan: &str,
    ) -> Result<RecipientAttributes, PaymentNetworkError>;

    /// Push funds from the sender card to the recipient card.
    async fn push_funds(
        &self,
        request: &PushFundsRequest,
    ) -> Result<PushFundsReceipt, PaymentNetworkError>;
}

// ============================================================================
// Card vault
// ============================================================================

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("no card on file for user {0}")]
    CardNotFound(Uuid),
}

/// Resolves a user's full card credentials.
///
/// The ledger stores only masked PANs; anything that needs the real number
/// goes through here. The production vault is an external service; this
/// crate ships [`StaticCardVault`] for dev and test environments.
#[async_trait]
pub trait CardVault: Send + Sync {
    async fn card_for_user(&self, user_id: Uuid) -> Result<CardCredential, VaultError>;
}

/// Dev/test vault that hands every user the same configured test card.
pub struct StaticCardVault {
    card: CardCredential,
}

impl StaticCardVault {
    pub fn new(pan: String, expiry: String) -> Self {
        Self {
            card: CardCredential { pan, expiry },
        }
    }
}

#[async_trait]
impl CardVault for StaticCardVault {
    async fn card_for_user(&self, _user_id: Uuid) -> Result<CardCredential, VaultError> {
        Ok(self.card.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguity_classification() {
        assert!(PaymentNetworkError::Ambiguous("timeout".into()).is_ambiguous());
        assert!(!PaymentNetworkError::Declined("57".into()).is_ambiguous());
        assert!(!PaymentNetworkError::Network("refused".into()).is_ambiguous());
    }

    #[tokio::test]
    async fn test_static_vault_returns_configured_card() {
        let vault = StaticCardVault::new("4005520000011126".into(), "2031-12".into());
        let card = vault.card_for_user(Uuid::new_v4()).await.unwrap();
        assert_eq!(card.pan, "4005520000011126");
        assert_eq!(card.expiry, "2031-12");
    }
}
