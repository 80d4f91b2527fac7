//! Simulated payment network for dev and tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{
    PaymentNetworkClient, PaymentNetworkError, PushFundsRequest, PushFundsReceipt,
    RecipientAttributes,
};

/// What the next `push_funds` call should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    Succeed,
    Decline,
    /// Simulate a timeout: outcome unknown to the caller.
    Ambiguous,
    NetworkDown,
}

/// In-process payment network. Every push is approved (or fails) instantly
/// according to the configured behavior; no funds exist anywhere.
pub struct MockPaymentNetwork {
    behavior: Mutex<MockBehavior>,
    pushes: AtomicUsize,
}

impl MockPaymentNetwork {
    pub fn new() -> Self {
        Self {
            behavior: Mutex::new(MockBehavior::Succeed),
            pushes: AtomicUsize::new(0),
        }
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Number of `push_funds` calls that reached the network, regardless of
    /// outcome. Lets tests assert no duplicate pushes happened.
    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }
}

impl Default for MockPaymentNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentNetworkClient for MockPaymentNetwork {
    fn name(&self) -> &str {
        "mock"
    }

    async fn validate_recipient(
        &self,
        pan: &str,
    ) -> Result<RecipientAttributes, PaymentNetworkError> {
        if pan.chars().any(|c| !c.is_ascii_digit()) {
            return Err(PaymentNetworkError::Declined("malformed PAN".to_string()));
        }
        match *self.behavior.lock().unwrap() {
            MockBehavior::Succeed => Ok(RecipientAttributes {
                push_funds_enabled: true,
                fast_funds: true,
            }),
            // A "declined" network answers the inquiry but reports the card
            // as unable to receive pushes.
            MockBehavior::Decline => Ok(RecipientAttributes {
                push_funds_enabled: false,
                fast_funds: false,
            }),
            MockBehavior::Ambiguous => Err(PaymentNetworkError::Ambiguous(
                "request timed out".to_string(),
            )),
            MockBehavior::NetworkDown => Err(PaymentNetworkError::Network(
                "connect failed".to_string(),
            )),
        }
    }

    async fn push_funds(
        &self,
        request: &PushFundsRequest,
    ) -> Result<PushFundsReceipt, PaymentNetworkError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            MockBehavior::Succeed => {
                let id = uuid::Uuid::new_v4();
                Ok(PushFundsReceipt {
                    visa_transfer_id: format!("{:x}", id.simple()),
                    status: "APPROVED:00".to_string(),
                    raw: serde_json::json!({
                        "transactionIdentifier": format!("{:x}", id.simple()),
                        "actionCode": "00",
                        "retrievalReferenceNumber": request.reference,
                        "simulated": true,
                    }),
                })
            }
            MockBehavior::Decline => {
                Err(PaymentNetworkError::Declined("action code 57".to_string()))
            }
            MockBehavior::Ambiguous => Err(PaymentNetworkError::Ambiguous(
                "request timed out".to_string(),
            )),
            MockBehavior::NetworkDown => Err(PaymentNetworkError::Network(
                "connect failed".to_string(),
            )),
        }
    }
}
