//! Visa Direct HTTP client.
//!
//! Talks to the Visa Direct funds-transfer API (OCT push + PAAI card
//! attribute inquiry) with mutual-TLS-terminated basic auth. The error
//! mapping here is the load-bearing part: a declined push and an unreachable
//! network are definitive (funds did not move), while a timeout or a 5xx
//! after the request went out are ambiguous and must never be retried
//! blindly by the caller.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use super::{
    PaymentNetworkClient, PaymentNetworkError, PushFundsRequest, PushFundsReceipt,
    RecipientAttributes,
};
use crate::config::VisaConfig;
use async_trait::async_trait;

pub struct VisaDirectClient {
    http: reqwest::Client,
    base_url: String,
    user_id: String,
    password: String,
    acquiring_bin: String,
}

impl VisaDirectClient {
    pub fn new(config: &VisaConfig) -> Result<Self, PaymentNetworkError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| PaymentNetworkError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user_id: config.user_id.clone(),
            password: config.password.clone(),
            acquiring_bin: config.acquiring_bin.clone(),
        })
    }

    fn map_request_err(err: reqwest::Error) -> PaymentNetworkError {
        if err.is_timeout() {
            // The push may have been processed before the deadline hit.
            PaymentNetworkError::Ambiguous(format!("request timed out: {err}"))
        } else if err.is_connect() {
            PaymentNetworkError::Network(format!("connect failed: {err}"))
        } else {
            PaymentNetworkError::Network(err.to_string())
        }
    }

    /// Classify a non-2xx response once the request is known to have
    /// reached the network.
    fn map_status(status: reqwest::StatusCode, body: &Value) -> PaymentNetworkError {
        let detail = body
            .get("errorMessage")
            .and_then(Value::as_str)
            .unwrap_or("no detail")
            .to_string();
        if status.is_server_error() {
            PaymentNetworkError::Ambiguous(format!("network returned {status}: {detail}"))
        } else {
            PaymentNetworkError::Declined(format!("{status}: {detail}"))
        }
    }
}

#[async_trait]
impl PaymentNetworkClient for VisaDirectClient {
    fn name(&self) -> &str {
        "visa-direct"
    }

    async fn validate_recipient(
        &self,
        pan: &str,
    ) -> Result<RecipientAttributes, PaymentNetworkError> {
        let url = format!(
            "{}/paai/fundstransferattinq/v1/cardattributes/fundstransferinquiry",
            self.base_url
        );
        let body = serde_json::json!({
            "primaryAccountNumber": pan,
        });

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.user_id, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(Self::map_request_err)?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| PaymentNetworkError::InvalidResponse(e.to_string()))?;
        if !status.is_success() {
            return Err(Self::map_status(status, &payload));
        }

        // The inquiry reports capability flags per card; absence means no.
        let push_funds_enabled = payload
            .pointer("/cardTypeCode")
            .and_then(Value::as_str)
            .map(|_| true)
            .unwrap_or(false)
            && payload
                .get("pushFundsBlockIndicator")
                .and_then(Value::as_str)
                .map(|v| v != "B")
                .unwrap_or(true);
        let fast_funds = payload
            .get("fastFundsIndicator")
            .and_then(Value::as_str)
            .map(|v| v != "N")
            .unwrap_or(false);

        debug!(push_funds_enabled, fast_funds, "recipient attribute inquiry");
        Ok(RecipientAttributes {
            push_funds_enabled,
            fast_funds,
        })
    }

    async fn push_funds(
        &self,
        request: &PushFundsRequest,
    ) -> Result<PushFundsReceipt, PaymentNetworkError> {
        let url = format!(
            "{}/visadirect/fundstransfer/v1/pushfundstransactions",
            self.base_url
        );
        let body = serde_json::json!({
            "acquiringBin": self.acquiring_bin,
            "amount": request.amount.to_string(),
            "businessApplicationId": "FD",
            "senderPrimaryAccountNumber": request.sender.pan,
            "senderCardExpiryDate": request.sender.expiry,
            "recipientPrimaryAccountNumber": request.recipient_pan,
            "retrievalReferenceNumber": request.reference,
            "transactionCurrencyCode": "USD",
        });

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.user_id, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(Self::map_request_err)?;

        let status = response.status();
        let payload: Value = response.json().await.map_err(|e| {
            // Body arrived broken after a 2xx: the push may have landed.
            if status.is_success() {
                PaymentNetworkError::Ambiguous(format!("unreadable success body: {e}"))
            } else {
                PaymentNetworkError::InvalidResponse(e.to_string())
            }
        })?;
        if !status.is_success() {
            let err = Self::map_status(status, &payload);
            warn!(%status, reference = %request.reference, "push funds rejected");
            return Err(err);
        }

        let transaction_id = payload
            .get("transactionIdentifier")
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .ok_or_else(|| {
                PaymentNetworkError::Ambiguous(
                    "2xx response without transactionIdentifier".to_string(),
                )
            })?;
        let action_code = payload
            .get("actionCode")
            .and_then(Value::as_str)
            .unwrap_or("00")
            .to_string();
        // Action code 00 is approval; anything else on a 2xx is a decline
        // reported in-band.
        if action_code != "00" {
            return Err(PaymentNetworkError::Declined(format!(
                "action code {action_code}"
            )));
        }

        debug!(%transaction_id, reference = %request.reference, "push funds approved");
        Ok(PushFundsReceipt {
            visa_transfer_id: transaction_id,
            status: format!("APPROVED:{action_code}"),
            raw: payload,
        })
    }
}
